//! Integration tests for the queue connection
//!
//! Consumers share one in-memory store and one manual clock, so redelivery
//! timing and delayed delivery are checked without sleeping.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio_test::{assert_err, assert_ok};

use ara_stream_messenger::clock::ManualClock;
use ara_stream_messenger::config::{resolve, TransportOptions};
use ara_stream_messenger::error::QueueError;
use ara_stream_messenger::queue::{Connection, MessageId};
use ara_stream_messenger::redis::{BackendOp, MemoryBackend, MemoryStore};

const STREAM: &str = "messages";
const GROUP: &str = "symfony";

struct Harness {
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
}

impl Harness {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = MemoryStore::new(clock.clone());
        Self { clock, store }
    }

    async fn consumer(&self, name: &str, extra: Value) -> Connection<MemoryBackend> {
        let mut map = extra.as_object().cloned().unwrap_or_default();
        map.insert("consumer".to_string(), json!(name));
        let options: TransportOptions = serde_json::from_value(Value::Object(map)).unwrap();
        let config = resolve("redis://localhost/messages", &options).unwrap();
        Connection::new(config, self.store.backend(), self.clock.clone())
            .await
            .unwrap()
    }

    fn tick(&self) {
        self.clock.advance(Duration::from_millis(1));
    }
}

fn no_headers() -> BTreeMap<String, String> {
    BTreeMap::new()
}

async fn add(connection: &mut Connection<MemoryBackend>, body: &str) -> MessageId {
    connection
        .add(body, &no_headers(), Duration::ZERO)
        .await
        .unwrap()
}

// ============================================================================
// Enqueue and receive
// ============================================================================

#[tokio::test]
async fn test_envelope_is_delivered_as_json() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;

    let headers = BTreeMap::from([("type".to_string(), "T".to_string())]);
    let id = a.add("{\"x\":1}", &headers, Duration::ZERO).await.unwrap();

    let message = a.get().await.unwrap().unwrap();
    assert_eq!(Some(&message.id), id.entry_id());
    assert_eq!(
        message.message(),
        Some(r#"{"body":"{\"x\":1}","headers":{"type":"T"}}"#)
    );
}

#[tokio::test]
async fn test_identical_adds_get_distinct_ids() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;

    add(&mut a, "same").await;
    add(&mut a, "same").await;

    let first = a.get().await.unwrap().unwrap();
    let second = a.get().await.unwrap().unwrap();
    assert_ne!(first.id, second.id);
    assert_eq!(first.message(), second.message());
}

#[tokio::test]
async fn test_consumers_split_the_stream() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;
    let mut b = h.consumer("b", json!({})).await;

    add(&mut a, "one").await;
    add(&mut a, "two").await;

    let for_a = a.get().await.unwrap().unwrap();
    let for_b = b.get().await.unwrap().unwrap();
    assert_ne!(for_a.id, for_b.id);
    assert!(a.get().await.unwrap().is_none());
    assert!(b.get().await.unwrap().is_none());
}

#[tokio::test]
async fn test_empty_stream_returns_none() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;
    assert!(a.get().await.unwrap().is_none());
}

#[tokio::test]
async fn test_without_auto_setup_missing_group_is_transport_error() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({"auto_setup": false})).await;

    let err = assert_err!(a.get().await);
    assert!(matches!(err, QueueError::Transport(ref msg) if msg.starts_with("NOGROUP")));
    assert_eq!(h.store.count(BackendOp::CreateGroup).await, 0);
}

// ============================================================================
// Redelivery
// ============================================================================

#[tokio::test]
async fn test_restarted_consumer_gets_its_pending_message_first() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;
    add(&mut a, "first").await;
    let delivered = a.get().await.unwrap().unwrap();
    add(&mut a, "second").await;
    drop(a);

    let mut restarted = h.consumer("a", json!({})).await;
    let again = restarted.get().await.unwrap().unwrap();

    assert_eq!(again.id, delivered.id);
    assert_eq!(again.message(), delivered.message());
}

#[tokio::test]
async fn test_abandoned_message_is_claimed_after_redeliver_timeout() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;
    let mut b = h.consumer("b", json!({"redeliver_timeout": 1000})).await;

    add(&mut a, "work").await;
    let taken = a.get().await.unwrap().unwrap();

    h.clock.advance(Duration::from_millis(1500));
    let claimed = b.get().await.unwrap().unwrap();

    assert_eq!(claimed.id, taken.id);
    assert_eq!(
        h.store.pending(STREAM, GROUP).await,
        vec![(taken.id.to_string(), "b".to_string())]
    );
}

#[tokio::test]
async fn test_recent_pending_message_is_not_claimed() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;
    let mut b = h
        .consumer("b", json!({"redeliver_timeout": 1000, "claim_interval": 0}))
        .await;

    add(&mut a, "work").await;
    let taken = a.get().await.unwrap().unwrap();

    h.clock.advance(Duration::from_millis(500));
    assert!(b.get().await.unwrap().is_none());
    assert_eq!(h.store.count(BackendOp::Claim).await, 0);

    h.clock.advance(Duration::from_millis(500));
    let claimed = b.get().await.unwrap().unwrap();
    assert_eq!(claimed.id, taken.id);
}

#[tokio::test]
async fn test_claim_attempts_are_throttled() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;
    let mut b = h
        .consumer("b", json!({"redeliver_timeout": 1000, "claim_interval": 60000}))
        .await;

    add(&mut a, "work").await;
    let taken = a.get().await.unwrap().unwrap();
    h.store.clear_commands().await;

    // First attempt happens right away; the entry is not idle long enough yet.
    assert!(b.get().await.unwrap().is_none());
    assert_eq!(h.store.count(BackendOp::PendingSummary).await, 1);

    h.clock.advance(Duration::from_millis(2000));
    assert!(b.get().await.unwrap().is_none());
    assert_eq!(h.store.count(BackendOp::PendingSummary).await, 1);

    h.clock.advance(Duration::from_millis(60000));
    let claimed = b.get().await.unwrap().unwrap();
    assert_eq!(claimed.id, taken.id);
    assert_eq!(h.store.count(BackendOp::PendingSummary).await, 2);
}

#[tokio::test]
async fn test_zero_redeliver_timeout_claims_immediately() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;
    let mut b = h.consumer("b", json!({"redeliver_timeout": 0})).await;

    add(&mut a, "work").await;
    let taken = a.get().await.unwrap().unwrap();

    let claimed = b.get().await.unwrap().unwrap();
    assert_eq!(claimed.id, taken.id);
}

#[tokio::test]
async fn test_lost_claim_race_is_not_an_error() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;
    let mut b = h.consumer("b", json!({"redeliver_timeout": 0})).await;

    add(&mut a, "work").await;
    let taken = a.get().await.unwrap().unwrap();
    h.store.lose_next_claim().await;

    assert!(b.get().await.unwrap().is_none());
    assert_eq!(h.store.count(BackendOp::Claim).await, 1);
    assert_eq!(
        h.store.pending(STREAM, GROUP).await,
        vec![(taken.id.to_string(), "b-rival".to_string())]
    );
}

#[tokio::test]
async fn test_oldest_abandoned_entry_is_claimed_alone() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;
    let mut b = h
        .consumer("b", json!({"redeliver_timeout": 0, "claim_interval": 0}))
        .await;

    add(&mut a, "one").await;
    h.tick();
    add(&mut a, "two").await;
    let oldest = a.get().await.unwrap().unwrap();
    let newest = a.get().await.unwrap().unwrap();

    let claimed = b.get().await.unwrap().unwrap();
    assert_eq!(claimed.id, oldest.id);
    assert_eq!(h.store.count(BackendOp::Claim).await, 1);
    assert_eq!(
        h.store.pending(STREAM, GROUP).await,
        vec![
            (oldest.id.to_string(), "b".to_string()),
            (newest.id.to_string(), "a".to_string()),
        ]
    );
}

#[tokio::test]
async fn test_trimmed_pending_entry_has_empty_data() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({"stream_max_entries": 1})).await;

    add(&mut a, "old").await;
    let delivered = a.get().await.unwrap().unwrap();
    h.tick();
    add(&mut a, "new").await;
    drop(a);

    let mut restarted = h.consumer("a", json!({"stream_max_entries": 1})).await;
    let again = restarted.get().await.unwrap().unwrap();

    assert_eq!(again.id, delivered.id);
    assert!(again.data.is_empty());
}

// ============================================================================
// Delayed delivery
// ============================================================================

#[tokio::test]
async fn test_delayed_message_appears_when_due() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;

    let id = a
        .add("later", &no_headers(), Duration::from_millis(500))
        .await
        .unwrap();
    assert!(id.is_delayed());
    assert_eq!(h.store.delayed_len("messages__queue").await, 1);
    assert!(h.store.stream_ids(STREAM).await.is_empty());

    assert!(a.get().await.unwrap().is_none());
    h.clock.advance(Duration::from_millis(499));
    assert!(a.get().await.unwrap().is_none());

    h.clock.advance(Duration::from_millis(1));
    let message = a.get().await.unwrap().unwrap();
    assert_eq!(message.message(), Some(r#"{"body":"later","headers":{}}"#));
    assert_eq!(h.store.delayed_len("messages__queue").await, 0);
}

#[tokio::test]
async fn test_identical_delayed_messages_are_both_kept() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;

    let first = a.add("same", &no_headers(), Duration::from_secs(1)).await.unwrap();
    let second = a.add("same", &no_headers(), Duration::from_secs(1)).await.unwrap();

    assert_ne!(first, second);
    assert_eq!(h.store.delayed_len("messages__queue").await, 2);

    h.clock.advance(Duration::from_secs(1));
    assert!(a.get().await.unwrap().is_some());
    assert!(a.get().await.unwrap().is_some());
}

#[tokio::test]
async fn test_oversized_delay_writes_nothing() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;

    let err = a
        .add("never", &no_headers(), Duration::from_secs(u64::MAX))
        .await
        .unwrap_err();

    assert!(matches!(err, QueueError::Transport(ref msg) if msg == "Message delay is too big"));
    assert_eq!(h.store.count(BackendOp::Schedule).await, 0);
}

// ============================================================================
// Settlement
// ============================================================================

#[tokio::test]
async fn test_ack_deletes_entry_once() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;
    add(&mut a, "work").await;
    let message = a.get().await.unwrap().unwrap();

    a.ack(&message.id).await.unwrap();

    assert_eq!(h.store.count(BackendOp::Ack).await, 1);
    assert_eq!(h.store.count(BackendOp::Delete).await, 1);
    assert!(h.store.pending(STREAM, GROUP).await.is_empty());
    assert!(h.store.stream_ids(STREAM).await.is_empty());
}

#[tokio::test]
async fn test_ack_keeps_entry_when_delete_disabled() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({"delete_after_ack": false})).await;
    add(&mut a, "work").await;
    let message = a.get().await.unwrap().unwrap();

    a.ack(&message.id).await.unwrap();

    assert_eq!(h.store.count(BackendOp::Delete).await, 0);
    assert!(h.store.pending(STREAM, GROUP).await.is_empty());
    assert_eq!(h.store.stream_ids(STREAM).await, vec![message.id.to_string()]);
}

#[tokio::test]
async fn test_failed_delete_after_ack_keeps_the_ack() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;
    add(&mut a, "work").await;
    let message = a.get().await.unwrap().unwrap();
    h.store
        .fail_next(BackendOp::Delete, "OOM command not allowed")
        .await;

    let err = a.ack(&message.id).await.unwrap_err();

    match err {
        QueueError::Purge { id, reason } => {
            assert_eq!(id, message.id.to_string());
            assert_eq!(reason, "OOM command not allowed");
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(h.store.pending(STREAM, GROUP).await.is_empty());
    assert!(a.get().await.unwrap().is_none());
}

#[tokio::test]
async fn test_reject_is_not_requeued() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({"claim_interval": 0, "redeliver_timeout": 0})).await;
    add(&mut a, "bad").await;
    let message = a.get().await.unwrap().unwrap();

    a.reject(&message.id).await.unwrap();

    assert!(h.store.pending(STREAM, GROUP).await.is_empty());
    assert!(h.store.stream_ids(STREAM).await.is_empty());
    assert!(a.get().await.unwrap().is_none());
}

#[tokio::test]
async fn test_reject_keeps_entry_when_delete_disabled() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({"delete_after_reject": false})).await;
    add(&mut a, "bad").await;
    let message = a.get().await.unwrap().unwrap();

    a.reject(&message.id).await.unwrap();

    assert_eq!(h.store.count(BackendOp::Delete).await, 0);
    assert_eq!(h.store.stream_ids(STREAM).await.len(), 1);
}

#[tokio::test]
async fn test_ack_of_unknown_id_is_not_an_error() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;
    a.setup().await.unwrap();

    let id = ara_stream_messenger::queue::EntryId::new("42-0");
    assert_ok!(a.ack(&id).await);
    assert_ok!(a.ack(&id).await);
    assert_eq!(h.store.count(BackendOp::Ack).await, 2);
    assert_eq!(h.store.count(BackendOp::Delete).await, 2);
}

// ============================================================================
// Error translation
// ============================================================================

#[tokio::test]
async fn test_backend_error_text_is_surfaced() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;
    a.setup().await.unwrap();
    h.store
        .fail_next(BackendOp::Append, "OOM command not allowed when used memory > 'maxmemory'.")
        .await;

    let err = a.add("x", &no_headers(), Duration::ZERO).await.unwrap_err();

    assert!(matches!(
        err,
        QueueError::Transport(ref msg) if msg == "OOM command not allowed when used memory > 'maxmemory'."
    ));
}

#[tokio::test]
async fn test_falsy_result_reports_last_error() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;
    a.setup().await.unwrap();
    h.store
        .fail_next_silently(BackendOp::Append, "ERR real reason")
        .await;

    let err = a.add("x", &no_headers(), Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, QueueError::Transport(ref msg) if msg == "ERR real reason"));

    add(&mut a, "y").await;
}

#[tokio::test]
async fn test_stale_error_does_not_fail_next_call() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;
    a.setup().await.unwrap();
    h.store.leave_stale_error("ERR left over").await;

    add(&mut a, "x").await;

    h.store
        .fail_next_silently(BackendOp::Append, "ERR second")
        .await;
    let err = a.add("y", &no_headers(), Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, QueueError::Transport(ref msg) if msg == "ERR second"));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_setup_is_idempotent() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;

    assert_ok!(a.setup().await);
    assert_ok!(a.setup().await);

    assert_eq!(h.store.count(BackendOp::CreateGroup).await, 2);
    assert!(h.store.exists(STREAM).await);
}

#[tokio::test]
async fn test_auto_setup_runs_once() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;

    add(&mut a, "one").await;
    add(&mut a, "two").await;
    a.get().await.unwrap();

    assert_eq!(h.store.count(BackendOp::CreateGroup).await, 1);
}

#[tokio::test]
async fn test_second_group_with_delete_after_ack_is_refused() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;
    let mut other = h.consumer("a", json!({"group": "audit"})).await;

    a.setup().await.unwrap();
    let err = other.setup().await.unwrap_err();

    assert!(matches!(
        err,
        QueueError::InvalidConfiguration(ref msg) if msg.starts_with("More than one group exists for stream \"messages\"")
    ));
}

#[tokio::test]
async fn test_second_group_without_deletes_is_allowed() {
    let h = Harness::new();
    let mut a = h
        .consumer("a", json!({"delete_after_ack": false, "delete_after_reject": false}))
        .await;
    let mut other = h
        .consumer("a", json!({"group": "audit", "delete_after_ack": false, "delete_after_reject": false}))
        .await;

    a.setup().await.unwrap();
    other.setup().await.unwrap();

    add(&mut a, "fan-out").await;
    assert!(a.get().await.unwrap().is_some());
    assert!(other.get().await.unwrap().is_some());
}

#[tokio::test]
async fn test_cleanup_removes_stream_and_delay_set() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;
    add(&mut a, "now").await;
    a.add("later", &no_headers(), Duration::from_secs(60))
        .await
        .unwrap();

    a.cleanup().await.unwrap();

    assert!(!h.store.exists(STREAM).await);
    assert!(!h.store.exists("messages__queue").await);

    add(&mut a, "again").await;
    assert_eq!(h.store.count(BackendOp::CreateGroup).await, 2);
    assert!(a.get().await.unwrap().is_some());
}

#[tokio::test]
async fn test_message_count() {
    let h = Harness::new();
    let mut a = h.consumer("a", json!({})).await;

    assert_eq!(a.message_count().await.unwrap(), 0);

    add(&mut a, "one").await;
    add(&mut a, "two").await;
    add(&mut a, "three").await;
    a.get().await.unwrap().unwrap();

    assert_eq!(a.message_count().await.unwrap(), 2);
}
