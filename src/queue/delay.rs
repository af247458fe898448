//! Delayed delivery.
//!
//! Delayed messages live in a sorted set next to the stream, scored by due
//! time in milliseconds. Members are `<synthetic id>:<encoded envelope>`; the id
//! prefix keeps identical payloads apart. Due members are moved into the stream
//! by one atomic backend call at the start of every `get`.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::clock::Clock;
use crate::error::{BackendError, ErrorTranslator, QueueError, Result};
use crate::metrics::QueueMetrics;
use crate::redis::StreamBackend;

use super::models::SyntheticId;

/// Members moved per flush.
pub const FLUSH_BATCH: usize = 100;

pub struct DelayScheduler {
    key: String,
    sequence: u32,
    clock: Arc<dyn Clock>,
}

impl DelayScheduler {
    pub fn new(key: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            key: key.into(),
            sequence: rand::rng().random_range(0..SyntheticId::SEQUENCE_MODULUS),
            clock,
        }
    }

    /// Key of the sorted set.
    pub fn key(&self) -> &str {
        &self.key
    }

    fn next_id(&mut self) -> SyntheticId {
        self.sequence = (self.sequence + 1) % SyntheticId::SEQUENCE_MODULUS;
        SyntheticId::new(self.clock.now_micros(), self.sequence)
    }

    /// Park `payload` until `delay` has elapsed.
    pub async fn schedule<B: StreamBackend>(
        &mut self,
        backend: &mut B,
        payload: &[u8],
        delay: Duration,
    ) -> Result<SyntheticId> {
        let due_ms = i64::try_from(delay.as_millis())
            .ok()
            .and_then(|ms| self.clock.now_ms().checked_add(ms))
            .ok_or_else(|| QueueError::transport("Message delay is too big"))?;

        let id = self.next_id();
        let mut member = Vec::with_capacity(id.as_str().len() + 1 + payload.len());
        member.extend_from_slice(id.as_str().as_bytes());
        member.push(b':');
        member.extend_from_slice(payload);

        let result = backend
            .schedule(&self.key, due_ms, &member)
            .await
            .and_then(|added| {
                if added {
                    Ok(())
                } else {
                    Err(BackendError::Rejected(
                        "Could not add a message to the redis stream.".to_string(),
                    ))
                }
            });
        ErrorTranslator::settle("zadd", result, backend.take_last_error(), id.as_str())?;

        QueueMetrics::record_delayed();
        tracing::debug!(
            id = %id,
            key = %self.key,
            due_ms = due_ms,
            "Message scheduled for delayed delivery"
        );

        Ok(id)
    }

    /// Move every due message (up to [`FLUSH_BATCH`]) into `stream`.
    pub async fn flush_due<B: StreamBackend>(
        &self,
        backend: &mut B,
        stream: &str,
        max_len: Option<usize>,
    ) -> Result<usize> {
        let now = self.clock.now_ms();
        let result = backend
            .move_due(&self.key, stream, now, max_len, FLUSH_BATCH)
            .await;
        let moved = ErrorTranslator::settle("move_due", result, backend.take_last_error(), &self.key)?;

        if moved > 0 {
            QueueMetrics::record_transferred(moved as u64);
            tracing::debug!(
                key = %self.key,
                stream = %stream,
                moved = moved,
                "Moved due delayed messages into the stream"
            );
        }

        Ok(moved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::redis::{BackendOp, DialTarget, MemoryStore};

    async fn setup() -> (Arc<ManualClock>, Arc<MemoryStore>, crate::redis::MemoryBackend) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let store = MemoryStore::new(clock.clone());
        let mut backend = store.backend();
        backend
            .connect(&DialTarget::Unix { path: "/tmp/redis.sock".to_string() }, None)
            .await
            .unwrap();
        (clock, store, backend)
    }

    #[tokio::test]
    async fn test_identical_payloads_stay_distinct() {
        let (clock, store, mut backend) = setup().await;
        let mut scheduler = DelayScheduler::new("messages__queue", clock.clone());

        let a = scheduler
            .schedule(&mut backend, b"same", Duration::from_millis(100))
            .await
            .unwrap();
        let b = scheduler
            .schedule(&mut backend, b"same", Duration::from_millis(100))
            .await
            .unwrap();

        assert_ne!(a, b);
        assert_eq!(store.delayed_len("messages__queue").await, 2);
    }

    #[tokio::test]
    async fn test_flush_moves_only_due() {
        let (clock, store, mut backend) = setup().await;
        let mut scheduler = DelayScheduler::new("messages__queue", clock.clone());
        scheduler
            .schedule(&mut backend, b"soon", Duration::from_millis(100))
            .await
            .unwrap();
        scheduler
            .schedule(&mut backend, b"later", Duration::from_millis(1000))
            .await
            .unwrap();

        assert_eq!(scheduler.flush_due(&mut backend, "messages", None).await.unwrap(), 0);

        clock.advance(Duration::from_millis(100));
        assert_eq!(scheduler.flush_due(&mut backend, "messages", None).await.unwrap(), 1);
        assert_eq!(store.stream_ids("messages").await.len(), 1);

        clock.advance(Duration::from_millis(900));
        assert_eq!(scheduler.flush_due(&mut backend, "messages", None).await.unwrap(), 1);
        assert_eq!(store.delayed_len("messages__queue").await, 0);
    }

    #[tokio::test]
    async fn test_overflowing_delay_writes_nothing() {
        let (clock, store, mut backend) = setup().await;
        let mut scheduler = DelayScheduler::new("messages__queue", clock);

        let err = scheduler
            .schedule(&mut backend, b"x", Duration::MAX)
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::Transport(msg) if msg == "Message delay is too big"));
        assert_eq!(store.count(BackendOp::Schedule).await, 0);
    }

    #[tokio::test]
    async fn test_refused_insert_reports_error_slot() {
        let (clock, store, mut backend) = setup().await;
        let mut scheduler = DelayScheduler::new("messages__queue", clock);
        store
            .fail_next_silently(BackendOp::Schedule, "OOM command not allowed when used memory > 'maxmemory'")
            .await;

        let err = scheduler
            .schedule(&mut backend, b"x", Duration::from_millis(10))
            .await
            .unwrap_err();

        assert!(matches!(err, QueueError::Transport(msg) if msg.starts_with("OOM")));
        assert!(backend.take_last_error().is_none());
    }
}
