//! Integration tests for the typed transport

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use ara_stream_messenger::clock::ManualClock;
use ara_stream_messenger::config::{resolve, TransportOptions};
use ara_stream_messenger::error::QueueError;
use ara_stream_messenger::queue::Connection;
use ara_stream_messenger::redis::{BackendOp, MemoryBackend, MemoryStore};
use ara_stream_messenger::transport::{JsonSerializer, RedisTransport, TYPE_HEADER};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderPlaced {
    order_id: u64,
    total_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct OrderCancelled {
    order_id: u64,
}

type Transport<T> = RedisTransport<JsonSerializer<T>, MemoryBackend>;

async fn connection(
    store: &Arc<MemoryStore>,
    clock: &Arc<ManualClock>,
    dsn: &str,
) -> Connection<MemoryBackend> {
    let config = resolve(dsn, &TransportOptions::new()).unwrap();
    Connection::new(config, store.backend(), clock.clone())
        .await
        .unwrap()
}

fn fixture() -> (Arc<ManualClock>, Arc<MemoryStore>) {
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let store = MemoryStore::new(clock.clone());
    (clock, store)
}

#[tokio::test]
async fn test_send_receive_ack() {
    let (clock, store) = fixture();
    let mut transport: Transport<OrderPlaced> = RedisTransport::new(
        connection(&store, &clock, "redis://localhost/orders").await,
        JsonSerializer::new(),
    );
    let order = OrderPlaced {
        order_id: 17,
        total_cents: 4_250,
    };

    transport.send(&order, Duration::ZERO).await.unwrap();
    let delivery = transport.get().await.unwrap().unwrap();

    assert_eq!(delivery.message, order);
    assert!(delivery.headers[TYPE_HEADER].ends_with("OrderPlaced"));
    assert_eq!(transport.message_count().await.unwrap(), 0);

    transport.ack(&delivery.id).await.unwrap();
    assert!(store.stream_ids("orders").await.is_empty());
}

#[tokio::test]
async fn test_delayed_send() {
    let (clock, store) = fixture();
    let mut transport: Transport<OrderPlaced> = RedisTransport::new(
        connection(&store, &clock, "redis://localhost/orders").await,
        JsonSerializer::new(),
    );

    let id = transport
        .send(
            &OrderPlaced {
                order_id: 1,
                total_cents: 0,
            },
            Duration::from_secs(5),
        )
        .await
        .unwrap();
    assert!(id.is_delayed());
    assert!(transport.get().await.unwrap().is_none());

    clock.advance(Duration::from_secs(5));
    assert_eq!(transport.get().await.unwrap().unwrap().message.order_id, 1);
}

#[tokio::test]
async fn test_wrong_type_is_rejected_as_undecodable() {
    let (clock, store) = fixture();
    let mut sender: Transport<OrderCancelled> = RedisTransport::new(
        connection(&store, &clock, "redis://localhost/orders/workers/sender").await,
        JsonSerializer::new(),
    );
    let mut receiver: Transport<OrderPlaced> = RedisTransport::new(
        connection(&store, &clock, "redis://localhost/orders/workers/receiver").await,
        JsonSerializer::new(),
    );

    sender
        .send(&OrderCancelled { order_id: 3 }, Duration::ZERO)
        .await
        .unwrap();
    let err = receiver.get().await.unwrap_err();

    match err {
        QueueError::Decoding { reason, .. } => assert!(reason.contains("OrderCancelled")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(store.count(BackendOp::Ack).await, 1);
    assert!(store.pending("orders", "workers").await.is_empty());
    assert!(receiver.get().await.unwrap().is_none());
}

#[tokio::test]
async fn test_trimmed_payload_is_rejected() {
    let (clock, store) = fixture();
    let dsn = "redis://localhost/orders?stream_max_entries=1";
    let mut transport: Transport<OrderPlaced> = RedisTransport::new(
        connection(&store, &clock, dsn).await,
        JsonSerializer::new(),
    );

    let order = OrderPlaced {
        order_id: 1,
        total_cents: 1,
    };
    transport.send(&order, Duration::ZERO).await.unwrap();
    transport.get().await.unwrap().unwrap();
    clock.advance(Duration::from_millis(1));
    transport.send(&order, Duration::ZERO).await.unwrap();

    let mut restarted: Transport<OrderPlaced> = RedisTransport::new(
        connection(&store, &clock, dsn).await,
        JsonSerializer::new(),
    );
    let err = restarted.get().await.unwrap_err();

    assert!(matches!(err, QueueError::Decoding { ref reason, .. } if reason.contains("body")));
    assert!(restarted.get().await.unwrap().is_some());
}

#[tokio::test]
async fn test_setup_and_cleanup() {
    let (clock, store) = fixture();
    let mut transport: Transport<OrderPlaced> = RedisTransport::new(
        connection(&store, &clock, "redis://localhost/orders?auto_setup=false").await,
        JsonSerializer::new(),
    );

    transport.setup().await.unwrap();
    assert!(store.exists("orders").await);

    transport.cleanup().await.unwrap();
    assert!(!store.exists("orders").await);
}
