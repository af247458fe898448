//! Typed sender/receiver on top of a queue [`Connection`].
//!
//! The transport encodes messages with a [`Serializer`], hands the envelope
//! to the connection and decodes what comes back. Entries that cannot be
//! decoded are rejected before the error is returned, so a poison message
//! is never served twice.

mod serializer;

pub use serializer::{DecodeError, JsonSerializer, Serializer, CONTENT_TYPE_HEADER, TYPE_HEADER};

use std::collections::BTreeMap;
use std::time::Duration;

use crate::config::{supports, TransportOptions};
use crate::error::{QueueError, Result};
use crate::queue::{Connection, EntryId, Envelope, MessageId, ReceivedMessage};
use crate::redis::{RedisBackend, StreamBackend};

/// A decoded message and the id needed to settle it.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery<M> {
    pub id: EntryId,
    pub message: M,
    pub headers: BTreeMap<String, String>,
}

pub struct RedisTransport<S: Serializer, B: StreamBackend = RedisBackend> {
    connection: Connection<B>,
    serializer: S,
}

impl<S: Serializer, B: StreamBackend> RedisTransport<S, B> {
    pub fn new(connection: Connection<B>, serializer: S) -> Self {
        Self {
            connection,
            serializer,
        }
    }

    pub fn connection(&self) -> &Connection<B> {
        &self.connection
    }

    /// Encode and enqueue `message`, optionally delayed.
    pub async fn send(&mut self, message: &S::Message, delay: Duration) -> Result<MessageId> {
        let envelope = self.serializer.encode(message)?;
        self.connection
            .add(&envelope.body, &envelope.headers, delay)
            .await
    }

    /// Receive and decode at most one message.
    ///
    /// On a decoding failure the entry is rejected and
    /// [`QueueError::Decoding`] is returned.
    pub async fn get(&mut self) -> Result<Option<Delivery<S::Message>>> {
        let Some(received) = self.connection.get().await? else {
            return Ok(None);
        };

        match self.decode(&received) {
            Ok(delivery) => Ok(Some(delivery)),
            Err(reason) => {
                tracing::warn!(id = %received.id, error = %reason, "Rejecting undecodable message");
                match self.connection.reject(&received.id).await {
                    Ok(()) => {}
                    Err(e @ QueueError::Purge { .. }) => {
                        tracing::error!(id = %received.id, error = %e, "Rejected message left in the stream");
                    }
                    Err(e) => return Err(e),
                }
                Err(QueueError::Decoding {
                    id: received.id.to_string(),
                    reason,
                })
            }
        }
    }

    fn decode(&self, received: &ReceivedMessage) -> std::result::Result<Delivery<S::Message>, String> {
        let text = received.message().ok_or_else(|| {
            "Encoded envelope should have at least a \"body\" and some \"headers\".".to_string()
        })?;
        let envelope = Envelope::from_json(text).map_err(|e| e.to_string())?;
        let headers = envelope.headers.clone();
        let message = self.serializer.decode(envelope).map_err(|e| e.to_string())?;

        Ok(Delivery {
            id: received.id.clone(),
            message,
            headers,
        })
    }

    pub async fn ack(&mut self, id: &EntryId) -> Result<()> {
        self.connection.ack(id).await
    }

    pub async fn reject(&mut self, id: &EntryId) -> Result<()> {
        self.connection.reject(id).await
    }

    pub async fn message_count(&mut self) -> Result<u64> {
        self.connection.message_count().await
    }

    pub async fn setup(&mut self) -> Result<()> {
        self.connection.setup().await
    }

    pub async fn cleanup(&mut self) -> Result<()> {
        self.connection.cleanup().await
    }
}

/// Builds transports from DSNs.
pub struct TransportFactory;

impl TransportFactory {
    pub fn supports(dsn: &str) -> bool {
        supports(dsn)
    }

    pub async fn create<S: Serializer>(
        dsn: &str,
        options: &TransportOptions,
        serializer: S,
    ) -> Result<RedisTransport<S>> {
        let connection = crate::queue::create_connection(dsn, options).await?;
        Ok(RedisTransport::new(connection, serializer))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::create_memory_connection;
    use crate::redis::MemoryStore;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
    }

    async fn transport(store: &std::sync::Arc<MemoryStore>) -> RedisTransport<JsonSerializer<Ping>, crate::redis::MemoryBackend> {
        let connection = create_memory_connection("redis://localhost/pings", &TransportOptions::new(), store)
            .await
            .unwrap();
        RedisTransport::new(connection, JsonSerializer::new())
    }

    #[tokio::test]
    async fn test_send_then_get() {
        let store = MemoryStore::with_system_clock();
        let mut transport = transport(&store).await;

        transport.send(&Ping { seq: 1 }, Duration::ZERO).await.unwrap();
        let delivery = transport.get().await.unwrap().unwrap();

        assert_eq!(delivery.message, Ping { seq: 1 });
        assert_eq!(delivery.headers[CONTENT_TYPE_HEADER], "application/json");
        transport.ack(&delivery.id).await.unwrap();
        assert!(transport.get().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_undecodable_is_rejected() {
        let store = MemoryStore::with_system_clock();
        let mut transport = transport(&store).await;
        let mut raw = create_memory_connection("redis://localhost/pings", &TransportOptions::new(), &store)
            .await
            .unwrap();
        raw.add("garbage", &BTreeMap::new(), Duration::ZERO).await.unwrap();

        let err = transport.get().await.unwrap_err();

        assert!(matches!(err, QueueError::Decoding { .. }));
        assert!(store.pending("pings", "symfony").await.is_empty());
        assert!(store.stream_ids("pings").await.is_empty());
    }

    #[tokio::test]
    async fn test_undecodable_keeps_decoding_error_when_delete_fails() {
        let store = MemoryStore::with_system_clock();
        let mut transport = transport(&store).await;
        let mut raw = create_memory_connection("redis://localhost/pings", &TransportOptions::new(), &store)
            .await
            .unwrap();
        raw.add("garbage", &BTreeMap::new(), Duration::ZERO).await.unwrap();
        store
            .fail_next(crate::redis::BackendOp::Delete, "READONLY You can't write against a read only replica.")
            .await;

        let err = transport.get().await.unwrap_err();

        assert!(matches!(err, QueueError::Decoding { .. }));
        assert!(store.pending("pings", "symfony").await.is_empty());
        assert_eq!(store.stream_ids("pings").await.len(), 1);
    }

    #[test]
    fn test_factory_supports() {
        assert!(TransportFactory::supports("redis://localhost"));
        assert!(!TransportFactory::supports("amqp://localhost"));
    }
}
