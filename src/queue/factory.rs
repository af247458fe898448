//! Connection factory

use std::sync::Arc;

use crate::clock::Clock;
use crate::config::{resolve, supports, TransportOptions};
use crate::error::Result;
use crate::redis::{MemoryBackend, MemoryStore, RedisBackend};

use super::connection::Connection;

/// Whether `dsn` is handled by this transport.
pub fn supports_dsn(dsn: &str) -> bool {
    supports(dsn)
}

/// Create a connection to Redis from a DSN and explicit options.
///
/// # Example
///
/// ```rust,ignore
/// let mut connection = create_connection("redis://localhost:6379/jobs", &TransportOptions::new()).await?;
/// ```
pub async fn create_connection(
    dsn: &str,
    options: &TransportOptions,
) -> Result<Connection<RedisBackend>> {
    let connection = Connection::from_dsn(dsn, options).await?;
    tracing::info!(
        backend = "redis",
        stream = %connection.config().options.stream,
        "Created queue connection"
    );
    Ok(connection)
}

/// Create a connection on an in-process store, resolving the DSN the same way.
///
/// Several connections on the same store behave like several clients of one server.
pub async fn create_memory_connection(
    dsn: &str,
    options: &TransportOptions,
    store: &Arc<MemoryStore>,
) -> Result<Connection<MemoryBackend>> {
    let config = resolve(dsn, options)?;
    let clock: Arc<dyn Clock> = store.clock();
    let connection = Connection::new(config, store.backend(), clock).await?;
    tracing::info!(
        backend = "memory",
        stream = %connection.config().options.stream,
        "Created queue connection"
    );
    Ok(connection)
}
