//! Reliable queue connection over a stream with a consumer group.
//!
//! One [`Connection`] is one consumer identity (`stream`, `group`, `consumer`).
//! Methods take `&mut self`: a connection and its backend handle are owned by
//! a single task, and concurrency comes from running several consumers.

mod consumer;
mod lifecycle;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::config::{resolve, ConnectionConfig, Endpoint, TransportOptions};
use crate::error::{BackendResult, ErrorTranslator, QueueError, Result};
use crate::metrics::QueueMetrics;
use crate::redis::{DialTarget, RedisBackend, StreamBackend};

use super::delay::DelayScheduler;
use super::models::{EntryId, Envelope, MessageId, MESSAGE_FIELD};

/// Settle a backend result through the translator, draining the error slot.
fn settle<T, B: StreamBackend>(
    backend: &mut B,
    operation: &'static str,
    result: BackendResult<T>,
    context: &str,
) -> Result<T> {
    let last_error = backend.take_last_error();
    ErrorTranslator::settle(operation, result, last_error, context)
}

pub struct Connection<B: StreamBackend = RedisBackend> {
    config: ConnectionConfig,
    backend: B,
    clock: Arc<dyn Clock>,
    delay: DelayScheduler,
    connected: bool,
    /// Run `setup` before the next add/get.
    auto_setup: bool,
    /// Own pending entries may exist and must be served before new ones.
    could_have_pending: bool,
    /// Earliest time (ms) of the next claim attempt.
    next_claim_ms: i64,
}

impl Connection<RedisBackend> {
    /// Resolve `dsn` and `options` and connect to Redis (unless `lazy`).
    pub async fn from_dsn(dsn: &str, options: &TransportOptions) -> Result<Self> {
        let config = resolve(dsn, options)?;
        let backend = RedisBackend::new(config.options.read_timeout);
        Self::new(config, backend, Arc::new(SystemClock)).await
    }
}

impl<B: StreamBackend> Connection<B> {
    /// Build a connection over `backend`. Connects right away unless the
    /// configuration is lazy.
    pub async fn new(config: ConnectionConfig, backend: B, clock: Arc<dyn Clock>) -> Result<Self> {
        let delay = DelayScheduler::new(config.delay_queue_key(), Arc::clone(&clock));
        let mut connection = Self {
            auto_setup: config.options.auto_setup,
            config,
            backend,
            clock,
            delay,
            connected: false,
            could_have_pending: true,
            next_claim_ms: 0,
        };

        if !connection.config.options.lazy {
            connection.establish().await?;
        }

        Ok(connection)
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    async fn dial_target(&mut self) -> Result<DialTarget> {
        Ok(match &self.config.endpoint {
            Endpoint::Single { host, port, tls } => DialTarget::Tcp {
                host: host.clone(),
                port: *port,
                tls: *tls,
            },
            Endpoint::Unix { path } => DialTarget::Unix { path: path.clone() },
            Endpoint::Cluster { nodes, tls } => DialTarget::Cluster {
                nodes: nodes.clone(),
                tls: *tls,
                credentials: self.config.options.auth.clone(),
            },
            Endpoint::Sentinel {
                sentinels,
                master,
                tls,
            } => {
                let resolved = self
                    .backend
                    .resolve_master(sentinels, master, *tls, self.config.options.connect_timeout)
                    .await
                    .map_err(|e| QueueError::Connection(e.to_string()))?;
                let address = resolved.ok_or_else(|| {
                    QueueError::config(format!(
                        "Failed to retrieve master information from sentinel \"{}\".",
                        master
                    ))
                })?;
                DialTarget::Tcp {
                    host: address.host,
                    port: address.port,
                    tls: *tls,
                }
            }
        })
    }

    /// Connect, authenticate and select the database, once.
    async fn establish(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }

        let target = self.dial_target().await?;
        self.backend
            .connect(&target, self.config.options.connect_timeout)
            .await
            .map_err(|e| QueueError::Connection(e.to_string()))?;

        let credentials = match target {
            DialTarget::Cluster { .. } => None,
            _ => self.config.options.auth.as_ref(),
        };
        if let Some(credentials) = credentials {
            self.backend.authenticate(credentials).await.map_err(|e| {
                tracing::error!(endpoint = %target, error = %e, "Redis authentication failed");
                QueueError::Connection(format!("Redis authentication failed: {}", e))
            })?;
        }

        if self.config.options.dbindex != 0 {
            self.backend
                .select_database(self.config.options.dbindex)
                .await
                .map_err(|e| QueueError::Connection(e.to_string()))?;
        }

        // Nothing from the handshake may leak into the first real call.
        self.backend.take_last_error();
        self.connected = true;

        tracing::info!(
            endpoint = %target,
            stream = %self.config.options.stream,
            group = %self.config.options.group,
            consumer = %self.config.options.consumer,
            "Queue connection established"
        );
        Ok(())
    }

    /// Connect if needed and run the pending auto-setup.
    async fn prepare(&mut self) -> Result<()> {
        self.establish().await?;
        if self.auto_setup {
            self.setup().await?;
        }
        Ok(())
    }

    fn max_len(&self) -> Option<usize> {
        match self.config.options.stream_max_entries {
            0 => None,
            n => Some(n),
        }
    }

    /// Enqueue a message. A non-zero `delay` parks it in the delay set.
    pub async fn add(
        &mut self,
        body: &str,
        headers: &BTreeMap<String, String>,
        delay: Duration,
    ) -> Result<MessageId> {
        self.prepare().await?;

        let payload = Envelope::new(body, headers.clone()).encode(self.config.options.serializer)?;

        if !delay.is_zero() {
            let id = self.delay.schedule(&mut self.backend, &payload, delay).await?;
            return Ok(MessageId::Delayed(id));
        }

        let max_len = self.max_len();
        let result = self
            .backend
            .append(
                &self.config.options.stream,
                &[(MESSAGE_FIELD, payload.as_slice())],
                max_len,
            )
            .await;
        let id = settle(&mut self.backend, "xadd", result, &self.config.options.stream)?;

        QueueMetrics::record_added();
        tracing::debug!(
            id = %id,
            stream = %self.config.options.stream,
            "Message added to stream"
        );

        Ok(MessageId::Stream(EntryId::new(id)))
    }
}
