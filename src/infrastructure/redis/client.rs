//! Redis implementation of [`StreamBackend`].
//!
//! Single nodes (TCP, TLS or unix socket) use a multiplexed connection; clusters
//! use the async cluster client. Commands are issued raw so the reply shapes
//! stay visible next to the command that produces them.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::cluster::ClusterClient;
use redis::cluster_async::ClusterConnection;
use redis::{Client, Cmd, FromRedisValue, RedisResult, Value};

use crate::config::{Credentials, HostPort};
use crate::error::{BackendError, BackendResult};

use super::backend::{DialTarget, GroupInfo, PendingEntry, ReadFrom, StreamBackend, StreamEntry};
use super::scripts;

type ReadGroupReply = Option<Vec<(String, Vec<(String, Option<Vec<(String, Vec<u8>)>>)>)>>;

enum Handle {
    Single(MultiplexedConnection),
    Cluster(ClusterConnection),
}

/// Seed nodes of a cluster, kept to reconnect when credentials change.
struct ClusterSeed {
    nodes: Vec<String>,
    credentials: Option<Credentials>,
    timeout: Option<Duration>,
}

/// Stream backend on the `redis` crate.
pub struct RedisBackend {
    handle: Option<Handle>,
    seed: Option<ClusterSeed>,
    read_timeout: Option<Duration>,
}

impl RedisBackend {
    /// Create an unconnected backend. `read_timeout` bounds every command round-trip.
    pub fn new(read_timeout: Option<Duration>) -> Self {
        Self {
            handle: None,
            seed: None,
            read_timeout,
        }
    }

    fn node_url(node: &HostPort, tls: bool) -> String {
        let scheme = if tls { "rediss" } else { "redis" };
        format!("{}://{}/", scheme, node)
    }

    async fn with_timeout<T, F>(limit: Option<Duration>, fut: F) -> BackendResult<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match limit {
            Some(limit) => tokio::time::timeout(limit, fut)
                .await
                .map_err(|_| BackendError::Timeout(limit.as_millis() as u64))?
                .map_err(BackendError::from),
            None => fut.await.map_err(BackendError::from),
        }
    }

    async fn dial_single(url: &str, timeout: Option<Duration>) -> BackendResult<MultiplexedConnection> {
        let client = Client::open(url)?;
        Self::with_timeout(timeout, client.get_multiplexed_tokio_connection()).await
    }

    async fn open_cluster(seed: &ClusterSeed) -> BackendResult<ClusterConnection> {
        let mut builder = ClusterClient::builder(seed.nodes.clone());
        match &seed.credentials {
            Some(Credentials::Password(password)) => {
                builder = builder.password(password.clone());
            }
            Some(Credentials::UserPassword { user, password }) => {
                builder = builder.username(user.clone()).password(password.clone());
            }
            None => {}
        }
        if let Some(timeout) = seed.timeout {
            builder = builder.connection_timeout(timeout);
        }
        let client = builder.build()?;
        Self::with_timeout(seed.timeout, client.get_async_connection()).await
    }

    async fn ensure_connected(&mut self) -> BackendResult<()> {
        if self.handle.is_some() {
            return Ok(());
        }
        let seed = self.seed.as_ref().ok_or(BackendError::NotConnected)?;
        let conn = Self::open_cluster(seed).await?;
        tracing::info!(nodes = seed.nodes.len(), "Redis cluster connection established");
        self.handle = Some(Handle::Cluster(conn));
        Ok(())
    }

    async fn query<T: FromRedisValue + Send>(&mut self, cmd: &Cmd) -> BackendResult<T> {
        self.ensure_connected().await?;
        let read_timeout = self.read_timeout;
        let handle = self.handle.as_mut().ok_or(BackendError::NotConnected)?;
        match handle {
            Handle::Single(conn) => Self::with_timeout(read_timeout, cmd.query_async(conn)).await,
            Handle::Cluster(conn) => Self::with_timeout(read_timeout, cmd.query_async(conn)).await,
        }
    }

    fn value_string(value: Option<&Value>) -> Option<String> {
        value.and_then(|v| redis::from_redis_value::<String>(v).ok())
    }

    fn value_u64(value: Option<&Value>) -> Option<u64> {
        value.and_then(|v| redis::from_redis_value::<u64>(v).ok())
    }
}

#[async_trait]
impl StreamBackend for RedisBackend {
    async fn connect(&mut self, target: &DialTarget, timeout: Option<Duration>) -> BackendResult<()> {
        match target {
            DialTarget::Tcp { host, port, tls } => {
                let url = Self::node_url(&HostPort::new(host.clone(), *port), *tls);
                let conn = Self::dial_single(&url, timeout).await?;
                self.seed = None;
                self.handle = Some(Handle::Single(conn));
            }
            DialTarget::Unix { path } => {
                let url = format!("redis+unix://{}", path);
                let conn = Self::dial_single(&url, timeout).await?;
                self.seed = None;
                self.handle = Some(Handle::Single(conn));
            }
            DialTarget::Cluster {
                nodes,
                tls,
                credentials,
            } => {
                let seed = ClusterSeed {
                    nodes: nodes.iter().map(|n| Self::node_url(n, *tls)).collect(),
                    credentials: credentials.clone(),
                    timeout,
                };
                let conn = Self::open_cluster(&seed).await?;
                self.seed = Some(seed);
                self.handle = Some(Handle::Cluster(conn));
            }
        }
        tracing::info!(endpoint = %target, "Redis connection established");
        Ok(())
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> BackendResult<()> {
        if let Some(seed) = self.seed.as_mut() {
            seed.credentials = Some(credentials.clone());
            self.handle = None;
            return self.ensure_connected().await;
        }

        let mut cmd = redis::cmd("AUTH");
        match credentials {
            Credentials::Password(password) => {
                cmd.arg(password);
            }
            Credentials::UserPassword { user, password } => {
                cmd.arg(user).arg(password);
            }
        }
        let _: () = self.query(&cmd).await?;
        Ok(())
    }

    async fn select_database(&mut self, index: i64) -> BackendResult<()> {
        if self.seed.is_some() {
            return if index == 0 {
                Ok(())
            } else {
                Err(BackendError::Server(
                    "ERR SELECT is not allowed in cluster mode".to_string(),
                ))
            };
        }
        let _: () = self.query(redis::cmd("SELECT").arg(index)).await?;
        Ok(())
    }

    async fn resolve_master(
        &mut self,
        sentinels: &[HostPort],
        master: &str,
        tls: bool,
        timeout: Option<Duration>,
    ) -> BackendResult<Option<HostPort>> {
        for sentinel in sentinels {
            let mut conn = match Self::dial_single(&Self::node_url(sentinel, tls), timeout).await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(sentinel = %sentinel, error = %e, "Sentinel unreachable");
                    continue;
                }
            };

            let reply: BackendResult<Option<(String, String)>> = Self::with_timeout(
                self.read_timeout,
                redis::cmd("SENTINEL")
                    .arg("get-master-addr-by-name")
                    .arg(master)
                    .query_async(&mut conn),
            )
            .await;

            match reply {
                Ok(Some((host, port))) => {
                    if let Ok(port) = port.parse::<u16>() {
                        tracing::info!(sentinel = %sentinel, master = %master, host = %host, port = port, "Resolved master from sentinel");
                        return Ok(Some(HostPort::new(host, port)));
                    }
                }
                Ok(None) => {
                    tracing::warn!(sentinel = %sentinel, master = %master, "Sentinel does not know master");
                }
                Err(e) => {
                    tracing::warn!(sentinel = %sentinel, error = %e, "Sentinel query failed");
                }
            }
        }
        Ok(None)
    }

    async fn create_group(&mut self, stream: &str, group: &str) -> BackendResult<()> {
        let _: () = self
            .query(
                redis::cmd("XGROUP")
                    .arg("CREATE")
                    .arg(stream)
                    .arg(group)
                    .arg("0")
                    .arg("MKSTREAM"),
            )
            .await?;
        Ok(())
    }

    async fn group_infos(&mut self, stream: &str) -> BackendResult<Vec<GroupInfo>> {
        let rows: Vec<HashMap<String, Value>> = self
            .query(redis::cmd("XINFO").arg("GROUPS").arg(stream))
            .await?;

        Ok(rows
            .into_iter()
            .map(|row| GroupInfo {
                name: Self::value_string(row.get("name")).unwrap_or_default(),
                pending: Self::value_u64(row.get("pending")).unwrap_or(0),
                last_delivered_id: Self::value_string(row.get("last-delivered-id"))
                    .unwrap_or_else(|| "0-0".to_string()),
                lag: Self::value_u64(row.get("lag")),
            })
            .collect())
    }

    async fn append(
        &mut self,
        stream: &str,
        fields: &[(&str, &[u8])],
        max_len: Option<usize>,
    ) -> BackendResult<String> {
        let mut cmd = redis::cmd("XADD");
        cmd.arg(stream);
        if let Some(max_len) = max_len {
            cmd.arg("MAXLEN").arg("~").arg(max_len);
        }
        cmd.arg("*");
        for (field, value) in fields {
            cmd.arg(*field).arg(*value);
        }
        self.query(&cmd).await
    }

    async fn group_read(
        &mut self,
        group: &str,
        consumer: &str,
        stream: &str,
        from: ReadFrom,
        count: usize,
        block: Option<Duration>,
    ) -> BackendResult<Vec<StreamEntry>> {
        let mut cmd = redis::cmd("XREADGROUP");
        cmd.arg("GROUP").arg(group).arg(consumer).arg("COUNT").arg(count);
        if let Some(block) = block {
            cmd.arg("BLOCK").arg(block.as_millis() as u64);
        }
        cmd.arg("STREAMS").arg(stream).arg(from.as_arg());

        let reply: ReadGroupReply = self.query(&cmd).await?;

        Ok(reply
            .unwrap_or_default()
            .into_iter()
            .flat_map(|(_, entries)| entries)
            .map(|(id, fields)| StreamEntry {
                id,
                fields: fields.map(|pairs| pairs.into_iter().collect::<BTreeMap<_, _>>()),
            })
            .collect())
    }

    async fn pending_summary(
        &mut self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> BackendResult<Vec<PendingEntry>> {
        // XPENDING stream group - + count -> [[id, consumer, idle_ms, deliveries], ...]
        let rows: Vec<(String, String, u64, u64)> = self
            .query(
                redis::cmd("XPENDING")
                    .arg(stream)
                    .arg(group)
                    .arg("-")
                    .arg("+")
                    .arg(count),
            )
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, consumer, idle_ms, _)| PendingEntry {
                id,
                consumer,
                idle_ms,
            })
            .collect())
    }

    async fn claim(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> BackendResult<Vec<String>> {
        let mut cmd = redis::cmd("XCLAIM");
        cmd.arg(stream)
            .arg(group)
            .arg(consumer)
            .arg(min_idle.as_millis() as u64);
        for id in ids {
            cmd.arg(id);
        }
        cmd.arg("JUSTID");
        self.query(&cmd).await
    }

    async fn ack(&mut self, stream: &str, group: &str, ids: &[String]) -> BackendResult<u64> {
        let mut cmd = redis::cmd("XACK");
        cmd.arg(stream).arg(group);
        for id in ids {
            cmd.arg(id);
        }
        self.query(&cmd).await
    }

    async fn delete(&mut self, stream: &str, ids: &[String]) -> BackendResult<u64> {
        let mut cmd = redis::cmd("XDEL");
        cmd.arg(stream);
        for id in ids {
            cmd.arg(id);
        }
        self.query(&cmd).await
    }

    async fn entries_after(
        &mut self,
        stream: &str,
        after: &str,
        count: usize,
    ) -> BackendResult<Vec<String>> {
        let rows: Vec<(String, Value)> = self
            .query(
                redis::cmd("XRANGE")
                    .arg(stream)
                    .arg(format!("({}", after))
                    .arg("+")
                    .arg("COUNT")
                    .arg(count),
            )
            .await?;
        Ok(rows.into_iter().map(|(id, _)| id).collect())
    }

    async fn schedule(&mut self, key: &str, due_ms: i64, member: &[u8]) -> BackendResult<bool> {
        let added: i64 = self
            .query(redis::cmd("ZADD").arg(key).arg("NX").arg(due_ms).arg(member))
            .await?;
        Ok(added > 0)
    }

    async fn move_due(
        &mut self,
        key: &str,
        stream: &str,
        now_ms: i64,
        max_len: Option<usize>,
        limit: usize,
    ) -> BackendResult<usize> {
        let moved: usize = self
            .query(
                redis::cmd("EVAL")
                    .arg(scripts::MOVE_DUE)
                    .arg(2)
                    .arg(key)
                    .arg(stream)
                    .arg(now_ms)
                    .arg(max_len.unwrap_or(0))
                    .arg(limit),
            )
            .await?;
        Ok(moved)
    }

    async fn delete_keys(&mut self, keys: &[String]) -> BackendResult<u64> {
        let mut removed = 0;
        // One key per call: keys may live in different cluster slots.
        for key in keys {
            let unlinked: BackendResult<u64> = self.query(redis::cmd("UNLINK").arg(key)).await;
            removed += match unlinked {
                Ok(n) => n,
                Err(BackendError::Redis(e)) if e.kind() == redis::ErrorKind::ResponseError => {
                    tracing::debug!(key = %key, error = %e, "UNLINK unavailable, falling back to DEL");
                    self.query::<u64>(redis::cmd("DEL").arg(key)).await?
                }
                Err(e) => return Err(e),
            };
        }
        Ok(removed)
    }
}
