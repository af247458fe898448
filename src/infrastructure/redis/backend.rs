//! Backend trait for stream storage.
//!
//! This module defines the capability surface the connection needs from a
//! log/consumer-group store, so the Redis client and the in-process store
//! can be used interchangeably.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;

use crate::config::{Credentials, HostPort};
use crate::error::BackendResult;

/// A concrete address to dial, after sentinel discovery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DialTarget {
    Tcp { host: String, port: u16, tls: bool },
    Unix { path: String },
    /// Cluster nodes authenticate while the node connections are opened.
    Cluster {
        nodes: Vec<HostPort>,
        tls: bool,
        credentials: Option<Credentials>,
    },
}

impl fmt::Display for DialTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DialTarget::Tcp { host, port, .. } => write!(f, "{}", HostPort::new(host.clone(), *port)),
            DialTarget::Unix { path } => write!(f, "unix:{}", path),
            DialTarget::Cluster { nodes, .. } => {
                let list: Vec<String> = nodes.iter().map(ToString::to_string).collect();
                write!(f, "cluster[{}]", list.join(","))
            }
        }
    }
}

/// Where a group read starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadFrom {
    /// Entries already delivered to this consumer and not yet acknowledged (`0`).
    Pending,
    /// Entries never delivered to the group (`>`).
    New,
}

impl ReadFrom {
    pub fn as_arg(self) -> &'static str {
        match self {
            ReadFrom::Pending => "0",
            ReadFrom::New => ">",
        }
    }
}

/// One entry returned by a group read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    pub id: String,
    /// `None` when the entry is still pending but was deleted or trimmed.
    pub fields: Option<BTreeMap<String, Vec<u8>>>,
}

/// One row of the pending entries list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle_ms: u64,
}

/// Consumer group state as reported by `XINFO GROUPS`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupInfo {
    pub name: String,
    pub pending: u64,
    pub last_delivered_id: String,
    /// Entries not yet delivered to the group; `None` when the server cannot tell.
    pub lag: Option<u64>,
}

/// Capability surface over a stream backend.
///
/// Calls report failures through their return value. Backends that also keep
/// a side-channel error slot expose it through [`take_last_error`](Self::take_last_error),
/// which must clear it.
#[async_trait]
pub trait StreamBackend: Send {
    /// Open the connection. `timeout` bounds the dial.
    async fn connect(&mut self, target: &DialTarget, timeout: Option<Duration>) -> BackendResult<()>;

    async fn authenticate(&mut self, credentials: &Credentials) -> BackendResult<()>;

    async fn select_database(&mut self, index: i64) -> BackendResult<()>;

    /// Ask each sentinel in turn for the address of `master`. `tls` applies to
    /// the sentinel connections.
    async fn resolve_master(
        &mut self,
        sentinels: &[HostPort],
        master: &str,
        tls: bool,
        timeout: Option<Duration>,
    ) -> BackendResult<Option<HostPort>>;

    /// Create `group` at the start of `stream`, creating the stream if absent.
    async fn create_group(&mut self, stream: &str, group: &str) -> BackendResult<()>;

    async fn group_infos(&mut self, stream: &str) -> BackendResult<Vec<GroupInfo>>;

    /// Append an entry, trimming approximately to `max_len` when set. Returns the entry id.
    async fn append(
        &mut self,
        stream: &str,
        fields: &[(&str, &[u8])],
        max_len: Option<usize>,
    ) -> BackendResult<String>;

    async fn group_read(
        &mut self,
        group: &str,
        consumer: &str,
        stream: &str,
        from: ReadFrom,
        count: usize,
        block: Option<Duration>,
    ) -> BackendResult<Vec<StreamEntry>>;

    /// Oldest pending entries of the group, any consumer.
    async fn pending_summary(
        &mut self,
        stream: &str,
        group: &str,
        count: usize,
    ) -> BackendResult<Vec<PendingEntry>>;

    /// Transfer ownership of `ids` idle for at least `min_idle`. Returns the ids claimed.
    async fn claim(
        &mut self,
        stream: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        ids: &[String],
    ) -> BackendResult<Vec<String>>;

    async fn ack(&mut self, stream: &str, group: &str, ids: &[String]) -> BackendResult<u64>;

    async fn delete(&mut self, stream: &str, ids: &[String]) -> BackendResult<u64>;

    /// Ids of up to `count` entries strictly after `after`.
    async fn entries_after(
        &mut self,
        stream: &str,
        after: &str,
        count: usize,
    ) -> BackendResult<Vec<String>>;

    /// Insert `member` into the delay set at score `due_ms` unless already present.
    async fn schedule(&mut self, key: &str, due_ms: i64, member: &[u8]) -> BackendResult<bool>;

    /// Atomically move up to `limit` members due at `now_ms` into `stream`. Returns the count moved.
    async fn move_due(
        &mut self,
        key: &str,
        stream: &str,
        now_ms: i64,
        max_len: Option<usize>,
        limit: usize,
    ) -> BackendResult<usize>;

    async fn delete_keys(&mut self, keys: &[String]) -> BackendResult<u64>;

    /// Read and clear the side-channel error slot.
    fn take_last_error(&mut self) -> Option<String> {
        None
    }
}

/// Split a delay member into its id prefix and payload.
pub fn split_delay_member(member: &[u8]) -> Option<(&[u8], &[u8])> {
    let sep = member.iter().position(|b| *b == b':')?;
    Some((&member[..sep], &member[sep + 1..]))
}
