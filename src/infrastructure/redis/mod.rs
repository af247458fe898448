//! Stream backends
//!
//! # Modules
//!
//! - `StreamBackend`: capability surface the connection consumes
//! - `RedisBackend`: implementation on the `redis` crate (single node, TLS, unix socket, cluster)
//! - `MemoryBackend`: in-process implementation sharing a `MemoryStore`
//! - `ExponentialBackoff`: retry delays for callers of the transport

mod backend;
mod backoff;
mod client;
mod memory;
mod scripts;

pub use backend::{
    split_delay_member, DialTarget, GroupInfo, PendingEntry, ReadFrom, StreamBackend, StreamEntry,
};
pub use backoff::{BackoffConfig, ExponentialBackoff};
pub use client::RedisBackend;
pub use memory::{BackendOp, Command, MemoryBackend, MemoryStore};
