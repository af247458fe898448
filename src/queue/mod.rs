//! Reliable queue on a Redis stream with a consumer group.
//!
//! Messages are appended to a stream and read through a consumer group, so
//! each one is delivered to one consumer and stays pending until acknowledged.
//! Pending entries abandoned by a crashed consumer are claimed by another one
//! after `redeliver_timeout`. Delayed messages wait in a sorted set until due.

mod connection;
mod delay;
mod factory;
mod models;

pub use connection::Connection;
pub use delay::{DelayScheduler, FLUSH_BATCH};
pub use factory::{create_connection, create_memory_connection, supports_dsn};
pub use models::{EntryId, Envelope, MessageId, ReceivedMessage, SyntheticId, MESSAGE_FIELD};
