//! Infrastructure layer modules
//!
//! This module contains shared infrastructure components:
//! - `clock`: Wall-clock abstraction (system and manual)
//! - `config`: DSN resolution, transport options and worker settings
//! - `error`: Error types and the backend error translator
//! - `metrics`: Prometheus metrics helpers
//! - `redis`: Stream backends (Redis and in-memory) and retry backoff

pub mod clock;
pub mod config;
pub mod error;
pub mod metrics;
pub mod redis;
