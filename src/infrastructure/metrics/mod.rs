//! Prometheus metrics for the stream transport.
//!
//! - Message metrics (added, received, transferred from the delay structure)
//! - Settlement metrics (acks, rejects, purge failures)
//! - Redelivery metrics (claim attempts by outcome)
//! - Backend error metrics

mod helpers;

pub use helpers::{encode_metrics, BackendMetrics, ClaimOutcome, QueueMetrics};

use lazy_static::lazy_static;
use prometheus::{register_int_counter, register_int_counter_vec, IntCounter, IntCounterVec};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "messenger";

lazy_static! {
    // ============================================================================
    // Message Metrics
    // ============================================================================

    /// Messages added, by kind (stream, delayed)
    pub static ref MESSAGES_ADDED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_added_total", METRIC_PREFIX),
        "Total messages added to the transport",
        &["kind"]
    ).unwrap();

    /// Messages handed to a consumer, by source (pending, new)
    pub static ref MESSAGES_RECEIVED_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_messages_received_total", METRIC_PREFIX),
        "Total messages returned by get",
        &["source"]
    ).unwrap();

    /// Delayed messages moved into the live stream
    pub static ref DELAYED_TRANSFERRED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_delayed_transferred_total", METRIC_PREFIX),
        "Total delayed messages moved into the stream once due"
    ).unwrap();

    // ============================================================================
    // Settlement Metrics
    // ============================================================================

    /// Messages acknowledged
    pub static ref MESSAGES_ACKED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_acked_total", METRIC_PREFIX),
        "Total messages acknowledged"
    ).unwrap();

    /// Messages rejected
    pub static ref MESSAGES_REJECTED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_rejected_total", METRIC_PREFIX),
        "Total messages rejected"
    ).unwrap();

    /// Deletes that failed after a successful ack or reject
    pub static ref PURGE_FAILURES_TOTAL: IntCounter = register_int_counter!(
        format!("{}_purge_failures_total", METRIC_PREFIX),
        "Total stream deletes that failed after settlement"
    ).unwrap();

    // ============================================================================
    // Redelivery Metrics
    // ============================================================================

    /// Claim attempts, by outcome
    pub static ref CLAIMS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_claims_total", METRIC_PREFIX),
        "Total claim attempts on abandoned pending messages",
        &["outcome"]
    ).unwrap();

    // ============================================================================
    // Backend Metrics
    // ============================================================================

    /// Backend calls that reported an error, by operation
    pub static ref BACKEND_ERRORS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_backend_errors_total", METRIC_PREFIX),
        "Total backend errors by operation",
        &["operation"]
    ).unwrap();
}
