//! Metrics helper structs for convenient metric recording

use prometheus::{Encoder, TextEncoder};

use super::{
    BACKEND_ERRORS_TOTAL, CLAIMS_TOTAL, DELAYED_TRANSFERRED_TOTAL, MESSAGES_ACKED_TOTAL,
    MESSAGES_ADDED_TOTAL, MESSAGES_RECEIVED_TOTAL, MESSAGES_REJECTED_TOTAL, PURGE_FAILURES_TOTAL,
};

/// Encode all metrics to Prometheus text format
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}

/// Outcome of a claim attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// An abandoned entry was transferred to this consumer
    Claimed,
    /// The entry was claimed or acked by someone else first
    Missed,
    /// The oldest pending entry already belongs to this consumer
    Own,
    /// Nothing pending has been idle long enough
    NotIdle,
}

impl ClaimOutcome {
    fn label(self) -> &'static str {
        match self {
            ClaimOutcome::Claimed => "claimed",
            ClaimOutcome::Missed => "missed",
            ClaimOutcome::Own => "own",
            ClaimOutcome::NotIdle => "not_idle",
        }
    }
}

/// Helper struct for recording queue metrics
pub struct QueueMetrics;

impl QueueMetrics {
    /// Record a message appended straight to the stream
    pub fn record_added() {
        MESSAGES_ADDED_TOTAL.with_label_values(&["stream"]).inc();
    }

    /// Record a message placed in the delay structure
    pub fn record_delayed() {
        MESSAGES_ADDED_TOTAL.with_label_values(&["delayed"]).inc();
    }

    /// Record a message served from this consumer's pending entries
    pub fn record_received_pending() {
        MESSAGES_RECEIVED_TOTAL.with_label_values(&["pending"]).inc();
    }

    /// Record a message read as a new entry
    pub fn record_received_new() {
        MESSAGES_RECEIVED_TOTAL.with_label_values(&["new"]).inc();
    }

    /// Record delayed messages moved into the stream
    pub fn record_transferred(count: u64) {
        DELAYED_TRANSFERRED_TOTAL.inc_by(count);
    }

    /// Record an acknowledgement
    pub fn record_acked() {
        MESSAGES_ACKED_TOTAL.inc();
    }

    /// Record a rejection
    pub fn record_rejected() {
        MESSAGES_REJECTED_TOTAL.inc();
    }

    /// Record a delete that failed after settlement
    pub fn record_purge_failure() {
        PURGE_FAILURES_TOTAL.inc();
    }

    /// Record a claim attempt
    pub fn record_claim(outcome: ClaimOutcome) {
        CLAIMS_TOTAL.with_label_values(&[outcome.label()]).inc();
    }
}

/// Helper struct for recording backend metrics
pub struct BackendMetrics;

impl BackendMetrics {
    /// Record a failed backend operation
    pub fn record_error(operation: &str) {
        BACKEND_ERRORS_TOTAL.with_label_values(&[operation]).inc();
    }
}
