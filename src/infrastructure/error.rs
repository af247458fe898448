//! Error types for the stream transport.
//!
//! Two layers:
//! - [`BackendError`]: what a [`StreamBackend`](crate::redis::StreamBackend) call reports.
//! - [`QueueError`]: what callers of the connection and transport see.
//!
//! [`ErrorTranslator`] is the single place where the first becomes the second.

use thiserror::Error;

use crate::metrics::BackendMetrics;

/// Errors surfaced to transport users.
///
/// Match on the variant to decide whether to retry, alert or dead-letter.
#[derive(Error, Debug)]
pub enum QueueError {
    /// DSN or option validation failed. Never retried.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The backend could not be reached or refused authentication.
    #[error("Redis connection failed: {0}")]
    Connection(String),

    /// A backend call completed but reported a failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// A dequeued envelope could not be interpreted. The entry has been rejected.
    #[error("Could not decode message \"{id}\": {reason}")]
    Decoding { id: String, reason: String },

    /// The message was acknowledged or rejected, but the follow-up delete failed.
    #[error("Message \"{id}\" was settled but could not be deleted from the stream: {reason}")]
    Purge { id: String, reason: String },
}

impl QueueError {
    /// Shorthand for an invalid configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        QueueError::InvalidConfiguration(message.into())
    }

    /// Shorthand for a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        QueueError::Transport(message.into())
    }

    /// Whether retrying the same call later can succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueueError::Connection(_) | QueueError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;

/// Errors reported by a backend adapter call.
#[derive(Error, Debug)]
pub enum BackendError {
    /// Error raised by the redis client (I/O, protocol or server error).
    #[error(transparent)]
    Redis(#[from] redis::RedisError),

    /// Server error reply text.
    #[error("{0}")]
    Server(String),

    /// The call returned a falsy result without saying why.
    #[error("{0}")]
    Rejected(String),

    /// No response within the configured read timeout.
    #[error("Timed out after {0} ms waiting for Redis")]
    Timeout(u64),

    /// The adapter has not been connected yet.
    #[error("Not connected")]
    NotConnected,
}

impl BackendError {
    /// Server error code (first word of the reply), if any.
    pub fn code(&self) -> Option<&str> {
        match self {
            BackendError::Redis(e) => e.code(),
            BackendError::Server(msg) => msg.split_whitespace().next(),
            _ => None,
        }
    }

    /// The consumer group already exists.
    pub fn is_busy_group(&self) -> bool {
        self.code() == Some("BUSYGROUP") || self.to_string().contains("BUSYGROUP")
    }

    /// The key or group does not exist.
    pub fn is_missing(&self) -> bool {
        self.code() == Some("NOGROUP") || self.to_string().contains("no such key")
    }

    /// The falsy-result case, where the backend error slot carries the real reason.
    pub fn is_ambiguous(&self) -> bool {
        matches!(self, BackendError::Rejected(_))
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Converts backend outcomes into [`QueueError`]s.
///
/// The backend error slot is taken (and so cleared) on every settle, whatever
/// the outcome, so an error left behind by one call is never reported by the next.
pub struct ErrorTranslator;

impl ErrorTranslator {
    /// Settle a backend result.
    ///
    /// `last_error` is the content of the backend error slot, already cleared.
    pub fn settle<T>(
        operation: &'static str,
        result: BackendResult<T>,
        last_error: Option<String>,
        context: &str,
    ) -> Result<T> {
        match result {
            Ok(value) => {
                if let Some(stale) = last_error {
                    tracing::debug!(
                        operation = operation,
                        context = %context,
                        stale_error = %stale,
                        "Discarded stale backend error"
                    );
                }
                Ok(value)
            }
            Err(err) => {
                let message = match (&err, last_error) {
                    (e, Some(slot)) if e.is_ambiguous() => slot,
                    (e, _) => e.to_string(),
                };

                BackendMetrics::record_error(operation);
                tracing::error!(
                    operation = operation,
                    context = %context,
                    error = %message,
                    "Redis transport call failed"
                );

                Err(QueueError::Transport(message))
            }
        }
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Transport(err.to_string())
    }
}

impl From<bincode::Error> for QueueError {
    fn from(err: bincode::Error) -> Self {
        QueueError::Transport(err.to_string())
    }
}
