//! Tracing subscriber setup.
//!
//! `RUST_LOG`, when set, takes precedence over the configured filter.

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::{LogFormat, LogSettings};

/// Result type for telemetry operations
pub type TelemetryResult<T> = Result<T, TelemetryError>;

#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Invalid log filter \"{filter}\": {reason}")]
    Filter { filter: String, reason: String },
    #[error("Failed to install tracing subscriber: {0}")]
    Install(String),
}

/// Build the filter from `RUST_LOG`, falling back to `settings.filter`.
pub fn env_filter(settings: &LogSettings) -> TelemetryResult<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&settings.filter).map_err(|e| TelemetryError::Filter {
        filter: settings.filter.clone(),
        reason: e.to_string(),
    })
}

/// Install the global subscriber: plain text or JSON lines.
pub fn init_tracing(settings: &LogSettings) -> TelemetryResult<()> {
    let filter = env_filter(settings)?;
    let registry = tracing_subscriber::registry().with(filter);

    let installed = match settings.format {
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).try_init(),
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().flatten_event(true))
            .try_init(),
    };
    installed.map_err(|e| TelemetryError::Install(e.to_string()))
}
