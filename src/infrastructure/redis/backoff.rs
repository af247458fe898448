//! Exponential backoff for retrying failed transport calls

use std::time::Duration;

use rand::Rng;

use crate::config::WorkerSettings;

/// Exponential backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// First delay in milliseconds
    pub initial_delay_ms: u64,
    /// Upper bound in milliseconds
    pub max_delay_ms: u64,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 100,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl From<&WorkerSettings> for BackoffConfig {
    fn from(settings: &WorkerSettings) -> Self {
        Self {
            initial_delay_ms: settings.backoff_initial_delay_ms,
            max_delay_ms: settings.backoff_max_delay_ms,
            ..Self::default()
        }
    }
}

/// Exponential backoff calculator with jitter.
///
/// The first delay is `initial_delay_ms`; each following one is multiplied and
/// capped. Jitter is applied to the returned delay only, so it never compounds.
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Delay to wait before the next retry
    pub fn next_delay(&mut self) -> Duration {
        let exponent = self.attempt.min(63) as i32;
        self.attempt = self.attempt.saturating_add(1);

        let base = self.config.initial_delay_ms as f64 * self.config.multiplier.powi(exponent);
        let capped = base.min(self.config.max_delay_ms as f64);

        let delay = if self.config.jitter_factor > 0.0 {
            let range = capped * self.config.jitter_factor;
            capped + rand::rng().random_range(-range..=range)
        } else {
            capped
        };

        Duration::from_millis(delay.max(1.0) as u64)
    }

    /// Back to the first delay, after a success
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Retries since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(BackoffConfig::default())
    }
}
