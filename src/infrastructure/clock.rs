//! Time sources for the transport.
//!
//! Delay scheduling, claim throttling and pending idle times are all computed
//! from a [`Clock`], so tests can drive them with a [`ManualClock`] instead of
//! sleeping.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

/// Wall-clock time source.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> i64;

    /// Microseconds since the Unix epoch.
    fn now_micros(&self) -> i64;
}

/// Clock backed by the system time.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }

    fn now_micros(&self) -> i64 {
        chrono::Utc::now().timestamp_micros()
    }
}

/// Manually advanced clock.
///
/// Starts at the given instant and only moves when [`ManualClock::advance`]
/// or [`ManualClock::set_ms`] is called.
#[derive(Debug)]
pub struct ManualClock {
    micros: AtomicI64,
}

impl ManualClock {
    /// Create a clock frozen at `start_ms`.
    pub fn new(start_ms: i64) -> Self {
        Self {
            micros: AtomicI64::new(start_ms.saturating_mul(1000)),
        }
    }

    /// Create a clock frozen at the current system time.
    pub fn starting_now() -> Self {
        Self::new(SystemClock.now_ms())
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        let micros = i64::try_from(by.as_micros()).unwrap_or(i64::MAX);
        self.micros.fetch_add(micros, Ordering::AcqRel);
    }

    /// Jump to an absolute time in milliseconds.
    pub fn set_ms(&self, ms: i64) {
        self.micros.store(ms.saturating_mul(1000), Ordering::Release);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.micros.load(Ordering::Acquire) / 1000
    }

    fn now_micros(&self) -> i64 {
        self.micros.load(Ordering::Acquire)
    }
}
