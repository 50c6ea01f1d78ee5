//! Time sources for the limiters.
//!
//! All limiter arithmetic is done in whole milliseconds since the Unix epoch.
//! The algorithms tolerate coarse granularity but assume the clock never
//! moves backwards.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;

/// Abstraction over "what time is it", so limiters can be driven by a
/// controllable clock in tests and simulations.
pub trait Clock: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now_ms(&self) -> Result<u64, ClockError>;
}

/// Errors produced by a clock.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    /// The system clock reports a time before the Unix epoch.
    #[error("system time is before the Unix epoch ({0} ms)")]
    BeforeEpoch(i64),
}

/// Wall-clock time from the operating system.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> Result<u64, ClockError> {
        let millis = Utc::now().timestamp_millis();
        u64::try_from(millis).map_err(|_| ClockError::BeforeEpoch(millis))
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same underlying time, so a test can keep one handle and
/// hand another to a limiter.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    millis: Arc<AtomicU64>,
}

impl ManualClock {
    /// Create a clock frozen at `start_ms`.
    pub fn new(start_ms: u64) -> Self {
        Self {
            millis: Arc::new(AtomicU64::new(start_ms)),
        }
    }

    /// Move the clock forward.
    pub fn advance(&self, millis: u64) {
        self.millis.fetch_add(millis, Ordering::SeqCst);
    }

    /// Jump to an absolute time.
    pub fn set(&self, millis: u64) {
        self.millis.store(millis, Ordering::SeqCst);
    }

    /// Read the current time without going through the trait.
    pub fn get(&self) -> u64 {
        self.millis.load(Ordering::SeqCst)
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> Result<u64, ClockError> {
        Ok(self.get())
    }
}
