//! Admission-control strategies.
//!
//! Each strategy module exposes the same three functions:
//!
//! - `decide(entry, now, config)` consumes the key's previous state (if any)
//!   and returns the updated state together with the decision;
//! - `status(&entry, now, config)` projects the decision a key currently
//!   stands at without touching its state;
//! - `refund(&mut entry)` gives back one admission.
//!
//! Dispatch is a single `match` on [`Algorithm`] so adding a strategy is a
//! compile error everywhere it needs handling.

mod fixed_window;
mod leaky_bucket;
mod sliding_window;
mod token_bucket;

use super::entry::{EntryState, RateLimitResult};
use super::rules::{Algorithm, RateLimitConfig};

/// Run the configured algorithm for one request at `now`.
///
/// An entry whose representation does not match the algorithm is treated as
/// absent.
pub(crate) fn decide(
    entry: Option<EntryState>,
    now: u64,
    config: &RateLimitConfig,
) -> (EntryState, RateLimitResult) {
    match config.algorithm {
        Algorithm::FixedWindow => {
            let (entry, result) =
                fixed_window::decide(entry.and_then(EntryState::into_window), now, config);
            (EntryState::Window(entry), result)
        }
        Algorithm::SlidingWindow => {
            let (entry, result) =
                sliding_window::decide(entry.and_then(EntryState::into_window), now, config);
            (EntryState::Window(entry), result)
        }
        Algorithm::TokenBucket => {
            let (entry, result) =
                token_bucket::decide(entry.and_then(EntryState::into_bucket), now, config);
            (EntryState::Bucket(entry), result)
        }
        Algorithm::LeakyBucket => {
            let (entry, result) =
                leaky_bucket::decide(entry.and_then(EntryState::into_window), now, config);
            (EntryState::Window(entry), result)
        }
    }
}

/// Read-only view of where a key stands at `now`.
pub(crate) fn status(entry: &EntryState, now: u64, config: &RateLimitConfig) -> RateLimitResult {
    match (config.algorithm, entry) {
        (Algorithm::FixedWindow, EntryState::Window(entry)) => {
            fixed_window::status(entry, now, config)
        }
        (Algorithm::SlidingWindow, EntryState::Window(entry)) => {
            sliding_window::status(entry, now, config)
        }
        (Algorithm::TokenBucket, EntryState::Bucket(entry)) => {
            token_bucket::status(entry, now, config)
        }
        (Algorithm::LeakyBucket, EntryState::Window(entry)) => {
            leaky_bucket::status(entry, now, config)
        }
        // Mismatched state is ignored by `decide`, so the key is effectively fresh.
        _ => RateLimitResult::admitted(config.max_requests, now),
    }
}

/// Give back one admission previously charged to `entry`.
pub(crate) fn refund(entry: &mut EntryState, config: &RateLimitConfig) {
    match (config.algorithm, entry) {
        (Algorithm::FixedWindow, EntryState::Window(entry)) => fixed_window::refund(entry),
        (Algorithm::SlidingWindow, EntryState::Window(entry)) => sliding_window::refund(entry),
        (Algorithm::TokenBucket, EntryState::Bucket(entry)) => token_bucket::refund(entry),
        (Algorithm::LeakyBucket, EntryState::Window(entry)) => leaky_bucket::refund(entry),
        _ => {}
    }
}

/// Whole units accrued over `elapsed_ms` at `max_requests` per `window_ms`.
///
/// Shared by the token bucket (refill) and the leaky bucket (drain).
fn units_for(elapsed_ms: u64, config: &RateLimitConfig) -> u64 {
    let units = u128::from(elapsed_ms) * u128::from(config.max_requests) / u128::from(config.window_ms);
    u64::try_from(units).unwrap_or(u64::MAX)
}

/// Milliseconds needed to accrue one unit.
fn unit_interval_ms(config: &RateLimitConfig) -> u64 {
    config.window_ms.div_ceil(config.max_requests).max(1)
}
