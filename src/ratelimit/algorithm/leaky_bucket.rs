//! Leaky bucket.
//!
//! Each admission adds one unit to a bucket of capacity `max_requests`; the
//! bucket drains at `max_requests` per `window_ms`. A full bucket denies.
//! Unlike the token bucket, a quiet period does not bank extra allowance
//! beyond an empty bucket.
//!
//! `window_start` serves as the drain anchor. It advances by the time the
//! drained units took, never to `now`, so the fraction of an interval already
//! elapsed carries over and checks arriving at any rate see the exact drain.

use super::{unit_interval_ms, units_for};
use crate::ratelimit::entry::{LimitEntry, RateLimitResult};
use crate::ratelimit::rules::RateLimitConfig;

fn leak(entry: &mut LimitEntry, now: u64, config: &RateLimitConfig) {
    let elapsed = now.saturating_sub(entry.window_start);
    let leaked = units_for(elapsed, config);
    if leaked > 0 {
        entry.count = entry.count.saturating_sub(leaked);
        entry.window_start = entry
            .window_start
            .saturating_add(drain_time_ms(leaked, config))
            .min(now);
    }
}

/// Milliseconds it takes to drain `units`, rounded down.
fn drain_time_ms(units: u64, config: &RateLimitConfig) -> u64 {
    let millis = u128::from(units) * u128::from(config.window_ms) / u128::from(config.max_requests);
    u64::try_from(millis).unwrap_or(u64::MAX)
}

fn next_leak_at(entry: &LimitEntry, config: &RateLimitConfig) -> u64 {
    entry.window_start.saturating_add(unit_interval_ms(config))
}

pub(super) fn decide(
    entry: Option<LimitEntry>,
    now: u64,
    config: &RateLimitConfig,
) -> (LimitEntry, RateLimitResult) {
    let Some(mut entry) = entry else {
        let entry = LimitEntry::first(now, now);
        let reset_time = next_leak_at(&entry, config);
        return (entry, RateLimitResult::admitted(config.max_requests - 1, reset_time));
    };

    leak(&mut entry, now, config);
    entry.last_request = now;

    if entry.count >= config.max_requests {
        let reset_time = next_leak_at(&entry, config);
        return (entry, RateLimitResult::denied(reset_time, now));
    }
    if entry.count == 0 {
        // An empty bucket starts draining from the unit being added now.
        entry.window_start = now;
    }
    entry.count += 1;
    let remaining = config.max_requests - entry.count;
    let reset_time = next_leak_at(&entry, config);
    (entry, RateLimitResult::admitted(remaining, reset_time))
}

pub(super) fn status(entry: &LimitEntry, now: u64, config: &RateLimitConfig) -> RateLimitResult {
    let mut projected = entry.clone();
    leak(&mut projected, now, config);
    let reset_time = next_leak_at(&projected, config);
    match config.max_requests.saturating_sub(projected.count) {
        0 => RateLimitResult::denied(reset_time, now),
        remaining => RateLimitResult::admitted(remaining, reset_time),
    }
}

pub(super) fn refund(entry: &mut LimitEntry) {
    entry.count = entry.count.saturating_sub(1);
}
