//! Sliding window log.
//!
//! Keeps every request timestamp in the half-open window `(now - window_ms, now]`,
//! so the limit holds exactly over any rolling window. Memory per key grows
//! with the number of requests inside one window.
//!
//! Denied requests are logged too: a caller that keeps hammering keeps its
//! window full.

use crate::ratelimit::entry::{LimitEntry, RateLimitResult};
use crate::ratelimit::rules::RateLimitConfig;

/// A timestamp has left the window once a full `window_ms` has passed since it.
fn expired(ts: u64, now: u64, config: &RateLimitConfig) -> bool {
    ts.saturating_add(config.window_ms) <= now
}

pub(super) fn decide(
    entry: Option<LimitEntry>,
    now: u64,
    config: &RateLimitConfig,
) -> (LimitEntry, RateLimitResult) {
    let mut entry = entry.unwrap_or_else(|| LimitEntry {
        count: 0,
        window_start: now,
        last_request: now,
        timestamps: Default::default(),
    });

    while entry
        .timestamps
        .front()
        .is_some_and(|&ts| expired(ts, now, config))
    {
        entry.timestamps.pop_front();
    }
    entry.timestamps.push_back(now);
    entry.count = entry.timestamps.len() as u64;
    entry.last_request = now;
    entry.window_start = entry.timestamps.front().copied().unwrap_or(now);

    let result = if entry.count <= config.max_requests {
        RateLimitResult::admitted(
            config.max_requests - entry.count,
            entry.window_start.saturating_add(config.window_ms),
        )
    } else {
        RateLimitResult::denied(reopens_at(&entry, config), now)
    };
    (entry, result)
}

/// When enough timestamps will have expired for one more admission.
fn reopens_at(entry: &LimitEntry, config: &RateLimitConfig) -> u64 {
    let index = entry.timestamps.len() - config.max_requests as usize;
    entry.timestamps[index].saturating_add(config.window_ms)
}

pub(super) fn status(entry: &LimitEntry, now: u64, config: &RateLimitConfig) -> RateLimitResult {
    let stale = entry
        .timestamps
        .partition_point(|&ts| expired(ts, now, config));
    let live = (entry.timestamps.len() - stale) as u64;

    if live >= config.max_requests {
        return RateLimitResult::denied(reopens_at(entry, config), now);
    }
    let reset_time = entry
        .timestamps
        .get(stale)
        .map_or(now, |&oldest| oldest.saturating_add(config.window_ms));
    RateLimitResult::admitted(config.max_requests - live, reset_time)
}

pub(super) fn refund(entry: &mut LimitEntry) {
    entry.timestamps.pop_back();
    entry.count = entry.timestamps.len() as u64;
}
