//! Fixed window counter.
//!
//! Windows are aligned to multiples of `window_ms` since the epoch rather than
//! to a key's first request, so every key rolls over at the same instant.
//! Memory per key is constant; the price is that up to twice the limit can
//! pass across a window boundary.

use crate::ratelimit::entry::{LimitEntry, RateLimitResult};
use crate::ratelimit::rules::RateLimitConfig;

/// Start of the window containing `now`.
fn window_start(now: u64, window_ms: u64) -> u64 {
    (now / window_ms) * window_ms
}

pub(super) fn decide(
    entry: Option<LimitEntry>,
    now: u64,
    config: &RateLimitConfig,
) -> (LimitEntry, RateLimitResult) {
    let window_start = window_start(now, config.window_ms);
    let reset_time = window_start.saturating_add(config.window_ms);

    match entry {
        Some(mut entry) if entry.window_start == window_start => {
            entry.last_request = now;
            if entry.count >= config.max_requests {
                return (entry, RateLimitResult::denied(reset_time, now));
            }
            entry.count += 1;
            let remaining = config.max_requests - entry.count;
            (entry, RateLimitResult::admitted(remaining, reset_time))
        }
        // No entry yet, or the stored one belongs to an earlier window.
        _ => (
            LimitEntry::first(now, window_start),
            RateLimitResult::admitted(config.max_requests - 1, reset_time),
        ),
    }
}

pub(super) fn status(entry: &LimitEntry, now: u64, config: &RateLimitConfig) -> RateLimitResult {
    let window_start = window_start(now, config.window_ms);
    let reset_time = window_start.saturating_add(config.window_ms);
    let used = if entry.window_start == window_start {
        entry.count
    } else {
        0
    };

    match config.max_requests.saturating_sub(used) {
        0 => RateLimitResult::denied(reset_time, now),
        remaining => RateLimitResult::admitted(remaining, reset_time),
    }
}

pub(super) fn refund(entry: &mut LimitEntry) {
    entry.count = entry.count.saturating_sub(1);
}
