//! Token bucket.
//!
//! A bucket of `max_requests` tokens refills at `max_requests` per
//! `window_ms`, in whole tokens. Each admission spends one token, so a key
//! that has been quiet can burst up to the full capacity.

use super::{unit_interval_ms, units_for};
use crate::ratelimit::entry::{RateLimitResult, TokenBucketEntry};
use crate::ratelimit::rules::RateLimitConfig;

/// Add the whole tokens earned since the last refill.
///
/// `last_refill` only moves when at least one token is added, so partial
/// progress towards the next token is never lost.
fn refill(entry: &mut TokenBucketEntry, now: u64, config: &RateLimitConfig) {
    let elapsed = now.saturating_sub(entry.last_refill);
    let earned = units_for(elapsed, config);
    if earned > 0 {
        entry.tokens = entry.tokens.saturating_add(earned).min(entry.capacity);
        entry.last_refill = now;
    }
}

fn next_refill_at(entry: &TokenBucketEntry, config: &RateLimitConfig) -> u64 {
    entry.last_refill.saturating_add(unit_interval_ms(config))
}

pub(super) fn decide(
    entry: Option<TokenBucketEntry>,
    now: u64,
    config: &RateLimitConfig,
) -> (TokenBucketEntry, RateLimitResult) {
    let Some(mut entry) = entry else {
        // The first request spends one token of a full bucket.
        let entry = TokenBucketEntry {
            tokens: config.max_requests - 1,
            last_refill: now,
            capacity: config.max_requests,
        };
        let reset_time = next_refill_at(&entry, config);
        return (entry, RateLimitResult::admitted(config.max_requests - 1, reset_time));
    };

    refill(&mut entry, now, config);
    let reset_time = next_refill_at(&entry, config);
    if entry.tokens == 0 {
        return (entry, RateLimitResult::denied(reset_time, now));
    }
    entry.tokens -= 1;
    let remaining = entry.tokens;
    (entry, RateLimitResult::admitted(remaining, reset_time))
}

pub(super) fn status(
    entry: &TokenBucketEntry,
    now: u64,
    config: &RateLimitConfig,
) -> RateLimitResult {
    let mut projected = entry.clone();
    refill(&mut projected, now, config);
    let reset_time = next_refill_at(&projected, config);
    match projected.tokens {
        0 => RateLimitResult::denied(reset_time, now),
        tokens => RateLimitResult::admitted(tokens, reset_time),
    }
}

pub(super) fn refund(entry: &mut TokenBucketEntry) {
    entry.tokens = (entry.tokens + 1).min(entry.capacity);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::Algorithm;

    fn config(max_requests: u64, window_ms: u64) -> RateLimitConfig {
        RateLimitConfig::new(Algorithm::TokenBucket, max_requests, window_ms)
    }

    fn run(
        entry: &mut Option<TokenBucketEntry>,
        now: u64,
        config: &RateLimitConfig,
    ) -> RateLimitResult {
        let (next, result) = decide(entry.take(), now, config);
        *entry = Some(next);
        result
    }

    #[test]
    fn test_first_request_spends_one_token() {
        let config = config(5, 60_000);
        let (entry, result) = decide(None, 1_000, &config);

        assert_eq!(entry.tokens, 4);
        assert_eq!(entry.capacity, 5);
        assert_eq!(result, RateLimitResult::admitted(4, 13_000));
    }

    #[test]
    fn test_burst_then_single_token_refill() {
        let config = config(5, 60_000);
        let mut entry = None;

        for expected in [4, 3, 2, 1, 0] {
            assert_eq!(run(&mut entry, 0, &config).remaining, expected);
        }
        let denied = run(&mut entry, 0, &config);
        assert!(!denied.allowed);
        assert_eq!(denied.reset_time, 12_000);
        assert_eq!(denied.retry_after, Some(12));

        // Not quite one token yet.
        assert!(!run(&mut entry, 11_999, &config).allowed);

        // One fifth of the window refills exactly one token.
        let result = run(&mut entry, 12_000, &config);
        assert!(result.allowed);
        assert_eq!(result.remaining, 0);
    }

    #[test]
    fn test_last_refill_only_moves_when_tokens_are_added() {
        let config = config(5, 60_000);
        let (mut entry, _) = decide(None, 0, &config);

        refill(&mut entry, 5_000, &config);
        assert_eq!(entry.last_refill, 0);

        refill(&mut entry, 12_500, &config);
        assert_eq!(entry.last_refill, 12_500);
        assert_eq!(entry.tokens, 5);
    }

    #[test]
    fn test_tokens_stay_within_capacity() {
        let config = config(3, 900);
        let mut entry = None;

        for now in (0..20_000u64).step_by(113) {
            run(&mut entry, now, &config);
            let tokens = entry.as_ref().unwrap().tokens;
            assert!(tokens <= 3, "tokens {tokens} above capacity at {now}");
        }

        // A long idle period cannot overfill the bucket.
        refill(entry.as_mut().unwrap(), u64::MAX / 2, &config);
        assert_eq!(entry.unwrap().tokens, 3);
    }

    #[test]
    fn test_full_bucket_after_one_idle_window() {
        let config = config(4, 1_000);
        let mut entry = None;
        for _ in 0..4 {
            run(&mut entry, 0, &config);
        }
        let entry = entry.unwrap();
        assert_eq!(entry.tokens, 0);

        assert_eq!(status(&entry, 1_000, &config).remaining, 4);
        // status is a projection only
        assert_eq!(entry.tokens, 0);
    }

    #[test]
    fn test_status_of_empty_bucket_is_denied() {
        let config = config(1, 10_000);
        let (entry, _) = decide(None, 0, &config);

        let result = status(&entry, 2_500, &config);
        assert!(!result.allowed);
        assert_eq!(result.reset_time, 10_000);
        assert_eq!(result.retry_after, Some(8));
    }

    #[test]
    fn test_refund_is_clamped() {
        let mut entry = TokenBucketEntry {
            tokens: 2,
            last_refill: 0,
            capacity: 2,
        };
        refund(&mut entry);
        assert_eq!(entry.tokens, 2);
    }
}
