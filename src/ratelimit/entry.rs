//! Per-key limiter state and the decision handed back to callers.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// State for the windowed algorithms (fixed window, sliding window, leaky bucket).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitEntry {
    /// Requests counted in the current window, or the bucket fill level
    pub count: u64,
    /// Start of the aligned window (fixed), oldest live timestamp (sliding)
    /// or the drain anchor (leaky)
    pub window_start: u64,
    /// Last time this key was checked
    pub last_request: u64,
    /// Request timestamps inside the window; only the sliding window fills this
    pub timestamps: VecDeque<u64>,
}

impl LimitEntry {
    /// A fresh entry with one request counted at `now`.
    pub fn first(now: u64, window_start: u64) -> Self {
        Self {
            count: 1,
            window_start,
            last_request: now,
            timestamps: VecDeque::new(),
        }
    }
}

/// State for the token bucket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenBucketEntry {
    /// Tokens currently available, always within `0..=capacity`
    pub tokens: u64,
    /// Last time tokens were added
    pub last_refill: u64,
    /// Maximum number of tokens the bucket holds
    pub capacity: u64,
}

/// What a limiter stores per key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    Window(LimitEntry),
    Bucket(TokenBucketEntry),
}

impl EntryState {
    /// Timestamp the sweep uses to judge idleness.
    pub fn last_activity(&self) -> u64 {
        match self {
            EntryState::Window(entry) => entry.last_request,
            EntryState::Bucket(entry) => entry.last_refill,
        }
    }

    pub(crate) fn into_window(self) -> Option<LimitEntry> {
        match self {
            EntryState::Window(entry) => Some(entry),
            EntryState::Bucket(_) => None,
        }
    }

    pub(crate) fn into_bucket(self) -> Option<TokenBucketEntry> {
        match self {
            EntryState::Bucket(entry) => Some(entry),
            EntryState::Window(_) => None,
        }
    }
}

/// The outcome of a rate limit check.
///
/// Every algorithm produces this same shape, so callers never need to know
/// which one a limiter uses. A denied result always reports `remaining == 0`
/// and carries a `retry_after`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitResult {
    /// Whether the operation may proceed
    pub allowed: bool,
    /// Operations still permitted before the next denial
    pub remaining: u64,
    /// Epoch milliseconds at which the state next changes in the caller's favour
    pub reset_time: u64,
    /// Seconds to wait before retrying; only present on denial
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl RateLimitResult {
    /// An admission with `remaining` operations left.
    pub fn admitted(remaining: u64, reset_time: u64) -> Self {
        Self {
            allowed: true,
            remaining,
            reset_time,
            retry_after: None,
        }
    }

    /// A denial lifting at `reset_time`, observed at `now`.
    ///
    /// `retry_after` is rounded up to whole seconds and is never zero.
    pub fn denied(reset_time: u64, now: u64) -> Self {
        let wait_ms = reset_time.saturating_sub(now);
        Self {
            allowed: false,
            remaining: 0,
            reset_time,
            retry_after: Some(wait_ms.div_ceil(1000).max(1)),
        }
    }

    /// `retry_after` as a [`Duration`].
    pub fn retry_after_duration(&self) -> Option<Duration> {
        self.retry_after.map(Duration::from_secs)
    }
}
