//! Turnstile - in-process admission control.
//!
//! This crate decides whether a caller identity may perform an operation
//! right now. Each named [`Limiter`](ratelimit::Limiter) runs one of four
//! algorithms (fixed window, sliding window, token bucket, leaky bucket)
//! over its own keys, and a [`LimiterManager`](ratelimit::LimiterManager)
//! combines several of them behind one registry seeded from a catalog of
//! preset policies.

pub mod clock;
pub mod config;
pub mod error;
pub mod ratelimit;
