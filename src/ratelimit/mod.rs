//! Rate limiting logic and state management.

mod algorithm;
mod entry;
mod guard;
mod key;
mod limiter;
mod manager;
pub mod policies;
mod rules;

pub use entry::{EntryState, LimitEntry, RateLimitResult, TokenBucketEntry};
pub use guard::{GuardedError, RateLimited};
pub use key::KeyGenerator;
pub use limiter::{Limiter, DEFAULT_SWEEP_INTERVAL};
pub use manager::LimiterManager;
pub use policies::PolicyCatalog;
pub use rules::{Algorithm, OnLimitReached, RateLimitConfig, RateLimitRule};
