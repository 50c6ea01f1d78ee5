//! Rate limit policies: algorithm selection and per-limiter configuration.
//!
//! [`RateLimitConfig`] is the runtime form a [`Limiter`](super::Limiter) is
//! built from. [`RateLimitRule`] is its serializable twin used by the policy
//! catalog and configuration files; converting a rule is where unknown
//! algorithm names are rejected.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::entry::RateLimitResult;
use super::key::{derive_key, KeyGenerator};
use crate::error::{Result, TurnstileError};

/// The admission-control strategy a limiter runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Algorithm {
    /// Counter per epoch-aligned window
    FixedWindow,
    /// Exact log of request timestamps over a rolling window
    SlidingWindow,
    /// Refilling bucket that tolerates bursts up to its capacity
    TokenBucket,
    /// Draining bucket that smooths bursts to a fixed rate
    LeakyBucket,
}

impl Algorithm {
    /// Every known algorithm.
    pub const ALL: [Algorithm; 4] = [
        Algorithm::FixedWindow,
        Algorithm::SlidingWindow,
        Algorithm::TokenBucket,
        Algorithm::LeakyBucket,
    ];

    /// Canonical configuration name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::FixedWindow => "fixed_window",
            Algorithm::SlidingWindow => "sliding_window",
            Algorithm::TokenBucket => "token_bucket",
            Algorithm::LeakyBucket => "leaky_bucket",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Algorithm {
    type Err = TurnstileError;

    /// Accepts `fixed_window`, `FIXED_WINDOW` and `fixed-window` alike.
    fn from_str(s: &str) -> Result<Self> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        Algorithm::ALL
            .into_iter()
            .find(|algorithm| algorithm.as_str() == normalized)
            .ok_or_else(|| TurnstileError::UnknownAlgorithm(s.to_string()))
    }
}

/// Callback run with the key and the denial whenever a limiter denies.
pub type OnLimitReached = Arc<dyn Fn(&str, &RateLimitResult) + Send + Sync>;

/// Immutable policy for a single limiter.
#[derive(Clone)]
pub struct RateLimitConfig {
    /// Length of the window in milliseconds
    pub window_ms: u64,
    /// Operations admitted per window (bucket capacity for the bucket algorithms)
    pub max_requests: u64,
    /// Strategy used to decide admissions
    pub algorithm: Algorithm,
    /// Optional identity-to-key transformation
    pub key_generator: Option<KeyGenerator>,
    /// Refund admissions whose operation succeeded
    pub skip_successful_requests: bool,
    /// Refund admissions whose operation failed
    pub skip_failed_requests: bool,
    /// Invoked on every denial; a panic inside it is caught and logged
    pub on_limit_reached: Option<OnLimitReached>,
}

impl RateLimitConfig {
    /// Create a configuration admitting `max_requests` per `window_ms`.
    pub fn new(algorithm: Algorithm, max_requests: u64, window_ms: u64) -> Self {
        Self {
            window_ms,
            max_requests,
            algorithm,
            key_generator: None,
            skip_successful_requests: false,
            skip_failed_requests: false,
            on_limit_reached: None,
        }
    }

    /// Builder-style: derive keys with `generator`.
    pub fn key_generator(mut self, generator: KeyGenerator) -> Self {
        self.key_generator = Some(generator);
        self
    }

    /// Builder-style: do not charge operations that succeed.
    pub fn skip_successful_requests(mut self, skip: bool) -> Self {
        self.skip_successful_requests = skip;
        self
    }

    /// Builder-style: do not charge operations that fail.
    pub fn skip_failed_requests(mut self, skip: bool) -> Self {
        self.skip_failed_requests = skip;
        self
    }

    /// Builder-style: run `callback` whenever a key is denied.
    pub fn on_limit_reached<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &RateLimitResult) + Send + Sync + 'static,
    {
        self.on_limit_reached = Some(Arc::new(callback));
        self
    }

    /// The window as a [`Duration`].
    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Key a caller identity maps to under this policy.
    pub fn derive_key(&self, identity: &str) -> String {
        derive_key(self.key_generator.as_ref(), identity)
    }

    /// Reject policies that could never admit anything.
    pub fn validate(&self) -> Result<()> {
        if self.window_ms == 0 {
            return Err(TurnstileError::InvalidConfig(
                "window_ms must be greater than zero".to_string(),
            ));
        }
        if self.max_requests == 0 {
            return Err(TurnstileError::InvalidConfig(
                "max_requests must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for RateLimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimitConfig")
            .field("window_ms", &self.window_ms)
            .field("max_requests", &self.max_requests)
            .field("algorithm", &self.algorithm)
            .field("key_generator", &self.key_generator)
            .field("skip_successful_requests", &self.skip_successful_requests)
            .field("skip_failed_requests", &self.skip_failed_requests)
            .field("on_limit_reached", &self.on_limit_reached.is_some())
            .finish()
    }
}

/// Serializable description of a policy, as found in configuration files.
///
/// ```yaml
/// window_ms: 900000
/// max_requests: 5
/// algorithm: fixed_window
/// key_prefix: login
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    /// Length of the window in milliseconds
    pub window_ms: u64,
    /// Operations admitted per window
    pub max_requests: u64,
    /// Algorithm name; parsed when the rule is converted
    pub algorithm: String,
    /// Refund admissions whose operation succeeded
    #[serde(default)]
    pub skip_successful_requests: bool,
    /// Refund admissions whose operation failed
    #[serde(default)]
    pub skip_failed_requests: bool,
    /// Namespace keys as `"{key_prefix}:{identity}"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_prefix: Option<String>,
}

impl RateLimitRule {
    /// Convert into a runtime configuration.
    ///
    /// Fails with [`TurnstileError::UnknownAlgorithm`] instead of falling
    /// back to a default strategy.
    pub fn into_config(&self) -> Result<RateLimitConfig> {
        let algorithm: Algorithm = self.algorithm.parse()?;
        let mut config = RateLimitConfig::new(algorithm, self.max_requests, self.window_ms)
            .skip_successful_requests(self.skip_successful_requests)
            .skip_failed_requests(self.skip_failed_requests);
        if let Some(ref prefix) = self.key_prefix {
            config = config.key_generator(KeyGenerator::prefixed(prefix.clone()));
        }
        config.validate()?;
        Ok(config)
    }

    /// Describe a runtime configuration. Callbacks and custom key generators
    /// have no serializable form and are left out.
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            window_ms: config.window_ms,
            max_requests: config.max_requests,
            algorithm: config.algorithm.as_str().to_string(),
            skip_successful_requests: config.skip_successful_requests,
            skip_failed_requests: config.skip_failed_requests,
            key_prefix: None,
        }
    }
}
