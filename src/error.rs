//! Error types for Turnstile.

use thiserror::Error;

use crate::clock::ClockError;

/// Main error type for Turnstile operations.
#[derive(Error, Debug)]
pub enum TurnstileError {
    /// An algorithm name that is not one of the four known strategies.
    #[error("Unknown rate limit algorithm: '{0}' (expected fixed_window, sliding_window, token_bucket or leaky_bucket)")]
    UnknownAlgorithm(String),

    /// A limiter configuration that can never admit anything.
    #[error("Invalid rate limit configuration: {0}")]
    InvalidConfig(String),

    /// A check against a limiter name that was never registered.
    #[error("Rate limiter not found: {0}")]
    LimiterNotFound(String),

    /// An operation was denied by the named limiter.
    #[error("Rate limit exceeded for '{limiter}'{}", retry_suffix(.retry_after))]
    RateLimited {
        /// The limiter that denied the operation
        limiter: String,
        /// Seconds to wait before retrying, when known
        retry_after: Option<u64>,
    },

    /// The time source failed
    #[error("Clock error: {0}")]
    Clock(#[from] ClockError),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn retry_suffix(retry_after: &Option<u64>) -> String {
    match retry_after {
        Some(secs) => format!(", retry after {secs}s"),
        None => String::new(),
    }
}

impl TurnstileError {
    /// Whether this error is an admission denial rather than a failure.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, TurnstileError::RateLimited { .. })
    }

    /// Seconds to wait before retrying, if this is a denial that carries one.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            TurnstileError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<config::ConfigError> for TurnstileError {
    fn from(err: config::ConfigError) -> Self {
        TurnstileError::Config(err.to_string())
    }
}

/// Result type alias for Turnstile operations.
pub type Result<T> = std::result::Result<T, TurnstileError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limited_display_includes_wait() {
        let err = TurnstileError::RateLimited {
            limiter: "login".to_string(),
            retry_after: Some(42),
        };
        assert_eq!(err.to_string(), "Rate limit exceeded for 'login', retry after 42s");
        assert!(err.is_rate_limited());
        assert_eq!(err.retry_after(), Some(42));
    }

    #[test]
    fn test_rate_limited_display_without_wait() {
        let err = TurnstileError::RateLimited {
            limiter: "export".to_string(),
            retry_after: None,
        };
        assert_eq!(err.to_string(), "Rate limit exceeded for 'export'");
    }

    #[test]
    fn test_other_errors_are_not_denials() {
        let err = TurnstileError::LimiterNotFound("nope".to_string());
        assert!(!err.is_rate_limited());
        assert_eq!(err.retry_after(), None);
    }
}
