//! Wrapping async operations with admission control.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tracing::warn;

use super::manager::LimiterManager;
use crate::error::TurnstileError;

/// Error returned by a [`RateLimited`] operation.
#[derive(Debug, Error)]
pub enum GuardedError<E> {
    /// The call was denied, or the limiter could not be consulted.
    #[error(transparent)]
    Admission(#[from] TurnstileError),

    /// The call was admitted and the operation itself failed.
    #[error("{0}")]
    Operation(E),
}

impl<E> GuardedError<E> {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, GuardedError::Admission(e) if e.is_rate_limited())
    }

    /// The operation's own error, if that is what failed.
    pub fn into_operation(self) -> Option<E> {
        match self {
            GuardedError::Operation(e) => Some(e),
            GuardedError::Admission(_) => None,
        }
    }
}

/// An async operation that must be admitted by a named limiter first.
///
/// `identity` picks the caller identity out of the operation's input. Every
/// call is checked through the shared [`LimiterManager`]; denied calls never
/// reach the operation. Admitted calls report their outcome back, so the
/// limiter's skip flags can refund them.
///
/// ```no_run
/// # use std::sync::Arc;
/// # use turnstile::ratelimit::{LimiterManager, RateLimited, policies};
/// # async fn example() {
/// let manager = Arc::new(LimiterManager::new());
/// manager.initialize_defaults().unwrap();
///
/// let export = RateLimited::new(
///     manager,
///     policies::DATA_EXPORT,
///     |user: &String| user.clone(),
///     |user: String| async move { Ok::<_, std::io::Error>(format!("report for {user}")) },
/// );
/// let report = export.call("staff-42".to_string()).await;
/// # }
/// ```
#[derive(Clone)]
pub struct RateLimited<K, F> {
    manager: Arc<LimiterManager>,
    limiter: String,
    identity: K,
    operation: F,
}

impl<K, F> RateLimited<K, F> {
    pub fn new(
        manager: Arc<LimiterManager>,
        limiter: impl Into<String>,
        identity: K,
        operation: F,
    ) -> Self {
        Self {
            manager,
            limiter: limiter.into(),
            identity,
            operation,
        }
    }

    /// Name of the limiter consulted on every call.
    pub fn limiter(&self) -> &str {
        &self.limiter
    }

    /// Check the caller, then run the operation if admitted.
    pub async fn call<I, T, E, Fut>(&self, input: I) -> Result<T, GuardedError<E>>
    where
        K: Fn(&I) -> String,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let identity = (self.identity)(&input);
        self.manager.enforce(&self.limiter, &identity)?;

        let outcome = (self.operation)(input).await;

        if let Err(e) = self
            .manager
            .record_outcome(&self.limiter, &identity, outcome.is_ok())
        {
            // The limiter was removed while the operation ran.
            warn!(limiter = %self.limiter, error = %e, "Could not record operation outcome");
        }

        outcome.map_err(GuardedError::Operation)
    }
}

impl<K, F> fmt::Debug for RateLimited<K, F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RateLimited")
            .field("limiter", &self.limiter)
            .finish_non_exhaustive()
    }
}
