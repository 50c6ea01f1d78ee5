//! Registry of named limiters.
//!
//! A [`LimiterManager`] lets several independent policies guard one logical
//! operation, e.g. a general API cap together with a tighter cap for
//! sensitive calls. Construct one per application and share it (typically
//! behind an `Arc`) with whatever needs admission control.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use super::entry::RateLimitResult;
use super::limiter::{Limiter, DEFAULT_SWEEP_INTERVAL};
use super::policies::PolicyCatalog;
use super::rules::RateLimitConfig;
use crate::clock::{Clock, SystemClock};
use crate::error::{Result, TurnstileError};

/// Named limiters, kept in registration order.
pub struct LimiterManager {
    limiters: RwLock<Vec<(String, Arc<Limiter>)>>,
    clock: Arc<dyn Clock>,
    sweep_interval: Duration,
    defaults_initialized: AtomicBool,
}

impl LimiterManager {
    /// Create an empty manager on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty manager whose limiters all read `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            limiters: RwLock::new(Vec::new()),
            clock,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            defaults_initialized: AtomicBool::new(false),
        }
    }

    /// Builder-style: sweep interval for limiters added from now on.
    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Register a limiter under `name`.
    ///
    /// An existing limiter with the same name is destroyed and replaced in
    /// place, keeping its position in the evaluation order. Invalid
    /// configurations are rejected before the registry is touched.
    pub fn add_limiter(&self, name: &str, config: RateLimitConfig) -> Result<()> {
        let limiter = Arc::new(Limiter::with_options(
            name,
            config,
            self.clock.clone(),
            self.sweep_interval,
        )?);

        let mut limiters = self.limiters.write();
        match limiters.iter_mut().find(|(existing, _)| existing == name) {
            Some((_, slot)) => {
                slot.destroy();
                *slot = limiter;
                info!(limiter = %name, "Rate limiter replaced");
            }
            None => limiters.push((name.to_string(), limiter)),
        }
        Ok(())
    }

    /// Destroy and unregister `name`. Returns whether it was registered.
    pub fn remove_limiter(&self, name: &str) -> bool {
        let removed = {
            let mut limiters = self.limiters.write();
            let index = limiters.iter().position(|(existing, _)| existing == name);
            index.map(|index| limiters.remove(index))
        };

        match removed {
            Some((_, limiter)) => {
                limiter.destroy();
                info!(limiter = %name, "Rate limiter removed");
                true
            }
            None => false,
        }
    }

    /// Look up a registered limiter.
    pub fn limiter(&self, name: &str) -> Result<Arc<Limiter>> {
        self.limiters
            .read()
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, limiter)| limiter.clone())
            .ok_or_else(|| TurnstileError::LimiterNotFound(name.to_string()))
    }

    /// Whether `name` is registered.
    pub fn contains(&self, name: &str) -> bool {
        self.limiters.read().iter().any(|(existing, _)| existing == name)
    }

    /// Registered names in evaluation order.
    pub fn limiter_names(&self) -> Vec<String> {
        self.limiters.read().iter().map(|(name, _)| name.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.limiters.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.read().is_empty()
    }

    /// Check `identity` against one limiter.
    ///
    /// Checking an unregistered name is a programming error and fails with
    /// [`TurnstileError::LimiterNotFound`]; a denial is an `Ok` result.
    pub fn check(&self, name: &str, identity: &str) -> Result<RateLimitResult> {
        self.limiter(name)?.check(identity)
    }

    /// Like [`check`](Self::check), but a denial becomes
    /// [`TurnstileError::RateLimited`] so it can be propagated with `?`.
    pub fn enforce(&self, name: &str, identity: &str) -> Result<RateLimitResult> {
        let result = self.check(name, identity)?;
        if result.allowed {
            Ok(result)
        } else {
            Err(TurnstileError::RateLimited {
                limiter: name.to_string(),
                retry_after: result.retry_after,
            })
        }
    }

    /// Check `identity` against every limiter in registration order.
    ///
    /// Stops at the first denial, so later limiters are not charged for a
    /// call that will not proceed; the denial is the last element. A limiter
    /// that fails is logged and skipped without affecting the others.
    pub fn check_all(&self, identity: &str) -> Vec<RateLimitResult> {
        let limiters = self.snapshot();
        let mut results = Vec::with_capacity(limiters.len());

        for (name, limiter) in limiters {
            match limiter.check(identity) {
                Ok(result) => {
                    let denied = !result.allowed;
                    results.push(result);
                    if denied {
                        debug!(limiter = %name, identity = %identity, "check_all stopped at denial");
                        break;
                    }
                }
                Err(e) => {
                    error!(
                        limiter = %name,
                        identity = %identity,
                        error = %e,
                        "Rate limiter failed during check_all"
                    );
                }
            }
        }

        results
    }

    /// Keep checking until admitted, sleeping for each denial's
    /// `retry_after`, for at most `max_wait` in total.
    pub async fn acquire(
        &self,
        name: &str,
        identity: &str,
        max_wait: Duration,
    ) -> Result<RateLimitResult> {
        let limiter = self.limiter(name)?;
        let mut waited = Duration::ZERO;

        loop {
            let result = limiter.check(identity)?;
            if result.allowed {
                return Ok(result);
            }

            let wait = result
                .retry_after_duration()
                .unwrap_or(Duration::from_secs(1));
            if waited + wait > max_wait {
                return Err(TurnstileError::RateLimited {
                    limiter: name.to_string(),
                    retry_after: result.retry_after,
                });
            }

            debug!(limiter = %name, identity = %identity, wait = ?wait, "Waiting out rate limit");
            tokio::time::sleep(wait).await;
            waited += wait;
        }
    }

    /// Forget `identity` in one limiter.
    pub fn reset(&self, name: &str, identity: &str) -> Result<()> {
        self.limiter(name)?.reset(identity);
        Ok(())
    }

    /// Where `identity` stands in one limiter, or `None` if it has no entry.
    pub fn get_status(&self, name: &str, identity: &str) -> Result<Option<RateLimitResult>> {
        self.limiter(name)?.get_status(identity)
    }

    /// Where `identity` stands in every limiter.
    ///
    /// Every registered name appears in the map; limiters without an entry
    /// for the identity, or that fail to report, map to `None`.
    pub fn get_status_all(&self, identity: &str) -> HashMap<String, Option<RateLimitResult>> {
        self.snapshot()
            .into_iter()
            .map(|(name, limiter)| {
                let status = limiter.get_status(identity).unwrap_or_else(|e| {
                    error!(limiter = %name, identity = %identity, error = %e, "Failed to read rate limit status");
                    None
                });
                (name, status)
            })
            .collect()
    }

    /// Report the outcome of an operation admitted by `name`; see
    /// [`Limiter::record_outcome`].
    pub fn record_outcome(&self, name: &str, identity: &str, succeeded: bool) -> Result<bool> {
        Ok(self.limiter(name)?.record_outcome(identity, succeeded))
    }

    /// Register the built-in policy catalog.
    ///
    /// Only the first call registers anything; later calls log a warning and
    /// return `false`.
    pub fn initialize_defaults(&self) -> Result<bool> {
        self.initialize_with(&PolicyCatalog::defaults())
    }

    /// Register `catalog`, once per manager.
    pub fn initialize_with(&self, catalog: &PolicyCatalog) -> Result<bool> {
        if self.defaults_initialized.swap(true, Ordering::SeqCst) {
            warn!("Rate limit policies already initialized; ignoring");
            return Ok(false);
        }

        for (name, config) in catalog.iter() {
            if let Err(e) = self.add_limiter(name, config.clone()) {
                self.defaults_initialized.store(false, Ordering::SeqCst);
                return Err(e);
            }
        }

        info!(policies = catalog.len(), "Rate limit policies initialized");
        Ok(true)
    }

    /// Destroy every limiter and empty the registry.
    pub fn destroy(&self) {
        let drained: Vec<_> = self.limiters.write().drain(..).collect();
        let count = drained.len();
        for (_, limiter) in drained {
            limiter.destroy();
        }
        self.defaults_initialized.store(false, Ordering::SeqCst);
        info!(limiters = count, "Rate limiter manager destroyed");
    }

    /// Clone the registry so limiters are checked without holding its lock.
    fn snapshot(&self) -> Vec<(String, Arc<Limiter>)> {
        self.limiters.read().clone()
    }
}

impl Default for LimiterManager {
    fn default() -> Self {
        Self::new()
    }
}
