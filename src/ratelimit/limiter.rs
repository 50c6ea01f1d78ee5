//! A single named limiter: one policy, one key space.

use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, trace, warn};

use super::algorithm;
use super::entry::{EntryState, RateLimitResult};
use super::rules::RateLimitConfig;
use crate::clock::{Clock, SystemClock};
use crate::error::Result;

/// How often idle entries are evicted unless configured otherwise.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// Enforces one [`RateLimitConfig`] over its own independent set of keys.
///
/// The entry map is guarded by a mutex shared with the background sweep, so a
/// limiter can be used from many tasks at once and checks for the same key
/// are serialized.
pub struct Limiter {
    name: String,
    config: RateLimitConfig,
    shared: Arc<Shared>,
    sweeper: Mutex<Option<Sweeper>>,
}

/// State the background sweep needs; held weakly by the sweep task.
struct Shared {
    name: String,
    window_ms: u64,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, EntryState>>,
}

struct Sweeper {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl Shared {
    /// Evict every entry idle for more than twice the window.
    fn sweep(&self) -> Result<usize> {
        let now = self.clock.now_ms()?;
        let max_idle = self.window_ms.saturating_mul(2);

        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.saturating_sub(entry.last_activity()) <= max_idle);
        let evicted = before - entries.len();

        if evicted > 0 {
            debug!(
                limiter = %self.name,
                evicted,
                remaining_entries = entries.len(),
                "Evicted idle rate limit entries"
            );
        }
        Ok(evicted)
    }
}

impl Limiter {
    /// Create a limiter on the system clock.
    ///
    /// Fails immediately if the configuration can never admit a request.
    pub fn new(name: impl Into<String>, config: RateLimitConfig) -> Result<Self> {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    /// Create a limiter driven by `clock`.
    pub fn with_clock(
        name: impl Into<String>,
        config: RateLimitConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        Self::with_options(name, config, clock, DEFAULT_SWEEP_INTERVAL)
    }

    /// Create a limiter with an explicit clock and sweep interval.
    ///
    /// The sweep runs on the current tokio runtime. Outside a runtime no
    /// background task is started and [`Limiter::sweep`] must be called
    /// explicitly.
    pub fn with_options(
        name: impl Into<String>,
        config: RateLimitConfig,
        clock: Arc<dyn Clock>,
        sweep_interval: Duration,
    ) -> Result<Self> {
        config.validate()?;
        let name = name.into();

        let shared = Arc::new(Shared {
            name: name.clone(),
            window_ms: config.window_ms,
            clock,
            entries: Mutex::new(HashMap::new()),
        });
        let sweeper = spawn_sweeper(&shared, sweep_interval);

        info!(
            limiter = %name,
            algorithm = %config.algorithm,
            max_requests = config.max_requests,
            window_ms = config.window_ms,
            background_sweep = sweeper.is_some(),
            "Rate limiter created"
        );

        Ok(Self {
            name,
            config,
            shared,
            sweeper: Mutex::new(sweeper),
        })
    }

    /// Name this limiter was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The policy this limiter enforces.
    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Decide whether `identity` may perform one more operation, and charge it
    /// if so.
    ///
    /// A denial is an `Ok` result with `allowed == false`. Errors are reserved
    /// for failures of the limiter itself.
    pub fn check(&self, identity: &str) -> Result<RateLimitResult> {
        let now = self.shared.clock.now_ms()?;
        let key = self.config.derive_key(identity);

        trace!(limiter = %self.name, key = %key, now, "Checking rate limit");

        let (result, created) = {
            let mut entries = self.shared.entries.lock();
            let previous = entries.remove(&key);
            let created = previous.is_none();
            let (entry, result) = algorithm::decide(previous, now, &self.config);
            entries.insert(key.clone(), entry);
            (result, created)
        };

        if created {
            debug!(limiter = %self.name, key = %key, "Created rate limit entry");
        }

        if !result.allowed {
            warn!(
                limiter = %self.name,
                key = %key,
                retry_after = ?result.retry_after,
                "Rate limit exceeded"
            );
            if let Some(ref callback) = self.config.on_limit_reached {
                // Callback panics are contained and logged.
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&key, &result)));
                if outcome.is_err() {
                    error!(limiter = %self.name, key = %key, "on_limit_reached callback panicked");
                }
            }
        }

        Ok(result)
    }

    /// Forget everything about `identity`, as if it had never made a request.
    pub fn reset(&self, identity: &str) {
        let key = self.config.derive_key(identity);
        if self.shared.entries.lock().remove(&key).is_some() {
            info!(limiter = %self.name, key = %key, "Rate limit entry reset");
        }
    }

    /// Where `identity` stands right now, without charging it.
    ///
    /// Returns `None` if the key has no entry.
    pub fn get_status(&self, identity: &str) -> Result<Option<RateLimitResult>> {
        let now = self.shared.clock.now_ms()?;
        let key = self.config.derive_key(identity);
        let entries = self.shared.entries.lock();
        Ok(entries
            .get(&key)
            .map(|entry| algorithm::status(entry, now, &self.config)))
    }

    /// Report how the operation admitted for `identity` turned out.
    ///
    /// If the policy skips that kind of outcome, the admission is refunded.
    /// Returns whether a refund happened.
    pub fn record_outcome(&self, identity: &str, succeeded: bool) -> bool {
        let skip = if succeeded {
            self.config.skip_successful_requests
        } else {
            self.config.skip_failed_requests
        };
        if !skip {
            return false;
        }

        let key = self.config.derive_key(identity);
        let mut entries = self.shared.entries.lock();
        match entries.get_mut(&key) {
            Some(entry) => {
                algorithm::refund(entry, &self.config);
                debug!(limiter = %self.name, key = %key, succeeded, "Refunded admission");
                true
            }
            None => false,
        }
    }

    /// Run one eviction pass now. Returns the number of entries evicted.
    pub fn sweep(&self) -> Result<usize> {
        self.shared.sweep()
    }

    /// Number of keys currently tracked.
    pub fn entry_count(&self) -> usize {
        self.shared.entries.lock().len()
    }

    /// Stop the background sweep and drop all entries.
    ///
    /// Safe to call any number of times.
    pub fn destroy(&self) {
        let stopped = self.stop_sweeper();
        let cleared = {
            let mut entries = self.shared.entries.lock();
            let cleared = entries.len();
            entries.clear();
            cleared
        };
        if stopped || cleared > 0 {
            info!(limiter = %self.name, cleared, "Rate limiter destroyed");
        }
    }

    fn stop_sweeper(&self) -> bool {
        match self.sweeper.lock().take() {
            Some(sweeper) => {
                // The task may already have exited; either way it is done.
                let _ = sweeper.shutdown.send(());
                drop(sweeper.handle);
                true
            }
            None => false,
        }
    }
}

impl Drop for Limiter {
    fn drop(&mut self) {
        self.stop_sweeper();
    }
}

impl fmt::Debug for Limiter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Limiter")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("entries", &self.entry_count())
            .finish()
    }
}

/// Start the periodic sweep on the ambient runtime, if there is one.
fn spawn_sweeper(shared: &Arc<Shared>, every: Duration) -> Option<Sweeper> {
    if every.is_zero() {
        debug!(limiter = %shared.name, "Sweep interval is zero; background sweep disabled");
        return None;
    }
    let runtime = match tokio::runtime::Handle::try_current() {
        Ok(runtime) => runtime,
        Err(_) => {
            debug!(limiter = %shared.name, "No async runtime; background sweep disabled");
            return None;
        }
    };

    let (shutdown, mut stop) = oneshot::channel();
    let weak: Weak<Shared> = Arc::downgrade(shared);

    let handle = runtime.spawn(async move {
        let mut ticker = interval_at(Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    let Some(shared) = weak.upgrade() else { break };
                    if let Err(e) = shared.sweep() {
                        warn!(limiter = %shared.name, error = %e, "Rate limit sweep failed");
                    }
                }
            }
        }
    });

    Some(Sweeper { shutdown, handle })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::error::TurnstileError;
    use crate::ratelimit::key::KeyGenerator;
    use crate::ratelimit::rules::Algorithm;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn limiter(algorithm: Algorithm, max: u64, window_ms: u64) -> (Limiter, ManualClock) {
        let clock = ManualClock::new(1_000_000);
        let config = RateLimitConfig::new(algorithm, max, window_ms);
        let limiter = Limiter::with_clock("test", config, Arc::new(clock.clone())).unwrap();
        (limiter, clock)
    }

    #[test]
    fn test_invalid_config_fails_at_construction() {
        let config = RateLimitConfig::new(Algorithm::FixedWindow, 0, 1_000);
        let result = Limiter::new("broken", config);
        assert!(matches!(result, Err(TurnstileError::InvalidConfig(_))));
    }

    #[test]
    fn test_check_creates_entry() {
        let (limiter, _) = limiter(Algorithm::FixedWindow, 3, 1_000);
        assert_eq!(limiter.entry_count(), 0);

        let result = limiter.check("u1").unwrap();
        assert!(result.allowed);
        assert_eq!(result.remaining, 2);
        assert_eq!(limiter.entry_count(), 1);
    }

    #[test]
    fn test_identities_are_independent() {
        let (limiter, _) = limiter(Algorithm::SlidingWindow, 1, 1_000);

        assert!(limiter.check("a").unwrap().allowed);
        assert!(!limiter.check("a").unwrap().allowed);
        assert!(limiter.check("b").unwrap().allowed);
    }

    #[test]
    fn test_get_status_is_read_only() {
        let (limiter, _) = limiter(Algorithm::FixedWindow, 3, 1_000);
        assert_eq!(limiter.get_status("u1").unwrap(), None);

        limiter.check("u1").unwrap();
        for _ in 0..3 {
            let status = limiter.get_status("u1").unwrap().unwrap();
            assert_eq!(status.remaining, 2);
        }
        assert_eq!(limiter.check("u1").unwrap().remaining, 1);
    }

    #[test]
    fn test_reset_restores_full_quota() {
        for algorithm in Algorithm::ALL {
            let (limiter, _) = limiter(algorithm, 2, 60_000);
            limiter.check("u1").unwrap();
            limiter.check("u1").unwrap();
            assert!(!limiter.check("u1").unwrap().allowed, "{algorithm}");

            limiter.reset("u1");
            assert_eq!(limiter.get_status("u1").unwrap(), None);

            let result = limiter.check("u1").unwrap();
            assert!(result.allowed, "{algorithm}");
            assert_eq!(result.remaining, 1, "{algorithm}");
        }
    }

    #[test]
    fn test_reset_unknown_identity_is_noop() {
        let (limiter, _) = limiter(Algorithm::TokenBucket, 2, 1_000);
        limiter.check("other").unwrap();

        limiter.reset("never-seen");
        limiter.reset("never-seen");
        assert_eq!(limiter.entry_count(), 1);
    }

    #[test]
    fn test_key_generator_shares_quota_across_identities() {
        let clock = ManualClock::new(0);
        let config = RateLimitConfig::new(Algorithm::FixedWindow, 2, 60_000)
            .key_generator(KeyGenerator::normalized());
        let limiter = Limiter::with_clock("login", config, Arc::new(clock)).unwrap();

        limiter.check("Desk@Spa.io").unwrap();
        limiter.check(" desk@spa.io").unwrap();
        assert!(!limiter.check("DESK@SPA.IO").unwrap().allowed);
        assert_eq!(limiter.entry_count(), 1);

        limiter.reset("desk@spa.io ");
        assert_eq!(limiter.entry_count(), 0);
    }

    #[test]
    fn test_on_limit_reached_called_once_per_denial() {
        let clock = ManualClock::new(0);
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let config = RateLimitConfig::new(Algorithm::LeakyBucket, 1, 1_000).on_limit_reached(
            move |key, result| {
                assert_eq!(key, "u1");
                assert!(!result.allowed);
                seen.fetch_add(1, Ordering::SeqCst);
            },
        );
        let limiter = Limiter::with_clock("cb", config, Arc::new(clock)).unwrap();

        limiter.check("u1").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        limiter.check("u1").unwrap();
        limiter.check("u1").unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_callback_still_returns_denial() {
        let clock = ManualClock::new(0);
        let config = RateLimitConfig::new(Algorithm::FixedWindow, 1, 1_000)
            .on_limit_reached(|_, _| panic!("alerting backend unavailable"));
        let limiter = Limiter::with_clock("cb", config, Arc::new(clock)).unwrap();

        assert!(limiter.check("u1").unwrap().allowed);
        let denied = limiter.check("u1").unwrap();
        assert!(!denied.allowed);
        assert_eq!(denied.retry_after, Some(1));

        // The entry map is still usable afterwards.
        assert!(!limiter.check("u1").unwrap().allowed);
        assert!(limiter.check("u2").unwrap().allowed);
    }

    #[test]
    fn test_huge_window_does_not_overflow() {
        for algorithm in Algorithm::ALL {
            let (limiter, _) = limiter(algorithm, 5, u64::MAX);
            let result = limiter.check("u1").unwrap();
            assert!(result.allowed, "{algorithm}");
            assert_eq!(result.remaining, 4);
            assert!(limiter.get_status("u1").unwrap().is_some());
        }
    }

    #[test]
    fn test_record_outcome_refunds_only_skipped_outcomes() {
        let clock = ManualClock::new(0);
        let config = RateLimitConfig::new(Algorithm::FixedWindow, 2, 60_000)
            .skip_successful_requests(true);
        let limiter = Limiter::with_clock("login", config, Arc::new(clock)).unwrap();

        limiter.check("u1").unwrap();
        assert!(limiter.record_outcome("u1", true));
        assert_eq!(limiter.get_status("u1").unwrap().unwrap().remaining, 2);

        limiter.check("u1").unwrap();
        assert!(!limiter.record_outcome("u1", false));
        assert_eq!(limiter.get_status("u1").unwrap().unwrap().remaining, 1);

        assert!(!limiter.record_outcome("unknown", true));
    }

    #[test]
    fn test_sweep_evicts_entries_idle_beyond_twice_the_window() {
        let (limiter, clock) = limiter(Algorithm::FixedWindow, 5, 1_000);
        limiter.check("idle").unwrap();
        clock.advance(1_500);
        limiter.check("active").unwrap();

        clock.advance(500);
        // "idle" is exactly 2x window old: kept.
        assert_eq!(limiter.sweep().unwrap(), 0);

        clock.advance(1);
        assert_eq!(limiter.sweep().unwrap(), 1);
        assert_eq!(limiter.get_status("idle").unwrap(), None);
        assert!(limiter.get_status("active").unwrap().is_some());
    }

    #[test]
    fn test_sweep_uses_last_refill_for_token_bucket() {
        let (limiter, clock) = limiter(Algorithm::TokenBucket, 2, 1_000);
        limiter.check("u1").unwrap();
        clock.advance(2_001);
        assert_eq!(limiter.sweep().unwrap(), 1);
    }

    #[test]
    fn test_destroy_is_idempotent() {
        let (limiter, _) = limiter(Algorithm::SlidingWindow, 5, 1_000);
        limiter.check("u1").unwrap();
        limiter.check("u2").unwrap();

        limiter.destroy();
        assert_eq!(limiter.entry_count(), 0);
        limiter.destroy();
        assert_eq!(limiter.entry_count(), 0);
    }

    #[test]
    fn test_no_sweeper_without_runtime() {
        let (limiter, _) = limiter(Algorithm::FixedWindow, 1, 1_000);
        assert!(limiter.sweeper.lock().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweep_evicts_idle_entries() {
        let clock = ManualClock::new(0);
        let config = RateLimitConfig::new(Algorithm::FixedWindow, 3, 1_000);
        let limiter = Limiter::with_clock("bg", config, Arc::new(clock.clone())).unwrap();

        limiter.check("u1").unwrap();
        clock.advance(2_001);
        assert!(limiter.get_status("u1").unwrap().is_some());

        tokio::time::sleep(DEFAULT_SWEEP_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(limiter.get_status("u1").unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_stops_background_sweep() {
        let clock = ManualClock::new(0);
        let config = RateLimitConfig::new(Algorithm::FixedWindow, 3, 1_000);
        let limiter = Limiter::with_clock("bg", config, Arc::new(clock.clone())).unwrap();
        assert!(limiter.sweeper.lock().is_some());

        limiter.destroy();
        assert!(limiter.sweeper.lock().is_none());

        // Entries created after destroy are no longer swept.
        limiter.check("u1").unwrap();
        clock.advance(10_000);
        tokio::time::sleep(DEFAULT_SWEEP_INTERVAL * 2).await;
        assert_eq!(limiter.entry_count(), 1);
    }
}
