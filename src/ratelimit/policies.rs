//! Built-in rate limit policies for the dashboard's operations.
//!
//! The numbers are policy, not mechanism: they can be tuned through
//! configuration (see [`PolicyCatalog::with_overrides`]) without touching the
//! algorithms.

use std::collections::HashMap;
use std::path::Path;

use tracing::info;

use super::key::KeyGenerator;
use super::rules::{Algorithm, RateLimitConfig, RateLimitRule};
use crate::error::{Result, TurnstileError};

/// Sign-in attempts per account.
pub const LOGIN: &str = "login";
/// Session token refreshes per device.
pub const TOKEN_REFRESH: &str = "token_refresh";
/// Any backend call.
pub const API_GENERAL: &str = "api_general";
/// Calls touching billing, staff records or permissions.
pub const API_SENSITIVE: &str = "api_sensitive";
/// Creating sessions, clients, invoices and other records.
pub const RECORD_CREATE: &str = "record_create";
/// Report and data exports.
pub const DATA_EXPORT: &str = "data_export";
/// Realtime subscription / connection attempts.
pub const SUBSCRIPTION: &str = "subscription";

const SECOND: u64 = 1_000;
const MINUTE: u64 = 60 * SECOND;
const HOUR: u64 = 60 * MINUTE;

/// An ordered set of named policies, ready to be registered into a
/// [`LimiterManager`](super::LimiterManager).
#[derive(Debug, Clone, Default)]
pub struct PolicyCatalog {
    policies: Vec<(String, RateLimitConfig)>,
}

impl PolicyCatalog {
    /// A catalog with no policies.
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in presets, in the order they are evaluated by `check_all`.
    pub fn defaults() -> Self {
        let mut catalog = Self::new();
        catalog.insert(
            LOGIN,
            RateLimitConfig::new(Algorithm::FixedWindow, 5, 15 * MINUTE)
                .key_generator(KeyGenerator::normalized()),
        );
        catalog.insert(
            TOKEN_REFRESH,
            RateLimitConfig::new(Algorithm::SlidingWindow, 10, MINUTE),
        );
        catalog.insert(
            API_GENERAL,
            RateLimitConfig::new(Algorithm::TokenBucket, 100, MINUTE),
        );
        catalog.insert(
            API_SENSITIVE,
            RateLimitConfig::new(Algorithm::SlidingWindow, 20, MINUTE),
        );
        catalog.insert(
            RECORD_CREATE,
            RateLimitConfig::new(Algorithm::TokenBucket, 30, MINUTE),
        );
        catalog.insert(
            DATA_EXPORT,
            RateLimitConfig::new(Algorithm::FixedWindow, 3, HOUR),
        );
        catalog.insert(
            SUBSCRIPTION,
            RateLimitConfig::new(Algorithm::SlidingWindow, 10, MINUTE),
        );
        catalog
    }

    /// Load overrides from a YAML file and apply them to the presets.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading rate limit policies");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse a YAML map of `name -> rule` and apply it to the presets.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let rules: HashMap<String, RateLimitRule> = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse rate limit policies: {}", e)))?;
        Self::defaults().with_overrides(&rules)
    }

    /// Replace or add policies from serialized rules.
    ///
    /// A rule for an existing name keeps that policy's key generator unless
    /// it sets its own `key_prefix`. New names are appended in name order.
    pub fn with_overrides(mut self, rules: &HashMap<String, RateLimitRule>) -> Result<Self> {
        let mut names: Vec<&String> = rules.keys().collect();
        names.sort();

        for name in names {
            let rule = &rules[name];
            let mut config = rule.into_config()?;
            if rule.key_prefix.is_none() {
                if let Some(existing) = self.get(name) {
                    config.key_generator = existing.key_generator.clone();
                }
            }
            self.insert(name, config);
        }
        Ok(self)
    }

    /// Add a policy, replacing any policy of the same name in place.
    pub fn insert(&mut self, name: &str, config: RateLimitConfig) {
        match self.policies.iter_mut().find(|(existing, _)| existing == name) {
            Some((_, slot)) => *slot = config,
            None => self.policies.push((name.to_string(), config)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&RateLimitConfig> {
        self.policies
            .iter()
            .find(|(existing, _)| existing == name)
            .map(|(_, config)| config)
    }

    pub fn names(&self) -> Vec<&str> {
        self.policies.iter().map(|(name, _)| name.as_str()).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &RateLimitConfig)> {
        self.policies
            .iter()
            .map(|(name, config)| (name.as_str(), config))
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    /// Serializable view of every policy, in order.
    pub fn rules(&self) -> Vec<(String, RateLimitRule)> {
        self.policies
            .iter()
            .map(|(name, config)| (name.clone(), RateLimitRule::from_config(config)))
            .collect()
    }
}
