//! Configuration management for Turnstile.

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};
use crate::ratelimit::{PolicyCatalog, RateLimitRule};

/// Prefix of environment variables that override file settings, e.g.
/// `TURNSTILE__LIMITER__SWEEP_INTERVAL_SECS=5`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Log output settings
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Limiter housekeeping
    #[serde(default)]
    pub limiter: LimiterSettings,

    /// Overrides and additions to the preset policies, keyed by limiter name
    #[serde(default)]
    pub policies: HashMap<String, RateLimitRule>,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Limiter housekeeping configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Seconds between sweeps of idle entries
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

impl TurnstileConfig {
    /// Load configuration from an optional YAML file, then apply
    /// `TURNSTILE__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::load_with_prefix(path, ENV_PREFIX)
    }

    fn load_with_prefix(path: Option<&Path>, env_prefix: &str) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading config file");
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix(env_prefix)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let config: TurnstileConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file only.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: TurnstileConfig = serde_yaml::from_str(&contents)
            .map_err(|e| TurnstileError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.limiter.sweep_interval_secs == 0 {
            return Err(TurnstileError::Config(
                "limiter.sweep_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.limiter.sweep_interval_secs)
    }

    /// The preset catalog with this configuration's overrides applied.
    pub fn catalog(&self) -> Result<PolicyCatalog> {
        PolicyCatalog::defaults().with_overrides(&self.policies)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{policies, Algorithm};
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("turnstile-{}-{}.yaml", name, std::process::id()));
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_defaults() {
        let config = TurnstileConfig::default();
        assert_eq!(config.logging.level, "info");
        assert!(!config.logging.json);
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
        assert!(config.policies.is_empty());
        assert_eq!(config.catalog().unwrap().len(), 7);
    }

    #[test]
    fn test_from_file() {
        let path = write_temp(
            "from-file",
            r#"
logging:
  level: debug
limiter:
  sweep_interval_secs: 30
policies:
  data_export:
    window_ms: 3600000
    max_requests: 10
    algorithm: fixed_window
"#,
        );
        let config = TurnstileConfig::from_file(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.sweep_interval(), Duration::from_secs(30));

        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.len(), 7);
        assert_eq!(catalog.get(policies::DATA_EXPORT).unwrap().max_requests, 10);
    }

    #[test]
    fn test_load_layers_env_over_file() {
        let path = write_temp(
            "layered",
            r#"
logging:
  json: true
limiter:
  sweep_interval_secs: 30
"#,
        );
        std::env::set_var("TURNSTILE_LAYER_TEST__LIMITER__SWEEP_INTERVAL_SECS", "5");
        let config = TurnstileConfig::load_with_prefix(Some(&path), "TURNSTILE_LAYER_TEST").unwrap();
        std::env::remove_var("TURNSTILE_LAYER_TEST__LIMITER__SWEEP_INTERVAL_SECS");
        std::fs::remove_file(&path).ok();

        assert!(config.logging.json);
        assert_eq!(config.sweep_interval(), Duration::from_secs(5));
    }

    #[test]
    fn test_load_without_file_uses_defaults() {
        let config = TurnstileConfig::load_with_prefix(None, "TURNSTILE_EMPTY_TEST").unwrap();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.limiter.sweep_interval_secs, 60);
    }

    #[test]
    fn test_load_missing_file_fails() {
        let missing = std::env::temp_dir().join("turnstile-does-not-exist.yaml");
        let err = TurnstileConfig::load_with_prefix(Some(&missing), "TURNSTILE_MISSING_TEST");
        assert!(matches!(err, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_zero_sweep_interval_is_rejected() {
        let path = write_temp("zero-sweep", "limiter:\n  sweep_interval_secs: 0\n");
        let result = TurnstileConfig::from_file(&path);
        std::fs::remove_file(&path).ok();
        assert!(matches!(result, Err(TurnstileError::Config(_))));
    }

    #[test]
    fn test_unknown_algorithm_in_policies() {
        let mut config = TurnstileConfig::default();
        config.policies.insert(
            "bulk_sms".to_string(),
            RateLimitRule {
                window_ms: 60_000,
                max_requests: 5,
                algorithm: "adaptive".to_string(),
                skip_successful_requests: false,
                skip_failed_requests: false,
                key_prefix: None,
            },
        );
        assert!(matches!(config.catalog(), Err(TurnstileError::UnknownAlgorithm(_))));

        config.policies.get_mut("bulk_sms").unwrap().algorithm = "leaky_bucket".to_string();
        let catalog = config.catalog().unwrap();
        assert_eq!(catalog.get("bulk_sms").unwrap().algorithm, Algorithm::LeakyBucket);
    }
}
