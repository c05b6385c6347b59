//! Configuration management for Floodgate.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::backpressure::BackpressureConfig;
use crate::error::{FloodgateError, Result};
use crate::ratelimit::{RateLimitConfig, RateLimitOverrides, RateLimitTier};

/// Prefix for environment variable overrides, e.g. `FLOODGATE__BACKPRESSURE__MAX_CONCURRENT`.
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Main configuration for the admission layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FloodgateConfig {
    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Concurrency limiting configuration
    #[serde(default)]
    pub backpressure: BackpressureConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// How often idle keys are swept, in milliseconds
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    /// Independent key spaces, each with its own limiter (e.g. "ip", "user")
    #[serde(default = "default_key_spaces")]
    pub key_spaces: BTreeMap<String, KeySpaceConfig>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            cleanup_interval_ms: default_cleanup_interval_ms(),
            key_spaces: default_key_spaces(),
        }
    }
}

impl RateLimitingConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

fn default_key_spaces() -> BTreeMap<String, KeySpaceConfig> {
    let mut spaces = BTreeMap::new();
    spaces.insert("ip".to_string(), KeySpaceConfig::default());
    spaces
}

/// Limits for one key space: a tier plus optional overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySpaceConfig {
    /// Preset to start from; `standard` when omitted
    #[serde(default)]
    pub tier: Option<RateLimitTier>,
    #[serde(default)]
    pub max_requests: Option<u32>,
    #[serde(default)]
    pub window_ms: Option<u64>,
    #[serde(default)]
    pub key_prefix: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl KeySpaceConfig {
    /// Resolve the tier and overrides into a concrete limiter configuration.
    pub fn resolve(&self) -> RateLimitConfig {
        let overrides = RateLimitOverrides {
            max_requests: self.max_requests,
            window_ms: self.window_ms,
            key_prefix: self.key_prefix.clone(),
            message: self.message.clone(),
        };
        RateLimitConfig::from_tier(self.tier.unwrap_or(RateLimitTier::Standard))
            .with_overrides(&overrides)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default level filter when `RUST_LOG` is not set
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

impl FloodgateConfig {
    /// Load configuration from an optional file layered with environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = ::config::Config::builder();

        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(::config::File::from(path));
        }

        builder = builder.add_source(
            ::config::Environment::with_prefix(ENV_PREFIX)
                .separator("__")
                .try_parsing(true),
        );

        let config: FloodgateConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file path, with environment overrides applied.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::load(Some(path.as_ref()))
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: FloodgateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| FloodgateError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every limit for configuration errors.
    pub fn validate(&self) -> Result<()> {
        self.backpressure.validate()?;

        if self.rate_limiting.cleanup_interval_ms == 0 {
            return Err(FloodgateError::Config(
                "rate_limiting.cleanup_interval_ms must be greater than zero".to_string(),
            ));
        }

        for (name, space) in &self.rate_limiting.key_spaces {
            space
                .resolve()
                .validate()
                .map_err(|e| FloodgateError::Config(format!("key space '{}': {}", name, e)))?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backpressure::BackpressureError;

    #[test]
    fn test_defaults() {
        let config = FloodgateConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backpressure.max_concurrent, 100);
        assert_eq!(config.backpressure.queue_timeout(), Duration::from_secs(30));
        assert!(config.backpressure.enabled);
        assert_eq!(config.rate_limiting.cleanup_interval(), Duration::from_secs(60));
        assert_eq!(
            config.rate_limiting.key_spaces["ip"].resolve(),
            RateLimitTier::Standard.config()
        );
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
backpressure:
  max_concurrent: 8
  max_queue_size: 16
  queue_timeout_ms: 250
rate_limiting:
  key_spaces:
    ip:
      tier: relaxed
    user:
      tier: strict
      max_requests: 5
      message: "slow down"
logging:
  json: true
"#;
        let config = FloodgateConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.backpressure.max_concurrent, 8);
        assert_eq!(config.backpressure.max_queue_size, 16);
        assert_eq!(config.backpressure.queue_timeout(), Duration::from_millis(250));
        assert!(config.backpressure.enabled);

        let user = config.rate_limiting.key_spaces["user"].resolve();
        assert_eq!(user.max_requests, 5);
        assert_eq!(user.window_ms, 60_000);
        assert_eq!(user.message, "slow down");

        let ip = config.rate_limiting.key_spaces["ip"].resolve();
        assert_eq!(ip.max_requests, 1000);

        assert!(config.logging.json);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_invalid_limits_rejected() {
        let yaml = r#"
rate_limiting:
  key_spaces:
    ip:
      max_requests: 0
"#;
        let err = FloodgateConfig::from_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("key space 'ip'"));

        let yaml = r#"
backpressure:
  max_concurrent: 0
"#;
        assert!(matches!(
            FloodgateConfig::from_yaml(yaml),
            Err(FloodgateError::Backpressure(BackpressureError::InvalidMaxConcurrent))
        ));
    }

    #[test]
    fn test_environment_overrides() {
        std::env::set_var("FLOODGATE__BACKPRESSURE__QUEUE_TIMEOUT_MS", "1234");
        let config = FloodgateConfig::load(None).unwrap();
        std::env::remove_var("FLOODGATE__BACKPRESSURE__QUEUE_TIMEOUT_MS");

        assert_eq!(config.backpressure.queue_timeout_ms, 1234);
        assert_eq!(config.backpressure.max_concurrent, 100);
    }
}
