use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Yaml};
use thiserror::Error;

use crate::domain::models::{Config, ProviderConfig};
use crate::services::AlertEngine;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid log level: {0}. Must be one of: trace, debug, info, warn, error")]
    InvalidLogLevel(String),

    #[error("Invalid log format: {0}. Must be one of: json, pretty")]
    InvalidLogFormat(String),

    #[error("Invalid log rotation: {0}. Must be one of: daily, hourly, never")]
    InvalidLogRotation(String),

    #[error(
        "Invalid backoff configuration: initial_backoff_ms ({0}) must be positive and not exceed max_backoff_ms ({1})"
    )]
    InvalidBackoff(u64, u64),

    #[error("Invalid dedup ttl_ms: {0}. Must be positive")]
    InvalidDedupTtl(u64),

    #[error("Invalid {0}: must be at least 1")]
    ZeroValue(&'static str),

    #[error("Invalid alert thresholds: {0}")]
    InvalidThresholds(String),

    #[error("Invalid provider '{0}': {1}")]
    InvalidProvider(String, String),

    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),
}

/// Configuration loader with hierarchical merging
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration with hierarchical merging
    ///
    /// Precedence (lowest to highest):
    /// 1. Programmatic defaults (Serialized)
    /// 2. .agent-dispatch/config.yaml
    /// 3. .agent-dispatch/local.yaml (optional local overrides)
    /// 4. Environment variables (AGENT_DISPATCH_* prefix, `__` for nesting)
    pub fn load() -> Result<Config> {
        let config: Config = Self::figment()
            .extract()
            .context("Failed to extract configuration from figment")?;

        Self::validate(&config)?;
        Ok(config)
    }

    /// Load configuration from a specific file. Environment overrides still apply.
    pub fn load_from_file(path: impl AsRef<std::path::Path>) -> Result<Config> {
        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(path.as_ref()))
            .merge(Env::prefixed("AGENT_DISPATCH_").split("__"))
            .extract()
            .context(format!(
                "Failed to load config from {}",
                path.as_ref().display()
            ))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(".agent-dispatch/config.yaml"))
            .merge(Yaml::file(".agent-dispatch/local.yaml"))
            .merge(Env::prefixed("AGENT_DISPATCH_").split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(config: &Config) -> Result<(), ConfigError> {
        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&config.logging.level.to_lowercase().as_str()) {
            return Err(ConfigError::InvalidLogLevel(config.logging.level.clone()));
        }

        let valid_log_formats = ["json", "pretty"];
        if !valid_log_formats.contains(&config.logging.format.as_str()) {
            return Err(ConfigError::InvalidLogFormat(config.logging.format.clone()));
        }

        let valid_rotations = ["daily", "hourly", "never"];
        if !valid_rotations.contains(&config.logging.rotation.as_str()) {
            return Err(ConfigError::InvalidLogRotation(
                config.logging.rotation.clone(),
            ));
        }

        if config.retry.initial_backoff_ms == 0
            || config.retry.initial_backoff_ms > config.retry.max_backoff_ms
        {
            return Err(ConfigError::InvalidBackoff(
                config.retry.initial_backoff_ms,
                config.retry.max_backoff_ms,
            ));
        }

        if config.dedup.ttl_ms == 0 {
            return Err(ConfigError::InvalidDedupTtl(config.dedup.ttl_ms));
        }

        if config.executor.queue_capacity == 0 {
            return Err(ConfigError::ZeroValue("executor.queue_capacity"));
        }
        if config.executor.max_consecutive_ledger_failures == 0 {
            return Err(ConfigError::ZeroValue(
                "executor.max_consecutive_ledger_failures",
            ));
        }
        if config.metrics.collection_interval_ms == 0 {
            return Err(ConfigError::ZeroValue("metrics.collection_interval_ms"));
        }
        if config.metrics.history_limit == 0 {
            return Err(ConfigError::ZeroValue("metrics.history_limit"));
        }
        if config.broadcaster.observer_buffer_capacity == 0 {
            return Err(ConfigError::ZeroValue("broadcaster.observer_buffer_capacity"));
        }
        if config.broadcaster.event_bus_capacity == 0 {
            return Err(ConfigError::ZeroValue("broadcaster.event_bus_capacity"));
        }

        AlertEngine::validate_thresholds(&config.alerts)
            .map_err(|e| ConfigError::InvalidThresholds(e.to_string()))?;

        for (name, provider) in &config.providers {
            if name.is_empty() {
                return Err(ConfigError::ValidationFailed(
                    "provider name cannot be empty".to_string(),
                ));
            }
            if let ProviderConfig::Openai {
                base_url, model, ..
            } = provider
            {
                if base_url.is_empty() {
                    return Err(ConfigError::InvalidProvider(
                        name.clone(),
                        "base_url cannot be empty".to_string(),
                    ));
                }
                if model.is_empty() {
                    return Err(ConfigError::InvalidProvider(
                        name.clone(),
                        "model cannot be empty".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.retry.max_retries, 3);
        ConfigLoader::validate(&config).expect("Default config should be valid");
    }

    #[test]
    fn test_yaml_parsing() {
        let yaml = r"
logging:
  level: debug
  format: pretty
retry:
  max_retries: 5
  initial_backoff_ms: 100
  max_backoff_ms: 1000
metrics:
  collection_interval_ms: 5000
alerts:
  warning_success_rate: 0.9
  critical_success_rate: 0.6
server:
  port: 8088
";

        let config: Config = serde_yaml::from_str(yaml).expect("YAML should parse");

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, "pretty");
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.metrics.collection_interval_ms, 5000);
        assert!((config.alerts.warning_success_rate - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.server.port, 8088);
        assert_eq!(config.dedup.ttl_ms, 600_000, "unset sections keep defaults");

        ConfigLoader::validate(&config).expect("Parsed config should be valid");
    }

    #[test]
    fn test_validate_invalid_log_level() {
        let mut config = Config::default();
        config.logging.level = "invalid".to_string();

        match ConfigLoader::validate(&config).unwrap_err() {
            ConfigError::InvalidLogLevel(level) => assert_eq!(level, "invalid"),
            other => panic!("Expected InvalidLogLevel error, got {other:?}"),
        }
    }

    #[test]
    fn test_validate_invalid_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_string();

        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::InvalidLogFormat(f) if f == "xml"
        ));
    }

    #[test]
    fn test_validate_invalid_backoff() {
        let mut config = Config::default();
        config.retry.initial_backoff_ms = 30_000;
        config.retry.max_backoff_ms = 10_000;

        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::InvalidBackoff(30_000, 10_000)
        ));
    }

    #[test]
    fn test_validate_zero_values() {
        let mut config = Config::default();
        config.executor.queue_capacity = 0;
        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::ZeroValue("executor.queue_capacity")
        ));

        let mut config = Config::default();
        config.metrics.collection_interval_ms = 0;
        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::ZeroValue("metrics.collection_interval_ms")
        ));

        let mut config = Config::default();
        config.dedup.ttl_ms = 0;
        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::InvalidDedupTtl(0)
        ));
    }

    #[test]
    fn test_validate_thresholds() {
        let mut config = Config::default();
        config.alerts.critical_success_rate = 0.95;

        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::InvalidThresholds(_)
        ));
    }

    #[test]
    fn test_validate_openai_provider() {
        let yaml = r"
providers:
  remote:
    kind: openai
    model: ''
";
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(matches!(
            ConfigLoader::validate(&config).unwrap_err(),
            ConfigError::InvalidProvider(name, _) if name == "remote"
        ));
    }

    #[test]
    fn test_hierarchical_merging() {
        use std::io::Write;
        use tempfile::NamedTempFile;

        let mut base_file = NamedTempFile::new().unwrap();
        writeln!(
            base_file,
            "logging:\n  level: info\n  format: json\nserver:\n  port: 9000"
        )
        .unwrap();
        base_file.flush().unwrap();

        let mut override_file = NamedTempFile::new().unwrap();
        writeln!(override_file, "logging:\n  level: debug\nserver:\n  port: 9100").unwrap();
        override_file.flush().unwrap();

        let config: Config = Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Yaml::file(base_file.path()))
            .merge(Yaml::file(override_file.path()))
            .extract()
            .unwrap();

        assert_eq!(config.server.port, 9100, "Override should win");
        assert_eq!(
            config.logging.level, "debug",
            "Override should win for nested fields"
        );
        assert_eq!(
            config.logging.format, "json",
            "Base value should persist when not overridden"
        );
    }
}
