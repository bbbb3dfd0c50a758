//! Configuration loading and environment variable handling

use crate::domains::logging::{LogFormat, LogLevel, LoggingConfig};
use crate::domains::retry::RetryConfig;
use crate::domains::TxRetryConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "TXRETRY".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<TxRetryConfig> {
        let content = std::fs::read_to_string(path)?;
        self.from_yaml(&content)
    }

    /// Load configuration from YAML text with environment overrides
    pub fn from_yaml(&self, content: &str) -> ConfigResult<TxRetryConfig> {
        let mut config: TxRetryConfig = serde_yaml::from_str(content)?;
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<TxRetryConfig> {
        let mut config = TxRetryConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<TxRetryConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut TxRetryConfig) -> ConfigResult<()> {
        self.apply_retry_overrides(&mut config.retry)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply retry config overrides
    fn apply_retry_overrides(&self, config: &mut RetryConfig) -> ConfigResult<()> {
        if let Ok(retry_on) = self.get_env_var("RETRY_ON") {
            config.retry_on = split_list(&retry_on).map(str::to_string).collect();
        }

        if let Ok(max_retries) = self.get_env_var("MAX_RETRIES") {
            config.max_retries = max_retries
                .trim()
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid MAX_RETRIES: {}", e)))?;
        }

        if let Ok(wait_times) = self.get_env_var("WAIT_TIMES") {
            config.wait_times = split_list(&wait_times)
                .map(|seconds| {
                    seconds.parse::<u64>().map(Duration::from_secs).map_err(|e| {
                        ConfigError::EnvError(format!("Invalid WAIT_TIMES entry '{}': {}", seconds, e))
                    })
                })
                .collect::<ConfigResult<Vec<_>>>()?;
        }

        if let Ok(fuzz) = self.get_env_var("FUZZ") {
            config.fuzz = fuzz
                .trim()
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid FUZZ: {}", e)))?;
        }

        if let Ok(auto_retry) = self.get_env_var("AUTO_RETRY") {
            config.auto_retry = auto_retry
                .trim()
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid AUTO_RETRY: {}", e)))?;
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(&self, config: &mut LoggingConfig) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

/// Comma separated list, blank entries dropped
fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|item| !item.is_empty())
}
