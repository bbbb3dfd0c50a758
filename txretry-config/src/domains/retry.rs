//! Transaction retry configuration

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigResult;
use crate::validation::{validate_at_most, validate_required_string, Validatable};

/// Error type names retried when nothing else is configured
pub const DEFAULT_RETRY_ON: &[&str] = &["SerializationFailure", "DeadlockDetected"];

/// Base delays in seconds for the 1st, 2nd, ... retry
pub const DEFAULT_WAIT_TIMES: &[u64] = &[0, 1, 2, 4, 8, 16, 32];

/// Upper bound for a single configured wait time
pub const MAX_WAIT_SECONDS: u64 = 3600;

/// Process-wide retry defaults
///
/// Read once at startup and handed to the retry executor. Individual calls
/// may still override `retry_on` and `max_retries`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryConfig {
    /// Names of the driver error types that make a transaction retryable
    #[serde(default = "default_retry_on")]
    pub retry_on: Vec<String>,

    /// Maximum number of retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay before each retry, in seconds
    #[serde(with = "crate::domains::utils::serde_duration_seq", default = "default_wait_times")]
    pub wait_times: Vec<Duration>,

    /// Whether to randomize the delay around its base value
    #[serde(default = "crate::domains::utils::default_true")]
    pub fuzz: bool,

    /// Whether the retrying runner replaces the plain transaction entry point
    #[serde(default = "crate::domains::utils::default_false")]
    pub auto_retry: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_on: default_retry_on(),
            max_retries: default_max_retries(),
            wait_times: default_wait_times(),
            fuzz: true,
            auto_retry: false,
        }
    }
}

impl Validatable for RetryConfig {
    fn validate(&self) -> ConfigResult<()> {
        for name in &self.retry_on {
            validate_required_string(name, "retry_on entry", self.domain_name())?;
        }

        for wait in &self.wait_times {
            validate_at_most(wait.as_secs(), MAX_WAIT_SECONDS, "wait_times entry", self.domain_name())?;
        }

        if self.retry_on.is_empty() {
            log::warn!("retry_on is empty, failed transactions will never be retried");
        }

        Ok(())
    }

    fn domain_name(&self) -> &'static str {
        "retry"
    }
}

fn default_retry_on() -> Vec<String> {
    DEFAULT_RETRY_ON.iter().map(|name| name.to_string()).collect()
}

fn default_max_retries() -> u32 {
    3
}

fn default_wait_times() -> Vec<Duration> {
    DEFAULT_WAIT_TIMES.iter().copied().map(Duration::from_secs).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_config_defaults() {
        let config = RetryConfig::default();
        assert_eq!(config.retry_on, vec!["SerializationFailure", "DeadlockDetected"]);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.wait_times.len(), 7);
        assert_eq!(config.wait_times[3], Duration::from_secs(4));
        assert!(config.fuzz);
        assert!(!config.auto_retry);
    }

    #[test]
    fn test_retry_config_validation() {
        let mut config = RetryConfig::default();
        assert!(config.validate().is_ok());

        config.retry_on.push(String::new());
        assert!(config.validate().is_err());

        config = RetryConfig::default();
        config.wait_times.push(Duration::from_secs(MAX_WAIT_SECONDS + 1));
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_empty_lists_are_allowed() {
        let config = RetryConfig {
            retry_on: Vec::new(),
            wait_times: Vec::new(),
            ..RetryConfig::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_config_from_yaml() {
        let yaml = r#"
retry_on: [SerializationFailure]
max_retries: 5
wait_times: [1, 1, 1]
fuzz: false
auto_retry: true
"#;
        let config: RetryConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.retry_on, vec!["SerializationFailure"]);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.wait_times, vec![Duration::from_secs(1); 3]);
        assert!(!config.fuzz);
        assert!(config.auto_retry);
    }
}
