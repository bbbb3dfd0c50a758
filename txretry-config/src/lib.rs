//! Configuration for txretry
//!
//! The retry policy defaults and the logging setup live here, split by
//! domain, with validation, defaults, and environment variable support.

pub mod error;
pub mod loader;
pub mod validation;

// Domain-specific configuration modules
pub mod domains;

// Re-export main types
pub use error::{ConfigError, ConfigResult};
pub use loader::ConfigLoader;
pub use validation::Validatable;

// Re-export domain configurations
pub use domains::{
    logging::{LogFormat, LogLevel, LoggingConfig},
    retry::{RetryConfig, DEFAULT_RETRY_ON, DEFAULT_WAIT_TIMES, MAX_WAIT_SECONDS},
    TxRetryConfig,
};

// Re-export utilities
pub use domains::utils::serde_duration_seq;
