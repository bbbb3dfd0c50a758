//! Transaction retry policy for txretry
//!
//! This crate decides whether a failed unit of work should run again:
//! it classifies the failure, bounds the number of retries, computes a
//! fuzzed backoff delay and refuses to retry inside a nested transaction.

pub mod backoff;
pub mod classifier;
pub mod executor;
pub mod retry;

// Re-export commonly used types
pub use backoff::{Backoff, SATURATION_DELAY};
pub use classifier::{classify, ErrorClassifier};
pub use executor::{RetryingTransactionExecutor, TransactionRunner};
pub use retry::{AttemptState, RetryAttempt, RetryDecision, RetryError, RetryOptions, RetryPolicy, StopReason};
