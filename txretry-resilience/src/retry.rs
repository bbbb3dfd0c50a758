//! Retry policy, per-call options and the state of one execution

use rand::Rng;
use std::fmt;
use std::time::Duration;
use txretry_config::RetryConfig;
use txretry_storage::StorageError;

use crate::backoff::Backoff;
use crate::classifier::{classify, ErrorClassifier};

/// Process-wide retry policy
///
/// Built once at startup, usually from [`RetryConfig`], and shared by every
/// execution. Per-call [`RetryOptions`] are merged over it.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Classifiers tried in order against a failed statement
    pub retry_on: Vec<ErrorClassifier>,

    /// Maximum number of retries after the first attempt
    pub max_retries: u32,

    /// Delay between retries
    pub backoff: Backoff,

    /// Whether the retrying runner should be the default transaction runner
    pub auto_retry: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Build a policy from configuration; configured names become
    /// name-based classifiers
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            retry_on: config
                .retry_on
                .iter()
                .map(|name| ErrorClassifier::named(name.as_str()))
                .collect(),
            max_retries: config.max_retries,
            backoff: Backoff::new(config.wait_times.clone(), config.fuzz),
            auto_retry: config.auto_retry,
        }
    }

    /// Resolve the effective settings for one execution
    ///
    /// A call-site `retry_on` replaces the policy's list instead of
    /// extending it.
    pub fn resolve(&self, options: &RetryOptions) -> RetryAttempt {
        RetryAttempt {
            retry_count: 0,
            retry_on: options
                .retry_on
                .clone()
                .unwrap_or_else(|| self.retry_on.clone()),
            max_retries: options.max_retries.unwrap_or(self.max_retries),
            backoff: self.backoff.clone(),
            state: AttemptState::Running,
        }
    }
}

/// Per-call overrides of the retry policy
#[derive(Debug, Clone, Default)]
pub struct RetryOptions {
    retry_on: Option<Vec<ErrorClassifier>>,
    max_retries: Option<u32>,
}

impl RetryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Retry only on this classifier for the call
    pub fn retry_on(self, classifier: impl Into<ErrorClassifier>) -> Self {
        self.retry_on_any([classifier.into()])
    }

    /// Retry only on these classifiers for the call
    pub fn retry_on_any(mut self, classifiers: impl IntoIterator<Item = ErrorClassifier>) -> Self {
        self.retry_on = Some(classifiers.into_iter().collect());
        self
    }

    /// Override the retry budget for the call
    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }
}

/// Lifecycle of one execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptState {
    /// The unit of work is running
    Running,
    /// A retryable failure happened; waiting for the backoff to elapse
    Retrying,
    /// The unit of work returned successfully
    Succeeded,
    /// Retrying stopped; the last error goes back to the caller
    FailedTerminal,
}

impl AttemptState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AttemptState::Succeeded | AttemptState::FailedTerminal)
    }
}

/// Why a failure was not retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The error did not come from the store as a statement failure
    NonTransactionError,
    /// No classifier matched the failure
    Unclassified,
    /// The retry budget is used up
    BudgetExhausted { retries: u32 },
    /// An outer transaction is still open on the connection
    NestedTransaction,
    /// The effective classifier list is empty
    NoClassifiers,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::NonTransactionError => f.write_str("not a transaction error"),
            StopReason::Unclassified => f.write_str("no classifier matched"),
            StopReason::BudgetExhausted { retries } => {
                write!(f, "retry budget exhausted after {} retries", retries)
            }
            StopReason::NestedTransaction => f.write_str("nested transaction"),
            StopReason::NoClassifiers => f.write_str("no retry classifiers configured"),
        }
    }
}

/// Outcome of evaluating a failed attempt
#[derive(Debug, Clone, PartialEq)]
pub enum RetryDecision {
    /// Run the unit of work again after `delay`
    Retry {
        /// 1-based number of this retry
        retry_count: u32,
        delay: Duration,
        /// Name of the classifier that matched
        classifier: String,
    },
    /// Give the error back to the caller
    Stop(StopReason),
}

/// State of one execution: retry count and the effective settings
///
/// Owned by a single execution and never shared, so retry counts never
/// leak between calls.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    retry_count: u32,
    retry_on: Vec<ErrorClassifier>,
    max_retries: u32,
    backoff: Backoff,
    state: AttemptState,
}

impl RetryAttempt {
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_on(&self) -> &[ErrorClassifier] {
        &self.retry_on
    }

    pub fn state(&self) -> AttemptState {
        self.state
    }

    /// Evaluate a failed attempt with the thread-local generator
    pub fn decide(&mut self, error: &StorageError, nested: bool) -> RetryDecision {
        self.decide_with(error, nested, &mut rand::thread_rng())
    }

    /// Evaluate a failed attempt
    ///
    /// Checks run in a fixed order: statement failure, budget, nesting,
    /// empty classifier list, classification. A retry bumps the count and
    /// moves to [`AttemptState::Retrying`]; a stop is terminal.
    pub fn decide_with<R: Rng + ?Sized>(
        &mut self,
        error: &StorageError,
        nested: bool,
        rng: &mut R,
    ) -> RetryDecision {
        match self.evaluate(error, nested) {
            Ok(classifier) => {
                self.retry_count += 1;
                self.state = AttemptState::Retrying;
                RetryDecision::Retry {
                    retry_count: self.retry_count,
                    delay: self.backoff.delay_with(self.retry_count, rng),
                    classifier,
                }
            }
            Err(reason) => {
                self.state = AttemptState::FailedTerminal;
                RetryDecision::Stop(reason)
            }
        }
    }

    fn evaluate(&self, error: &StorageError, nested: bool) -> Result<String, StopReason> {
        let statement = error
            .statement_error()
            .ok_or(StopReason::NonTransactionError)?;

        if self.retry_count >= self.max_retries {
            return Err(StopReason::BudgetExhausted {
                retries: self.retry_count,
            });
        }
        if nested {
            return Err(StopReason::NestedTransaction);
        }
        if self.retry_on.is_empty() {
            return Err(StopReason::NoClassifiers);
        }

        classify(&self.retry_on, statement)
            .map(|classifier| classifier.name().to_string())
            .ok_or(StopReason::Unclassified)
    }

    /// The backoff elapsed; the unit of work runs again
    pub fn resume(&mut self) {
        if self.state == AttemptState::Retrying {
            self.state = AttemptState::Running;
        }
    }

    /// The unit of work returned successfully
    pub fn succeed(&mut self) {
        self.state = AttemptState::Succeeded;
    }
}

/// Why an execution gave up, together with the original error
#[derive(Debug, thiserror::Error)]
pub enum RetryError {
    /// The error was not a statement failure
    #[error("Non-transaction error: {0}")]
    NonTransactionError(StorageError),

    /// No classifier matched the statement failure
    #[error("Unclassified transaction error: {0}")]
    UnclassifiedTransactionError(StorageError),

    /// Classified failures kept recurring past the budget
    #[error("Retry budget exhausted after {retries} retries. Last error: {last_error}")]
    RetryBudgetExhausted { retries: u32, last_error: StorageError },

    /// Classified failure inside a nested transaction
    #[error("Nested transaction not retryable: {0}")]
    NestedTransactionNotRetryable(StorageError),

    /// The effective classifier list was empty
    #[error("No retry classifiers configured: {0}")]
    NoRetryClassifiersConfigured(StorageError),
}

impl RetryError {
    pub fn new(reason: StopReason, error: StorageError) -> Self {
        match reason {
            StopReason::NonTransactionError => RetryError::NonTransactionError(error),
            StopReason::Unclassified => RetryError::UnclassifiedTransactionError(error),
            StopReason::BudgetExhausted { retries } => RetryError::RetryBudgetExhausted {
                retries,
                last_error: error,
            },
            StopReason::NestedTransaction => RetryError::NestedTransactionNotRetryable(error),
            StopReason::NoClassifiers => RetryError::NoRetryClassifiersConfigured(error),
        }
    }

    /// Why retrying stopped
    pub fn reason(&self) -> StopReason {
        match self {
            RetryError::NonTransactionError(_) => StopReason::NonTransactionError,
            RetryError::UnclassifiedTransactionError(_) => StopReason::Unclassified,
            RetryError::RetryBudgetExhausted { retries, .. } => StopReason::BudgetExhausted {
                retries: *retries,
            },
            RetryError::NestedTransactionNotRetryable(_) => StopReason::NestedTransaction,
            RetryError::NoRetryClassifiersConfigured(_) => StopReason::NoClassifiers,
        }
    }

    /// The original error, as the store or the unit of work raised it
    pub fn error(&self) -> &StorageError {
        match self {
            RetryError::NonTransactionError(error)
            | RetryError::UnclassifiedTransactionError(error)
            | RetryError::NestedTransactionNotRetryable(error)
            | RetryError::NoRetryClassifiersConfigured(error) => error,
            RetryError::RetryBudgetExhausted { last_error, .. } => last_error,
        }
    }

    /// Get the underlying error
    pub fn into_inner(self) -> StorageError {
        match self {
            RetryError::NonTransactionError(error)
            | RetryError::UnclassifiedTransactionError(error)
            | RetryError::NestedTransactionNotRetryable(error)
            | RetryError::NoRetryClassifiersConfigured(error) => error,
            RetryError::RetryBudgetExhausted { last_error, .. } => last_error,
        }
    }
}
