//! Retrying transaction executor

use futures::future::BoxFuture;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::time::sleep;
use txretry_config::RetryConfig;
use txretry_storage::transaction::{run_attempt, run_in_transaction, Transaction};
use txretry_storage::{Connection, StorageResult};

use crate::retry::{RetryDecision, RetryError, RetryOptions, RetryPolicy, StopReason};

/// Runs units of work in a transaction and re-runs them on classified failures
///
/// Every call owns its own [`crate::RetryAttempt`], so one executor can be
/// shared freely between tasks.
#[derive(Debug, Clone)]
pub struct RetryingTransactionExecutor {
    policy: Arc<RetryPolicy>,
}

impl RetryingTransactionExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy: Arc::new(policy),
        }
    }

    pub fn with_default_policy() -> Self {
        Self::new(RetryPolicy::default())
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(RetryPolicy::from_config(config))
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Execute a unit of work with the process-wide policy
    pub async fn execute<T, F>(&self, connection: &dyn Connection, work: F) -> StorageResult<T>
    where
        F: for<'c> FnMut(&'c mut Transaction) -> BoxFuture<'c, StorageResult<T>> + Send,
        T: Send,
    {
        self.execute_with(connection, &RetryOptions::default(), work)
            .await
    }

    /// Execute a unit of work with per-call overrides
    ///
    /// When retrying stops, the error of the last attempt is returned as is.
    pub async fn execute_with<T, F>(
        &self,
        connection: &dyn Connection,
        options: &RetryOptions,
        work: F,
    ) -> StorageResult<T>
    where
        F: for<'c> FnMut(&'c mut Transaction) -> BoxFuture<'c, StorageResult<T>> + Send,
        T: Send,
    {
        self.try_execute_with(connection, options, work)
            .await
            .map_err(RetryError::into_inner)
    }

    /// Execute a unit of work, reporting why retrying stopped
    pub async fn try_execute_with<T, F>(
        &self,
        connection: &dyn Connection,
        options: &RetryOptions,
        mut work: F,
    ) -> Result<T, RetryError>
    where
        F: for<'c> FnMut(&'c mut Transaction) -> BoxFuture<'c, StorageResult<T>> + Send,
        T: Send,
    {
        let mut attempt = self.policy.resolve(options);

        loop {
            debug!(
                "Running transaction (retry {} of at most {}), state {:?}",
                attempt.retry_count(),
                attempt.max_retries(),
                attempt.state()
            );

            let error = match run_attempt(connection, &mut work).await {
                Ok(result) => {
                    attempt.succeed();
                    if attempt.retry_count() > 0 {
                        info!(
                            "Transaction succeeded after {} retries",
                            attempt.retry_count()
                        );
                    }
                    return Ok(result);
                }
                Err(error) => error,
            };

            // The failed attempt's own boundary is closed by now, anything
            // still open belongs to an enclosing transaction
            let nested = connection.open_transactions() != 0;

            match attempt.decide(&error, nested) {
                RetryDecision::Retry {
                    retry_count,
                    delay,
                    classifier,
                } => {
                    warn!(
                        "Transaction Error! Retrying for the {}-{} time...",
                        retry_count,
                        ordinal_suffix(retry_count)
                    );
                    debug!(
                        "Matched {} on {}, waiting {:?}, state {:?}",
                        classifier,
                        error,
                        delay,
                        attempt.state()
                    );
                    if !delay.is_zero() {
                        sleep(delay).await;
                    }
                    attempt.resume();
                }
                RetryDecision::Stop(reason) => {
                    let code = error.error_code();
                    match reason {
                        StopReason::NonTransactionError => debug!(
                            "Transaction failed, not retrying ({}) [{}]: {}",
                            reason, code, error
                        ),
                        _ => warn!(
                            "Transaction failed, not retrying ({}) [{}]: {}",
                            reason, code, error
                        ),
                    }
                    debug!("Attempt state {:?}", attempt.state());
                    return Err(RetryError::new(reason, error));
                }
            }
        }
    }
}

/// English ordinal suffix for retry log lines
///
/// Only 1, 2 and 3 are special cased, so 21 reads "21-th".
fn ordinal_suffix(n: u32) -> &'static str {
    match n {
        1 => "st",
        2 => "nd",
        3 => "rd",
        _ => "th",
    }
}

/// The transaction entry point an application calls
///
/// With auto retry switched on in the policy every transaction goes
/// through the retrying executor, otherwise through a single plain
/// boundary.
#[derive(Debug, Clone)]
pub enum TransactionRunner {
    Plain,
    Retrying(RetryingTransactionExecutor),
}

impl TransactionRunner {
    pub fn from_policy(policy: RetryPolicy) -> Self {
        if policy.auto_retry {
            TransactionRunner::Retrying(RetryingTransactionExecutor::new(policy))
        } else {
            TransactionRunner::Plain
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::from_policy(RetryPolicy::from_config(config))
    }

    pub fn is_retrying(&self) -> bool {
        matches!(self, TransactionRunner::Retrying(_))
    }

    /// Run a unit of work in a transaction
    pub async fn transaction<T, F>(&self, connection: &dyn Connection, work: F) -> StorageResult<T>
    where
        F: for<'c> FnMut(&'c mut Transaction) -> BoxFuture<'c, StorageResult<T>> + Send,
        T: Send,
    {
        match self {
            TransactionRunner::Plain => run_in_transaction(connection, work).await,
            TransactionRunner::Retrying(executor) => executor.execute(connection, work).await,
        }
    }
}
