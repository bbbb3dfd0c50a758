//! Transaction handles and the plain (non-retrying) transaction entry point

use futures::future::BoxFuture;
use serde::Serialize;
use std::sync::Arc;

use crate::{
    connection::{Connection, Transaction as ConnTransaction},
    StorageError, StorageResult,
};

/// Transaction wrapper handed to units of work
///
/// Tracks whether the unit of work already finalised the boundary itself,
/// so the runner neither commits a rolled back transaction nor touches a
/// committed one twice.
pub struct Transaction {
    inner: Option<Box<dyn ConnTransaction>>,
    committed: bool,
    rolled_back: bool,
}

impl Transaction {
    pub fn new(inner: Box<dyn ConnTransaction>) -> Self {
        Self {
            inner: Some(inner),
            committed: false,
            rolled_back: false,
        }
    }

    /// Insert a serializable record
    pub async fn insert<R: Serialize>(&mut self, collection: &str, record: &R) -> StorageResult<()> {
        let value = serde_json::to_value(record)?;
        self.active()?.insert(collection, value).await
    }

    /// Fetch records visible to this transaction
    pub async fn fetch_all(&mut self, collection: &str) -> StorageResult<Vec<serde_json::Value>> {
        self.active()?.fetch_all(collection).await
    }

    /// Count records visible to this transaction
    pub async fn count(&mut self, collection: &str) -> StorageResult<usize> {
        self.active()?.count(collection).await
    }

    /// Delete every record of a collection
    pub async fn delete_all(&mut self, collection: &str) -> StorageResult<u64> {
        self.active()?.delete_all(collection).await
    }

    /// The connection this transaction runs on
    ///
    /// Beginning a transaction on it opens a nested boundary.
    pub fn connection(&self) -> StorageResult<Arc<dyn Connection>> {
        self.check_state()?;
        self.inner
            .as_ref()
            .map(|tx| tx.connection())
            .ok_or_else(|| StorageError::TransactionFailed("Transaction already finalized".to_string()))
    }

    /// Commit the transaction
    ///
    /// Only the runner commits; a unit of work that could commit itself and
    /// then fail would be re-run on top of its own committed writes.
    pub(crate) async fn commit(&mut self) -> StorageResult<()> {
        let tx = self.take()?;
        tx.commit().await?;
        self.committed = true;
        Ok(())
    }

    /// Rollback the transaction
    ///
    /// A unit of work may call this and still return `Ok`; nothing it did
    /// is kept and the runner will not commit.
    pub async fn rollback(&mut self) -> StorageResult<()> {
        let tx = self.take()?;
        // The handle is gone even if the store reports an error
        self.rolled_back = true;
        tx.rollback().await
    }

    /// Whether commit or rollback already happened
    pub(crate) fn is_finished(&self) -> bool {
        self.committed || self.rolled_back
    }

    fn active(&mut self) -> StorageResult<&mut Box<dyn ConnTransaction>> {
        self.check_state()?;
        self.inner
            .as_mut()
            .ok_or_else(|| StorageError::TransactionFailed("Transaction already finalized".to_string()))
    }

    fn take(&mut self) -> StorageResult<Box<dyn ConnTransaction>> {
        self.check_state()?;
        self.inner
            .take()
            .ok_or_else(|| StorageError::TransactionFailed("Transaction already finalized".to_string()))
    }

    /// Check if transaction is in valid state
    fn check_state(&self) -> StorageResult<()> {
        if self.committed {
            return Err(StorageError::TransactionFailed(
                "Transaction already committed".to_string(),
            ));
        }
        if self.rolled_back {
            return Err(StorageError::TransactionFailed(
                "Transaction already rolled back".to_string(),
            ));
        }
        Ok(())
    }
}

/// Run a unit of work inside a single transaction boundary, without retries
///
/// Commits when the unit of work returns `Ok` (unless it already finalised
/// the transaction) and rolls back when it returns `Err`.
pub async fn run_in_transaction<T, F>(connection: &dyn Connection, mut work: F) -> StorageResult<T>
where
    F: for<'c> FnMut(&'c mut Transaction) -> BoxFuture<'c, StorageResult<T>> + Send,
    T: Send,
{
    run_attempt(connection, &mut work).await
}

/// One attempt of a unit of work; the building block of every runner
pub async fn run_attempt<T, F>(connection: &dyn Connection, work: &mut F) -> StorageResult<T>
where
    F: for<'c> FnMut(&'c mut Transaction) -> BoxFuture<'c, StorageResult<T>> + Send,
    T: Send,
{
    let mut transaction = Transaction::new(connection.begin_transaction().await?);

    match work(&mut transaction).await {
        Ok(result) => {
            if !transaction.is_finished() {
                transaction.commit().await?;
            }
            Ok(result)
        }
        Err(error) => {
            if !transaction.is_finished() {
                if let Err(rollback_error) = transaction.rollback().await {
                    // The original error wins
                    tracing::warn!(
                        error = %rollback_error,
                        "Rollback failed after unit of work error"
                    );
                }
            }
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InMemoryStore, SerializationFailure};
    use serde_json::json;

    #[tokio::test]
    async fn test_commits_on_success() {
        let store = InMemoryStore::new();
        let conn = store.connect();

        let inserted = run_in_transaction(conn.as_ref(), |tx| {
            Box::pin(async move {
                tx.insert("jobs", &json!({"job": "is fun!"})).await?;
                tx.count("jobs").await
            })
        })
        .await
        .unwrap();

        assert_eq!(inserted, 1);
        assert_eq!(conn.count("jobs").await.unwrap(), 1);
        assert_eq!(conn.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_explicit_rollback_is_not_committed() {
        let store = InMemoryStore::new();
        let conn = store.connect();

        run_in_transaction(conn.as_ref(), |tx| {
            Box::pin(async move {
                tx.insert("jobs", &json!({"job": "gives money!"})).await?;
                tx.rollback().await
            })
        })
        .await
        .unwrap();

        assert_eq!(conn.count("jobs").await.unwrap(), 0);
        let stats = conn.stats().await.unwrap();
        assert_eq!(stats.transactions_committed, 0);
        assert_eq!(stats.transactions_rolled_back, 1);
    }

    #[tokio::test]
    async fn test_rolls_back_and_returns_original_error() {
        let store = InMemoryStore::new();
        let conn = store.connect();

        let err = run_in_transaction(conn.as_ref(), |tx| {
            Box::pin(async move {
                tx.insert("jobs", &json!({"job": "doomed"})).await?;
                Err::<(), _>(StorageError::statement(SerializationFailure::new("conflict")))
            })
        })
        .await
        .unwrap_err();

        assert!(err.statement_error().unwrap().is::<SerializationFailure>());
        assert_eq!(conn.count("jobs").await.unwrap(), 0);
        assert_eq!(conn.open_transactions(), 0);
    }

    #[tokio::test]
    async fn test_handle_unusable_after_finalisation() {
        let store = InMemoryStore::new();
        let conn = store.connect();

        let err = run_in_transaction(conn.as_ref(), |tx| {
            Box::pin(async move {
                tx.rollback().await?;
                tx.insert("jobs", &json!({})).await
            })
        })
        .await
        .unwrap_err();

        assert!(matches!(err, StorageError::TransactionFailed(ref msg) if msg.contains("rolled back")));
        assert!(!err.is_transaction_failure());
    }
}
