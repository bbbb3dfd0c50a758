//! Connection management abstractions

use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;

use crate::StorageResult;

/// Connection statistics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConnectionStats {
    /// Transaction boundaries opened, savepoints included
    pub transactions_begun: u64,

    /// Boundaries that committed
    pub transactions_committed: u64,

    /// Boundaries that rolled back, explicitly or by being dropped
    pub transactions_rolled_back: u64,

    /// Commits refused because a concurrent transaction won
    pub serialization_failures: u64,
}

/// A logical database connection (object-safe)
#[async_trait]
pub trait Connection: Send + Sync {
    /// Begin a transaction, or a savepoint if one is already open
    async fn begin_transaction(&self) -> StorageResult<Box<dyn Transaction>>;

    /// Number of transaction boundaries currently open on this connection
    fn open_transactions(&self) -> usize;

    /// Fetch every committed record of a collection
    async fn fetch_all(&self, collection: &str) -> StorageResult<Vec<serde_json::Value>>;

    /// Count committed records of a collection
    async fn count(&self, collection: &str) -> StorageResult<usize> {
        Ok(self.fetch_all(collection).await?.len())
    }

    /// Check if the connection is healthy
    async fn ping(&self) -> StorageResult<bool>;

    /// Get connection statistics
    async fn stats(&self) -> StorageResult<ConnectionStats>;
}

/// Transaction boundary (object-safe)
#[async_trait]
pub trait Transaction: Send + Sync {
    /// Stage a record for insertion
    async fn insert(&mut self, collection: &str, record: serde_json::Value) -> StorageResult<()>;

    /// Records of a collection as seen from inside this transaction
    async fn fetch_all(&mut self, collection: &str) -> StorageResult<Vec<serde_json::Value>>;

    /// Count records of a collection as seen from inside this transaction
    async fn count(&mut self, collection: &str) -> StorageResult<usize> {
        Ok(self.fetch_all(collection).await?.len())
    }

    /// Stage removal of every record in a collection, returning how many
    async fn delete_all(&mut self, collection: &str) -> StorageResult<u64>;

    /// The connection this transaction runs on, for opening nested boundaries
    fn connection(&self) -> Arc<dyn Connection>;

    /// Commit the transaction
    async fn commit(self: Box<Self>) -> StorageResult<()>;

    /// Rollback the transaction
    async fn rollback(self: Box<Self>) -> StorageResult<()>;
}

/// Connection manager trait
#[async_trait]
pub trait ConnectionManager: Send + Sync {
    /// Get a connection from the store
    async fn get_connection(&self) -> StorageResult<Arc<dyn Connection>>;

    /// Health check for the store
    async fn health_check(&self) -> StorageResult<bool>;
}
