//! In-memory transactional store
//!
//! Collections of JSON records with a version per collection. Each
//! connection keeps a stack of open frames: the bottom frame is the real
//! transaction, every frame above it is a savepoint. Commits of the
//! outermost frame are optimistic: if any collection the transaction
//! touched was changed by someone else in the meantime, the commit fails
//! with a [`SerializationFailure`].

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use crate::connection::{Connection, ConnectionManager, ConnectionStats, Transaction};
use crate::{SerializationFailure, StorageError, StorageResult};

#[derive(Debug, Default)]
struct Collection {
    version: u64,
    records: Vec<Value>,
}

#[derive(Debug, Default)]
struct StoreState {
    collections: HashMap<String, Collection>,
}

impl StoreState {
    fn version(&self, collection: &str) -> u64 {
        self.collections.get(collection).map_or(0, |c| c.version)
    }

    fn records(&self, collection: &str) -> Vec<Value> {
        self.collections
            .get(collection)
            .map(|c| c.records.clone())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone)]
enum PendingWrite {
    Insert(String, Value),
    Clear(String),
}

impl PendingWrite {
    fn collection(&self) -> &str {
        match self {
            PendingWrite::Insert(name, _) | PendingWrite::Clear(name) => name,
        }
    }

    fn apply(&self, records: &mut Vec<Value>) {
        match self {
            PendingWrite::Insert(_, value) => records.push(value.clone()),
            PendingWrite::Clear(_) => records.clear(),
        }
    }
}

#[derive(Debug, Default)]
struct Frame {
    /// Distinguishes this frame from earlier frames at the same depth
    generation: u64,
    writes: Vec<PendingWrite>,
}

/// Per-connection transaction state
#[derive(Debug, Default)]
struct Session {
    frames: Vec<Frame>,
    /// Collection versions observed by the outermost transaction
    observed: HashMap<String, u64>,
    next_generation: u64,
    stats: ConnectionStats,
}

impl Session {
    /// Whether the frame a handle was opened for is still on the stack
    fn is_open(&self, depth: usize, generation: u64) -> bool {
        self.frames
            .get(depth)
            .is_some_and(|frame| frame.generation == generation)
    }
}

/// Shared in-memory store
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<StoreState>>,
}

impl InMemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new logical connection
    pub fn connect(&self) -> Arc<dyn Connection> {
        Arc::new(InMemoryConnection::new(self.state.clone()))
    }

    /// Current version of a collection; bumped by every committed write
    pub fn version(&self, collection: &str) -> u64 {
        self.state.read().version(collection)
    }
}

#[async_trait]
impl ConnectionManager for InMemoryStore {
    async fn get_connection(&self) -> StorageResult<Arc<dyn Connection>> {
        Ok(self.connect())
    }

    async fn health_check(&self) -> StorageResult<bool> {
        Ok(true)
    }
}

/// One logical connection to an [`InMemoryStore`]
#[derive(Clone)]
pub struct InMemoryConnection {
    store: Arc<RwLock<StoreState>>,
    session: Arc<Mutex<Session>>,
}

impl InMemoryConnection {
    fn new(store: Arc<RwLock<StoreState>>) -> Self {
        Self {
            store,
            session: Arc::new(Mutex::new(Session::default())),
        }
    }

    /// Remember the committed version of a collection the first time the
    /// outermost transaction touches it
    fn observe(&self, session: &mut Session, collection: &str) {
        if !session.observed.contains_key(collection) {
            let version = self.store.read().version(collection);
            session.observed.insert(collection.to_string(), version);
        }
    }

    fn visible_records(&self, session: &Session, depth: usize, collection: &str) -> Vec<Value> {
        let mut records = self.store.read().records(collection);
        for frame in &session.frames[..=depth] {
            for write in frame.writes.iter().filter(|w| w.collection() == collection) {
                write.apply(&mut records);
            }
        }
        records
    }

    fn commit_frame(&self, depth: usize, generation: u64) -> StorageResult<()> {
        let mut session = self.session.lock();
        if !session.is_open(depth, generation) {
            return Err(savepoint_closed(depth));
        }

        // Savepoints left open by the caller go away with their parent
        session.frames.truncate(depth + 1);
        let frame = session.frames.pop().unwrap_or_default();

        if depth > 0 {
            session.frames[depth - 1].writes.extend(frame.writes);
            session.stats.transactions_committed += 1;
            tracing::trace!(depth, "Savepoint released");
            return Ok(());
        }

        let observed = std::mem::take(&mut session.observed);
        let mut store = self.store.write();

        if let Some((collection, _)) = observed
            .iter()
            .find(|(name, version)| store.version(name) != **version)
        {
            session.stats.transactions_rolled_back += 1;
            session.stats.serialization_failures += 1;
            tracing::debug!(%collection, "Commit refused, collection changed concurrently");
            return Err(StorageError::statement(SerializationFailure::new(format!(
                "collection '{}' was modified by a concurrent transaction",
                collection
            ))));
        }

        for write in &frame.writes {
            let entry = store
                .collections
                .entry(write.collection().to_string())
                .or_default();
            write.apply(&mut entry.records);
            entry.version += 1;
        }

        session.stats.transactions_committed += 1;
        Ok(())
    }

    fn rollback_frame(&self, depth: usize, generation: u64) {
        let mut session = self.session.lock();
        if !session.is_open(depth, generation) {
            return;
        }

        session.frames.truncate(depth);
        if depth == 0 {
            session.observed.clear();
        }
        session.stats.transactions_rolled_back += 1;
    }
}

#[async_trait]
impl Connection for InMemoryConnection {
    async fn begin_transaction(&self) -> StorageResult<Box<dyn Transaction>> {
        let mut session = self.session.lock();
        let depth = session.frames.len();
        if depth == 0 {
            session.observed.clear();
        }
        session.next_generation += 1;
        let generation = session.next_generation;
        session.frames.push(Frame {
            generation,
            writes: Vec::new(),
        });
        session.stats.transactions_begun += 1;

        Ok(Box::new(InMemoryTransaction {
            connection: self.clone(),
            depth,
            generation,
            finished: false,
        }))
    }

    fn open_transactions(&self) -> usize {
        self.session.lock().frames.len()
    }

    async fn fetch_all(&self, collection: &str) -> StorageResult<Vec<Value>> {
        Ok(self.store.read().records(collection))
    }

    async fn ping(&self) -> StorageResult<bool> {
        Ok(true)
    }

    async fn stats(&self) -> StorageResult<ConnectionStats> {
        Ok(self.session.lock().stats.clone())
    }
}

/// Transaction or savepoint on an [`InMemoryConnection`]
pub struct InMemoryTransaction {
    connection: InMemoryConnection,
    depth: usize,
    generation: u64,
    finished: bool,
}

impl InMemoryTransaction {
    fn session(&self) -> StorageResult<parking_lot::MutexGuard<'_, Session>> {
        let session = self.connection.session.lock();
        if !session.is_open(self.depth, self.generation) {
            return Err(savepoint_closed(self.depth));
        }
        Ok(session)
    }
}

#[async_trait]
impl Transaction for InMemoryTransaction {
    async fn insert(&mut self, collection: &str, record: Value) -> StorageResult<()> {
        let mut session = self.session()?;
        self.connection.observe(&mut session, collection);
        session.frames[self.depth]
            .writes
            .push(PendingWrite::Insert(collection.to_string(), record));
        Ok(())
    }

    async fn fetch_all(&mut self, collection: &str) -> StorageResult<Vec<Value>> {
        let mut session = self.session()?;
        self.connection.observe(&mut session, collection);
        Ok(self
            .connection
            .visible_records(&session, self.depth, collection))
    }

    async fn delete_all(&mut self, collection: &str) -> StorageResult<u64> {
        let mut session = self.session()?;
        self.connection.observe(&mut session, collection);
        let removed = self
            .connection
            .visible_records(&session, self.depth, collection)
            .len();
        session.frames[self.depth]
            .writes
            .push(PendingWrite::Clear(collection.to_string()));
        Ok(removed as u64)
    }

    fn connection(&self) -> Arc<dyn Connection> {
        Arc::new(self.connection.clone())
    }

    async fn commit(self: Box<Self>) -> StorageResult<()> {
        let mut this = self;
        this.finished = true;
        this.connection.commit_frame(this.depth, this.generation)
    }

    async fn rollback(self: Box<Self>) -> StorageResult<()> {
        let mut this = self;
        this.finished = true;
        this.connection.rollback_frame(this.depth, this.generation);
        Ok(())
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if !self.finished {
            self.connection.rollback_frame(self.depth, self.generation);
        }
    }
}

fn savepoint_closed(depth: usize) -> StorageError {
    StorageError::TransactionFailed(format!(
        "Transaction at depth {} is no longer open",
        depth
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_commit_makes_records_visible() {
        let store = InMemoryStore::new();
        let conn = store.connect();

        let mut tx = conn.begin_transaction().await.unwrap();
        tx.insert("jobs", json!({"job": "is fun!"})).await.unwrap();
        assert_eq!(tx.count("jobs").await.unwrap(), 1);
        assert_eq!(conn.count("jobs").await.unwrap(), 0);
        assert_eq!(conn.open_transactions(), 1);

        tx.commit().await.unwrap();
        assert_eq!(conn.count("jobs").await.unwrap(), 1);
        assert_eq!(conn.open_transactions(), 0);
        assert_eq!(store.version("jobs"), 1);
    }

    #[tokio::test]
    async fn test_savepoint_rollback_keeps_outer_writes() {
        let store = InMemoryStore::new();
        let conn = store.connect();

        let mut outer = conn.begin_transaction().await.unwrap();
        outer.insert("jobs", json!({"job": "outer"})).await.unwrap();

        let mut inner = outer.connection().begin_transaction().await.unwrap();
        assert_eq!(conn.open_transactions(), 2);
        inner.insert("jobs", json!({"job": "inner"})).await.unwrap();
        assert_eq!(inner.count("jobs").await.unwrap(), 2);
        inner.rollback().await.unwrap();

        assert_eq!(conn.open_transactions(), 1);
        assert_eq!(outer.count("jobs").await.unwrap(), 1);
        outer.commit().await.unwrap();

        let records = conn.fetch_all("jobs").await.unwrap();
        assert_eq!(records, vec![json!({"job": "outer"})]);
    }

    #[tokio::test]
    async fn test_savepoint_commit_merges_into_parent() {
        let store = InMemoryStore::new();
        let conn = store.connect();

        let mut outer = conn.begin_transaction().await.unwrap();
        let mut inner = conn.begin_transaction().await.unwrap();
        inner.insert("jobs", json!({"job": "inner"})).await.unwrap();
        inner.commit().await.unwrap();

        // Still invisible outside until the outer transaction commits
        assert_eq!(conn.count("jobs").await.unwrap(), 0);
        assert_eq!(outer.count("jobs").await.unwrap(), 1);
        outer.commit().await.unwrap();
        assert_eq!(conn.count("jobs").await.unwrap(), 1);

        let stats = conn.stats().await.unwrap();
        assert_eq!(stats.transactions_begun, 2);
        assert_eq!(stats.transactions_committed, 2);
    }

    #[tokio::test]
    async fn test_dropped_transaction_rolls_back() {
        let store = InMemoryStore::new();
        let conn = store.connect();

        {
            let mut tx = conn.begin_transaction().await.unwrap();
            tx.insert("jobs", json!({})).await.unwrap();
        }

        assert_eq!(conn.open_transactions(), 0);
        assert_eq!(conn.count("jobs").await.unwrap(), 0);
        assert_eq!(conn.stats().await.unwrap().transactions_rolled_back, 1);
    }

    #[tokio::test]
    async fn test_delete_all() {
        let store = InMemoryStore::new();
        let conn = store.connect();

        let mut tx = conn.begin_transaction().await.unwrap();
        tx.insert("jobs", json!(1)).await.unwrap();
        tx.insert("jobs", json!(2)).await.unwrap();
        tx.commit().await.unwrap();

        let mut tx = conn.begin_transaction().await.unwrap();
        assert_eq!(tx.delete_all("jobs").await.unwrap(), 2);
        tx.insert("jobs", json!(3)).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(conn.fetch_all("jobs").await.unwrap(), vec![json!(3)]);
    }

    #[tokio::test]
    async fn test_concurrent_commit_is_a_serialization_failure() {
        let store = InMemoryStore::new();
        let first = store.connect();
        let second = store.connect();

        let mut a = first.begin_transaction().await.unwrap();
        let mut b = second.begin_transaction().await.unwrap();
        assert_eq!(a.count("jobs").await.unwrap(), 0);
        assert_eq!(b.count("jobs").await.unwrap(), 0);

        a.insert("jobs", json!("a")).await.unwrap();
        b.insert("jobs", json!("b")).await.unwrap();
        a.commit().await.unwrap();

        let err = b.commit().await.unwrap_err();
        let statement = err.statement_error().unwrap();
        assert!(statement.is::<SerializationFailure>());
        assert_eq!(second.open_transactions(), 0);
        assert_eq!(second.stats().await.unwrap().serialization_failures, 1);
        assert_eq!(first.count("jobs").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_closed_savepoint_is_rejected() {
        let store = InMemoryStore::new();
        let conn = store.connect();

        let outer = conn.begin_transaction().await.unwrap();
        let mut inner = conn.begin_transaction().await.unwrap();
        outer.rollback().await.unwrap();

        let err = inner.insert("jobs", json!({})).await.unwrap_err();
        assert!(matches!(err, StorageError::TransactionFailed(_)));
        assert!(inner.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_stale_handle_leaves_newer_frames_alone() {
        let store = InMemoryStore::new();
        let conn = store.connect();

        let outer = conn.begin_transaction().await.unwrap();
        let stale_savepoint = conn.begin_transaction().await.unwrap();
        let stale_nested = conn.begin_transaction().await.unwrap();
        outer.rollback().await.unwrap();
        assert_eq!(conn.open_transactions(), 0);

        // New frames at the same depths as the closed ones
        let mut outer = conn.begin_transaction().await.unwrap();
        let mut inner = conn.begin_transaction().await.unwrap();
        let mut nested = conn.begin_transaction().await.unwrap();
        outer.insert("jobs", json!("outer")).await.unwrap();
        inner.insert("jobs", json!("inner")).await.unwrap();
        nested.insert("jobs", json!("nested")).await.unwrap();

        let err = stale_savepoint.commit().await.unwrap_err();
        assert!(matches!(err, StorageError::TransactionFailed(_)));
        drop(stale_nested);
        assert_eq!(conn.open_transactions(), 3);
        assert_eq!(nested.count("jobs").await.unwrap(), 3);

        nested.commit().await.unwrap();
        inner.commit().await.unwrap();
        outer.commit().await.unwrap();
        assert_eq!(
            conn.fetch_all("jobs").await.unwrap(),
            vec![json!("outer"), json!("inner"), json!("nested")]
        );
    }

    #[tokio::test]
    async fn test_store_as_connection_manager() {
        let store = InMemoryStore::new();
        assert!(store.health_check().await.unwrap());
        let conn = store.get_connection().await.unwrap();
        assert!(conn.ping().await.unwrap());
    }
}
