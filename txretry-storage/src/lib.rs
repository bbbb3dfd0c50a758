//! Transactional store abstraction for txretry
//!
//! This crate describes what the retry executor needs from a database: a
//! connection that can open (possibly nested) transactions, report how many
//! are open, and tell statement failures apart from any other error. An
//! in-memory implementation with optimistic conflict detection is included.

pub mod connection;
pub mod error;
pub mod memory;
pub mod transaction;

// Re-export core types for convenience
pub use connection::{Connection, ConnectionManager, ConnectionStats};
pub use error::{
    DeadlockDetected, DriverError, SerializationFailure, StatementError, StatementInvalid,
    StorageError, StorageResult,
};
pub use memory::{InMemoryConnection, InMemoryStore};
pub use transaction::{run_in_transaction, Transaction};
