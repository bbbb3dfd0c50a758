//! Storage error types

use std::any::TypeId;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// An error produced by a database driver.
///
/// Driver errors are what retry classifiers look at. They carry their type
/// identity and type name across `dyn` boundaries and may wrap an
/// underlying cause that is itself a driver error.
pub trait DriverError: std::error::Error + Send + Sync + 'static {
    /// Fully qualified type name used for name-based matching
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Type identity of the concrete error
    fn driver_type_id(&self) -> TypeId {
        TypeId::of::<Self>()
    }

    /// The driver error this one wraps, if any
    fn driver_cause(&self) -> Option<&(dyn DriverError + 'static)> {
        None
    }
}

impl dyn DriverError {
    /// Whether the concrete type behind this error is `T`
    pub fn is<T: DriverError>(&self) -> bool {
        self.driver_type_id() == TypeId::of::<T>()
    }

    /// Last path segment of [`DriverError::type_name`]
    pub fn short_type_name(&self) -> &'static str {
        short_name(self.type_name())
    }
}

/// Strip the module path from a type name, keeping generic arguments intact
pub fn short_name(type_name: &str) -> &str {
    let path = type_name.split('<').next().unwrap_or(type_name);
    match path.rfind("::") {
        Some(idx) => &type_name[idx + 2..],
        None => type_name,
    }
}

macro_rules! driver_errors {
    ($($(#[$meta:meta])* $name:ident => $label:literal;)*) => {
        $(
            $(#[$meta])*
            #[derive(Debug, Clone)]
            pub struct $name {
                message: String,
                cause: Option<Arc<dyn DriverError>>,
            }

            impl $name {
                pub fn new(message: impl Into<String>) -> Self {
                    Self {
                        message: message.into(),
                        cause: None,
                    }
                }

                /// Attach the driver error this one was raised for
                pub fn caused_by(mut self, cause: impl DriverError) -> Self {
                    self.cause = Some(Arc::new(cause));
                    self
                }

                pub fn message(&self) -> &str {
                    &self.message
                }
            }

            impl fmt::Display for $name {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    write!(f, concat!($label, ": {}"), self.message)
                }
            }

            impl std::error::Error for $name {}

            impl DriverError for $name {
                fn driver_cause(&self) -> Option<&(dyn DriverError + 'static)> {
                    self.cause.as_deref()
                }
            }
        )*
    };
}

driver_errors! {
    /// Concurrent transactions could not be serialized (SQLSTATE 40001)
    SerializationFailure => "could not serialize access";
    /// The transaction was chosen as a deadlock victim (SQLSTATE 40P01)
    DeadlockDetected => "deadlock detected";
    /// A statement was rejected by the database
    StatementInvalid => "statement invalid";
}

/// A statement or transaction failure reported by the store.
///
/// This is the only kind of error the retry executor will consider
/// retrying.
#[derive(Debug, Clone)]
pub struct StatementError {
    error: Arc<dyn DriverError>,
}

impl StatementError {
    pub fn new(error: impl DriverError) -> Self {
        Self {
            error: Arc::new(error),
        }
    }

    /// The driver error reported by the store
    pub fn driver_error(&self) -> &(dyn DriverError + 'static) {
        self.error.as_ref()
    }

    /// The driver error wrapped by [`Self::driver_error`], if any
    pub fn driver_cause(&self) -> Option<&(dyn DriverError + 'static)> {
        self.error.driver_cause()
    }

    /// Whether the reported driver error is exactly `T`
    pub fn is<T: DriverError>(&self) -> bool {
        self.driver_error().is::<T>()
    }
}

impl fmt::Display for StatementError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)?;
        if let Some(cause) = self.driver_cause() {
            write!(f, " (caused by {})", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for StatementError {}

/// Storage-related errors
#[derive(Debug, Error)]
pub enum StorageError {
    /// Connection-related errors
    #[error("Database connection failed: {0}")]
    ConnectionFailed(String),

    /// Statement or transaction failure reported by the driver
    #[error("Statement failed: {0}")]
    Statement(StatementError),

    /// Misuse of a transaction handle
    #[error("Transaction failed: {0}")]
    TransactionFailed(String),

    /// JSON serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Any error raised by application code inside a unit of work
    #[error(transparent)]
    Application(#[from] anyhow::Error),
}

impl StorageError {
    /// Wrap a driver error as a statement failure
    pub fn statement(error: impl DriverError) -> Self {
        StorageError::Statement(StatementError::new(error))
    }

    /// Wrap an arbitrary application error
    pub fn application(error: impl Into<anyhow::Error>) -> Self {
        StorageError::Application(error.into())
    }

    /// Check if the store reported this as a failed statement or transaction
    pub fn is_transaction_failure(&self) -> bool {
        matches!(self, StorageError::Statement(_))
    }

    /// The statement failure, if this is one
    pub fn statement_error(&self) -> Option<&StatementError> {
        match self {
            StorageError::Statement(err) => Some(err),
            _ => None,
        }
    }

    /// Get error code for log records
    pub fn error_code(&self) -> &'static str {
        match self {
            StorageError::ConnectionFailed(_) => "CONNECTION_ERROR",
            StorageError::Statement(_) => "STATEMENT_ERROR",
            StorageError::TransactionFailed(_) => "TRANSACTION_ERROR",
            StorageError::Json(_) => "SERIALIZATION_ERROR",
            StorageError::Application(_) => "APPLICATION_ERROR",
        }
    }
}
