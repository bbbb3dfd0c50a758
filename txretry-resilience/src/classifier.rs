//! Classifiers deciding which statement failures are worth retrying

use std::fmt;
use txretry_storage::{DriverError, StatementError};

/// A rule matching driver errors, either by type or by type name
#[derive(Clone)]
pub enum ErrorClassifier {
    /// Matches one concrete driver error type
    ByType {
        name: &'static str,
        matches: fn(&(dyn DriverError + 'static)) -> bool,
    },

    /// Matches a driver error whose type name is this string, either fully
    /// qualified or as the bare type name
    ByName(String),
}

impl ErrorClassifier {
    /// Classifier matching the driver error type `T`
    pub fn of<T: DriverError>() -> Self {
        ErrorClassifier::ByType {
            name: std::any::type_name::<T>(),
            matches: is_type::<T>,
        }
    }

    /// Classifier matching a type name
    pub fn named(name: impl Into<String>) -> Self {
        ErrorClassifier::ByName(name.into())
    }

    pub fn name(&self) -> &str {
        match self {
            ErrorClassifier::ByType { name, .. } => name,
            ErrorClassifier::ByName(name) => name,
        }
    }

    /// Whether this classifier identifies a single driver error
    pub fn matches_error(&self, error: &(dyn DriverError + 'static)) -> bool {
        match self {
            ErrorClassifier::ByType { matches, .. } => matches(error),
            ErrorClassifier::ByName(name) => {
                name == error.type_name() || name == error.short_type_name()
            }
        }
    }

    /// Whether this classifier identifies the failure or its underlying cause
    pub fn matches(&self, error: &StatementError) -> bool {
        self.matches_error(error.driver_error())
            || error.driver_cause().is_some_and(|cause| self.matches_error(cause))
    }
}

fn is_type<T: DriverError>(error: &(dyn DriverError + 'static)) -> bool {
    error.is::<T>()
}

impl fmt::Debug for ErrorClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClassifier::ByType { name, .. } => f.debug_tuple("ByType").field(name).finish(),
            ErrorClassifier::ByName(name) => f.debug_tuple("ByName").field(name).finish(),
        }
    }
}

impl fmt::Display for ErrorClassifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<&str> for ErrorClassifier {
    fn from(name: &str) -> Self {
        ErrorClassifier::named(name)
    }
}

impl From<String> for ErrorClassifier {
    fn from(name: String) -> Self {
        ErrorClassifier::ByName(name)
    }
}

/// First classifier matching the failure, in configured order
pub fn classify<'a>(
    classifiers: &'a [ErrorClassifier],
    error: &StatementError,
) -> Option<&'a ErrorClassifier> {
    classifiers.iter().find(|classifier| classifier.matches(error))
}
