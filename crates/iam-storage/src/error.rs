//! Storage error types for the membership storage layer.

use std::fmt;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The storage engine aborted the statement to break a lock-ordering cycle.
    ///
    /// This is the only transient error; the same mutation may succeed when retried.
    #[error("Deadlock detected: {message}")]
    Deadlock {
        /// Message reported by the storage engine.
        message: String,
    },

    /// A row with the same natural key already exists.
    #[error("Membership already exists: {key}")]
    AlreadyExists {
        /// Rendered natural key of the conflicting row.
        key: String,
    },

    /// A database statement failed.
    #[error("Database error: {message}")]
    Database {
        /// Description of the failure.
        message: String,
    },

    /// Failed to connect to the storage backend.
    #[error("Connection error: {message}")]
    ConnectionError {
        /// Description of the connection error.
        message: String,
    },

    /// An internal storage error occurred.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
    },
}

impl StorageError {
    /// Creates a new `Deadlock` error.
    #[must_use]
    pub fn deadlock(message: impl Into<String>) -> Self {
        Self::Deadlock {
            message: message.into(),
        }
    }

    /// Creates a new `AlreadyExists` error.
    #[must_use]
    pub fn already_exists(key: impl Into<String>) -> Self {
        Self::AlreadyExists { key: key.into() }
    }

    /// Creates a new `Database` error.
    #[must_use]
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database {
            message: message.into(),
        }
    }

    /// Creates a new `ConnectionError` error.
    #[must_use]
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::ConnectionError {
            message: message.into(),
        }
    }

    /// Creates a new `Internal` error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns `true` if this error is a transient lock conflict.
    #[must_use]
    pub fn is_deadlock(&self) -> bool {
        matches!(self, Self::Deadlock { .. })
    }

    /// Returns `true` if this is an already exists error.
    #[must_use]
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }

    /// Returns the error category for logging/monitoring purposes.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Deadlock { .. } => ErrorCategory::Deadlock,
            Self::AlreadyExists { .. } => ErrorCategory::Conflict,
            Self::Database { .. } => ErrorCategory::Database,
            Self::ConnectionError { .. } => ErrorCategory::Infrastructure,
            Self::Internal { .. } => ErrorCategory::Internal,
        }
    }
}

/// Categories of storage errors for logging and monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Transient lock conflict.
    Deadlock,
    /// Natural key conflict.
    Conflict,
    /// Statement failure.
    Database,
    /// Infrastructure/connection error.
    Infrastructure,
    /// Internal error.
    Internal,
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deadlock => write!(f, "deadlock"),
            Self::Conflict => write!(f, "conflict"),
            Self::Database => write!(f, "database"),
            Self::Infrastructure => write!(f, "infrastructure"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// A storage mutation that failed, wrapped with its call-site context.
///
/// Carries the operation name and the serialized arguments so the failure can
/// be diagnosed from the log line alone.
#[derive(Debug, thiserror::Error)]
#[error("{operation} fail after {attempts} attempt(s), args=`{args}`: {source}")]
pub struct MutationError {
    /// Name of the failed operation, e.g. `storage.bulk_create`.
    pub operation: String,
    /// JSON rendering of the operation arguments.
    pub args: String,
    /// Number of attempts made, including the failing one.
    pub attempts: u32,
    /// The last storage error.
    #[source]
    pub source: StorageError,
}

impl MutationError {
    /// Returns `true` if the final attempt failed on a deadlock, i.e. the retry budget ran out.
    #[must_use]
    pub fn is_deadlock(&self) -> bool {
        self.source.is_deadlock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = StorageError::deadlock("40P01 deadlock detected");
        assert_eq!(err.to_string(), "Deadlock detected: 40P01 deadlock detected");

        let err = StorageError::already_exists("user/alice/1/2");
        assert_eq!(err.to_string(), "Membership already exists: user/alice/1/2");
    }

    #[test]
    fn test_deadlock_classification() {
        assert!(StorageError::deadlock("x").is_deadlock());
        assert!(!StorageError::database("x").is_deadlock());
        assert!(!StorageError::connection_error("x").is_deadlock());
        assert!(!StorageError::already_exists("x").is_deadlock());
    }

    #[test]
    fn test_error_category() {
        assert_eq!(StorageError::deadlock("x").category(), ErrorCategory::Deadlock);
        assert_eq!(StorageError::already_exists("x").category(), ErrorCategory::Conflict);
        assert_eq!(ErrorCategory::Infrastructure.to_string(), "infrastructure");
    }

    #[test]
    fn test_mutation_error_keeps_source() {
        use std::error::Error;

        let err = MutationError {
            operation: "storage.bulk_delete".into(),
            args: "[]".into(),
            attempts: 3,
            source: StorageError::deadlock("busy"),
        };
        assert!(err.is_deadlock());
        assert_eq!(
            err.to_string(),
            "storage.bulk_delete fail after 3 attempt(s), args=`[]`: Deadlock detected: busy"
        );
        assert!(err.source().is_some());
    }
}
