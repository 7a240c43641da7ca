/// Unified error handling for Compuerta
///
/// This module provides the error taxonomy shared by every component: configuration
/// errors, connectivity errors, selection errors, cache-state conditions and
/// transaction-state errors. Only connectivity errors are retryable.

use std::fmt;
use std::io;
use thiserror::Error;

/// Main error type for Compuerta operations
#[derive(Debug, Error)]
pub enum CompuertaError {
    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Dial, ping or statement transport failure on a named connection
    #[error("Connection error on {name}: {message}")]
    Connection { name: String, message: String },

    /// The connection has been closed
    #[error("Connection {name} is closed")]
    Closed { name: String },

    /// Timeout errors
    #[error("Operation timed out: {operation}")]
    Timeout { operation: String },

    /// One or more connections failed to close
    #[error("Failed to close {count} connection(s): {details}")]
    CloseFailed { count: usize, details: String },

    /// A required pool member was never registered
    #[error("{what} is not configured")]
    NotConfigured { what: String },

    /// A registered pool member is currently marked inactive
    #[error("{what} {name} is not active")]
    NotActive { what: String, name: String },

    /// Registration with a name that is already taken
    #[error("Duplicate {kind} name: {name}")]
    DuplicateName { kind: String, name: String },

    /// Replica selection found no candidate
    #[error("No healthy replica available: {reason}")]
    NoHealthyReplica { reason: String },

    /// Shard routing or execution errors
    #[error("Shard error: {message}")]
    Shard { message: String },

    /// The database rejected or failed a statement
    #[error("Query error: {message}")]
    Query { message: String },

    /// Query cache conditions
    #[error("Cache error: {0}")]
    Cache(#[from] CacheError),

    /// Managed transaction errors
    #[error("Transaction error: {0}")]
    Transaction(#[from] TransactionError),

    /// Internal errors (should not happen in normal operation)
    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Configuration-specific errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Query cache conditions
///
/// `Miss`, `Disabled` and `SizeExceeded` are not faults; callers branch on them.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache miss")]
    Miss,

    #[error("cache disabled")]
    Disabled,

    #[error("entry of {size} bytes exceeds the cache limit of {max} bytes")]
    SizeExceeded { size: usize, max: usize },

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("backend failure: {0}")]
    Backend(String),
}

/// Managed transaction state errors
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("transaction {id} is already committed")]
    AlreadyCommitted { id: String },

    #[error("transaction {id} is already rolled back")]
    AlreadyRolledBack { id: String },

    #[error("savepoint not found: {name}")]
    SavepointNotFound { name: String },

    #[error("invalid savepoint name: {name}")]
    InvalidSavepoint { name: String },

    #[error("transaction callback panicked: {message}")]
    Panicked { message: String },

    #[error("transaction failed after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: String },
}

/// Result type alias for Compuerta operations
pub type CompuertaResult<T> = Result<T, CompuertaError>;

impl From<io::Error> for CompuertaError {
    fn from(err: io::Error) -> Self {
        CompuertaError::Connection {
            name: "io".to_string(),
            message: err.to_string(),
        }
    }
}

/// Convenience methods for creating specific error types
impl CompuertaError {
    /// Create a connection error for the named member
    pub fn connection<N: Into<String>, S: Into<String>>(name: N, message: S) -> Self {
        CompuertaError::Connection {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout<S: Into<String>>(operation: S) -> Self {
        CompuertaError::Timeout {
            operation: operation.into(),
        }
    }

    /// Create a not-configured selection error
    pub fn not_configured<S: Into<String>>(what: S) -> Self {
        CompuertaError::NotConfigured { what: what.into() }
    }

    /// Create a not-active selection error
    pub fn not_active<W: Into<String>, N: Into<String>>(what: W, name: N) -> Self {
        CompuertaError::NotActive {
            what: what.into(),
            name: name.into(),
        }
    }

    /// Create a duplicate registration error
    pub fn duplicate<K: Into<String>, N: Into<String>>(kind: K, name: N) -> Self {
        CompuertaError::DuplicateName {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a shard error
    pub fn shard<S: Into<String>>(message: S) -> Self {
        CompuertaError::Shard {
            message: message.into(),
        }
    }

    /// Create a query error
    pub fn query<S: Into<String>>(message: S) -> Self {
        CompuertaError::Query {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        CompuertaError::Internal {
            message: message.into(),
        }
    }

    /// Check if this error is a connectivity failure worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CompuertaError::Connection { .. }
                | CompuertaError::Closed { .. }
                | CompuertaError::Timeout { .. }
        )
    }

    /// Check if this is the cache-miss condition
    pub fn is_cache_miss(&self) -> bool {
        matches!(self, CompuertaError::Cache(CacheError::Miss))
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            CompuertaError::Config(_) => ErrorSeverity::Critical,
            CompuertaError::Internal { .. } => ErrorSeverity::Critical,
            CompuertaError::Connection { .. } => ErrorSeverity::Warning,
            CompuertaError::Closed { .. } => ErrorSeverity::Warning,
            CompuertaError::Timeout { .. } => ErrorSeverity::Warning,
            CompuertaError::Cache(CacheError::Miss | CacheError::Disabled) => ErrorSeverity::Info,
            _ => ErrorSeverity::Error,
        }
    }
}

/// Error severity levels for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSeverity {
    /// Critical errors that require immediate attention
    Critical,
    /// Errors that affect functionality but don't crash the system
    Error,
    /// Warnings about potential issues
    Warning,
    /// Informational messages about expected conditions
    Info,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorSeverity::Critical => write!(f, "CRITICAL"),
            ErrorSeverity::Error => write!(f, "ERROR"),
            ErrorSeverity::Warning => write!(f, "WARNING"),
            ErrorSeverity::Info => write!(f, "INFO"),
        }
    }
}
