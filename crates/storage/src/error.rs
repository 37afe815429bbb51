//! Storage error types and result alias.
//!
//! All store implementations map their internal failures to [`StorageError`].
//! Component configuration validation failures are reported as [`ConfigError`].
//!
//! # Example
//!
//! ```
//! use perimeter_storage::{StorageError, StorageResult};
//!
//! fn lookup(key: &str) -> StorageResult<Vec<u8>> {
//!     Err(StorageError::connection(format!("store unreachable while reading {key}")))
//! }
//! ```

use std::sync::Arc;

use thiserror::Error;

/// A boxed error type for source chain tracking.
pub type BoxError = Arc<dyn std::error::Error + Send + Sync>;

/// Result type alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
///
/// # Non-exhaustive
///
/// New variants may be added without a semver-breaking change. Downstream
/// match expressions must include a wildcard arm (`_ =>`).
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// Compare-and-set precondition did not hold.
    ///
    /// Raised when another writer modified the key between read and write.
    #[error("Conflict on key: {key}")]
    Conflict {
        /// The contended key.
        key: String,
    },

    /// Connection or network error talking to the store.
    #[error("Connection error: {message}")]
    Connection {
        /// Description of the connection error.
        message: String,
        /// The underlying error that caused this connection failure.
        #[source]
        source: Option<BoxError>,
    },

    /// A stored value could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Description of the serialization error.
        message: String,
        /// The underlying error that caused serialization to fail.
        #[source]
        source: Option<BoxError>,
    },

    /// Catch-all for store-specific failures.
    #[error("Internal error: {message}")]
    Internal {
        /// Description of the internal error.
        message: String,
        /// The underlying error that caused this internal failure.
        #[source]
        source: Option<BoxError>,
    },

    /// The operation exceeded its time limit.
    #[error("Operation timeout")]
    Timeout,
}

impl StorageError {
    /// Creates a new `Conflict` error for the given key.
    #[must_use]
    pub fn conflict(key: impl Into<String>) -> Self {
        Self::Conflict { key: key.into() }
    }

    /// Creates a new `Connection` error with the given message.
    #[must_use]
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection { message: message.into(), source: None }
    }

    /// Creates a new `Connection` error with a message and source error.
    #[must_use]
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Serialization` error with the given message.
    #[must_use]
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization { message: message.into(), source: None }
    }

    /// Creates a new `Serialization` error with a message and source error.
    #[must_use]
    pub fn serialization_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Serialization { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Internal` error with the given message.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into(), source: None }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }
}

/// Configuration validation errors.
///
/// Returned by the validated builders of every component configuration
/// (circuit breaker, batching, verifier, limiters) and by environment loading.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// A numeric field is below its minimum.
    #[error("{field} must be at least {min}, got {value}")]
    BelowMinimum {
        /// Name of the offending field.
        field: &'static str,
        /// Minimum accepted value.
        min: String,
        /// Value that was supplied.
        value: String,
    },

    /// A numeric field is above its maximum.
    #[error("{field} must be at most {max}, got {value}")]
    AboveMaximum {
        /// Name of the offending field.
        field: &'static str,
        /// Maximum accepted value.
        max: String,
        /// Value that was supplied.
        value: String,
    },

    /// A duration or count must be strictly positive.
    #[error("{field} must be positive, got {value}")]
    MustBePositive {
        /// Name of the offending field.
        field: &'static str,
        /// Value that was supplied.
        value: String,
    },

    /// A required setting is absent.
    #[error("missing required setting: {field}")]
    Missing {
        /// Name of the missing setting.
        field: &'static str,
    },

    /// A setting could not be parsed.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Name of the offending setting.
        field: &'static str,
        /// Why the value was rejected.
        reason: String,
    },
}
