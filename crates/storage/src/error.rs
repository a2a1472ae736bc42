//! Storage error types and result alias.
//!
//! Every backend maps its native failures (socket errors, driver errors,
//! corrupt payloads) onto [`StorageError`] so that the ticket registries built
//! on top never see backend-specific error types.
//!
//! # Example
//!
//! ```
//! use ticketd_storage::{StorageError, StorageResult};
//!
//! fn lookup(key: &str) -> StorageResult<Vec<u8>> {
//!     Err(StorageError::not_found(key))
//! }
//!
//! assert!(matches!(lookup("k"), Err(StorageError::NotFound { .. })));
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
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageError {
    /// The requested key was not found in the storage backend.
    #[error("Key not found: {key}")]
    NotFound {
        /// The key that was not found.
        key: String,
    },

    /// A compare-and-set precondition or transaction commit lost a race.
    ///
    /// The caller decides whether to re-read and try again; backends never
    /// retry on their own.
    #[error("Transaction conflict")]
    Conflict,

    /// The backend could not be reached.
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

    /// Catch-all for backend failures that fit no other category.
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
    /// Creates a new `NotFound` error for the given key.
    #[must_use]
    pub fn not_found(key: impl Into<String>) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Creates a new `Conflict` error.
    #[must_use]
    pub fn conflict() -> Self {
        Self::Conflict
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

    /// Creates a new `Internal` error with a message and source error.
    #[must_use]
    pub fn internal_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Internal { message: message.into(), source: Some(Arc::new(source)) }
    }

    /// Creates a new `Timeout` error.
    #[must_use]
    pub fn timeout() -> Self {
        Self::Timeout
    }

    /// Returns `true` for failures of the transport rather than of the request.
    ///
    /// `Conflict` is not transient: it reports a lost race whose resolution
    /// depends on re-reading state.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Timeout)
    }
}
