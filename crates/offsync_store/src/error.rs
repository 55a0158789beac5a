//! Error types for store backends.

use thiserror::Error;

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors that can occur in a store backend.
///
/// Cloneable so a deferred failure can be carried inside a
/// [`Completion`](crate::Completion).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store has not been initialized with a schema yet.
    #[error("store not initialized")]
    NotInitialized,

    /// The backend is unreachable (offline remote, closed connection).
    #[error("store unavailable")]
    Unavailable,

    /// No record carries the requested local identity.
    #[error("unknown local id {0}")]
    UnknownLocalId(u64),

    /// No record carries the requested remote identity.
    #[error("unknown remote id {0}")]
    UnknownRemoteId(u64),

    /// The record carries no identity the backend can address.
    #[error("record has no identity for this store")]
    MissingIdentity,

    /// Backend-specific failure (I/O, transport, serialization).
    #[error("backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Creates a backend error from any message.
    pub fn backend(message: impl Into<String>) -> Self {
        StoreError::Backend(message.into())
    }
}
