//! Error types for the reconciliation engine.

use offsync_store::{FieldViolation, StoreError};
use thiserror::Error;

/// Result type for engine operations.
pub type EngineResult<T> = Result<T, EngineError>;

/// Errors surfaced by the reconciliation engine.
///
/// Validation errors are detected before any store is touched, so a
/// failed call never leaves a partial write behind.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The engine has not finished initializing, or was closed.
    #[error("engine not ready")]
    NotReady,

    /// A write carried no fields at all.
    #[error("empty payload")]
    EmptyPayload,

    /// A required field carried no value and has no default.
    #[error("missing required field: {field}")]
    MissingRequiredField {
        /// The offending field name.
        field: String,
    },

    /// A field value failed its type, pattern, length, or custom check.
    #[error("invalid field: {field}")]
    InvalidField {
        /// The offending field name.
        field: String,
    },

    /// The targeted entity was deleted; stale writes are rejected.
    #[error("operation on removed data")]
    RemovedData,

    /// A store backend failed.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl EngineError {
    /// Maps a schema violation into the engine taxonomy.
    pub fn from_violation(violation: FieldViolation) -> Self {
        match violation {
            FieldViolation::MissingRequired(field) => EngineError::MissingRequiredField { field },
            FieldViolation::Invalid(field) => EngineError::InvalidField { field },
        }
    }
}
