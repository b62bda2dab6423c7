//! Error types for recordb.

use std::path::PathBuf;

use thiserror::Error;

use crate::value::FieldType;

/// Result type alias using [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in recordb operations.
///
/// Lookups that find nothing are not errors: they come back as `Option::None`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid schema or index definition. The caller has to fix its configuration.
    #[error("invalid definition: {0}")]
    Definition(String),

    /// Persisted bytes could not be decoded.
    #[error("corrupted data: {0}")]
    Corrupted(String),

    #[error("type mismatch: expected {expected:?}, got {actual}")]
    TypeMismatch { expected: FieldType, actual: String },

    #[error("unknown field number {number} for entity {entity}")]
    UnknownField { entity: String, number: u8 },

    #[error("unknown index {index} for entity {entity}")]
    UnknownIndex { entity: String, index: String },

    #[error("unknown entity: {0}")]
    UnknownEntity(String),

    #[error("duplicate primary key: {0}")]
    DuplicateKey(String),

    #[error("primary key not found: {0}")]
    KeyNotFound(String),

    #[error("file opened read-only: {0}")]
    ReadOnly(PathBuf),
}

impl Error {
    pub(crate) fn corrupted(reason: impl Into<String>) -> Self {
        Self::Corrupted(reason.into())
    }

    pub(crate) fn definition(reason: impl Into<String>) -> Self {
        Self::Definition(reason.into())
    }
}
