//! Error types for the document model.

use thiserror::Error;

/// Errors raised while (de)serializing operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum OperationError {
    #[error("unknown operation kind: {0}")]
    UnknownKind(String),

    #[error("malformed {kind} operation: {reason}")]
    Malformed { kind: String, reason: String },
}

/// A request failed validation before touching any state.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("block not found: {0}")]
    UnknownBlock(String),
}

impl ValidationError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidField {
            field,
            reason: reason.into(),
        }
    }
}
