//! Error types for the collaboration layer.

use folio_core::{OperationError, ValidationError};
use thiserror::Error;
use uuid::Uuid;

/// Wire-level failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("frame is not a JSON object")]
    NotAnObject,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("not connected")]
    NotConnected,
}

/// Page store failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("compression error: {0}")]
    Compression(String),

    #[error("snapshot for page {page_id} is corrupt: {reason}")]
    Corrupt { page_id: Uuid, reason: String },
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

/// A client request that was rejected without touching the page.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Operation(#[from] OperationError),
}

/// Failure to attach a peer to a page session.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum JoinError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("page {page_id} already has {max} peers")]
    Full { page_id: Uuid, max: usize },
}

/// A local edit or request the client could not carry out.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Validation(#[from] ValidationError),
}
