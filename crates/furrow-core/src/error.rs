//! Error types for furrow-core

use thiserror::Error;

use crate::models::QueueStatus;
use crate::sync::RemoteError;

/// Result type alias using furrow-core's Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in furrow-core operations
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("Database error: {0}")]
    Database(String),

    /// libSQL error
    #[error("libSQL error: {0}")]
    LibSql(#[from] libsql::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Queue item, conflict, or cache entry not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Queue item state machine violation
    #[error("Invalid queue transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: QueueStatus,
        to: QueueStatus,
    },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Remote store error
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    /// Sync pass could not complete
    #[error("Sync error: {0}")]
    Sync(String),
}
