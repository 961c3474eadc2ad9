//! Error types for the storage layer.

use thiserror::Error;

use crate::types::ServerState;

/// A result type using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The requested record was not found.
    #[error("server not found: {0}")]
    NotFound(String),

    /// A record with the same name already exists.
    #[error("server already exists: {0}")]
    AlreadyExists(String),

    /// The stored state moved on since the caller read the record.
    #[error("server {server} is {actual}, expected {expected}")]
    Conflict {
        /// The server being written.
        server: String,
        /// The state the caller read.
        expected: ServerState,
        /// The state currently stored.
        actual: ServerState,
    },

    /// A database error occurred.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
}
