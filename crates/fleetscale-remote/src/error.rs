//! Error types for remote execution.

use thiserror::Error;

/// A result type using `RemoteError`.
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Errors that can occur while talking to a machine.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The server lacks what is needed to connect.
    #[error("server {server} is not reachable: {reason}")]
    NotConfigured {
        /// Server name.
        server: String,
        /// What is missing.
        reason: &'static str,
    },

    /// The client could not be set up.
    #[error("failed to connect to {target}: {message}")]
    Connect {
        /// Address connected to.
        target: String,
        /// Underlying error.
        message: String,
    },

    /// A remote operation failed.
    #[error("{operation} failed on {target}: {message}")]
    Operation {
        /// Operation name.
        operation: &'static str,
        /// Server or container the operation targeted.
        target: String,
        /// Underlying error.
        message: String,
    },

    /// Certificate generation failed.
    #[error("certificate error: {0}")]
    Certificate(#[from] rcgen::Error),

    /// Local filesystem error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
