//! Error types for the engine.
//!
//! Sweep-level errors (listing or flipping servers) abort the sweep and are
//! logged by the loop that ran it. Errors hit while working on one server are
//! recorded on that server and never fail the sweep.

use std::time::Duration;

use fleetscale_core::ServerName;
use fleetscale_store::{ServerState, StoreError};
use thiserror::Error;

/// A result type using `EngineError`.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Hosting provider error.
    #[error("provider error: {0}")]
    Provider(#[from] fleetscale_provider::ProviderError),

    /// Remote execution error.
    #[error("remote error: {0}")]
    Remote(#[from] fleetscale_remote::RemoteError),

    /// The CI queue could not be read.
    #[error("queue error: {0}")]
    Queue(String),

    /// The requested state transition is not valid.
    #[error("invalid state transition for server {server}: cannot transition from {from} to {to}")]
    InvalidTransition {
        /// The server being transitioned.
        server: ServerName,
        /// The current state.
        from: ServerState,
        /// The requested target state.
        to: ServerState,
    },

    /// A remote operation exceeded its deadline.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The engine is shutting down.
    #[error("interrupted by shutdown")]
    Interrupted,

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl EngineError {
    /// Returns the appropriate HTTP status code for this error.
    #[must_use]
    pub const fn http_status_code(&self) -> u16 {
        match self {
            Self::Store(StoreError::NotFound(_)) => 404,
            Self::InvalidTransition { .. } | Self::Store(StoreError::Conflict { .. }) => 409,
            Self::Config(_) => 400,
            Self::Interrupted => 503,
            Self::Timeout(_) | Self::Queue(_) | Self::Provider(_) | Self::Remote(_) => 502,
            Self::Store(_) => 500,
        }
    }

    /// Returns true if this error might be resolved by retrying.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Provider(e) => e.is_retriable(),
            Self::Store(StoreError::Database(_))
            | Self::Remote(_)
            | Self::Queue(_)
            | Self::Timeout(_) => true,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_status_codes() {
        let server = ServerName::parse("agent-err").unwrap();

        assert_eq!(
            EngineError::Store(StoreError::NotFound("x".into())).http_status_code(),
            404
        );
        assert_eq!(
            EngineError::InvalidTransition {
                server,
                from: ServerState::Stopped,
                to: ServerState::Running,
            }
            .http_status_code(),
            409
        );
        assert_eq!(EngineError::Queue("down".into()).http_status_code(), 502);
    }

    #[test]
    fn retriable_errors() {
        assert!(EngineError::Timeout(Duration::from_secs(1)).is_retriable());
        assert!(EngineError::Queue("503".into()).is_retriable());
        assert!(!EngineError::Interrupted.is_retriable());
        assert!(!EngineError::Config("bad".into()).is_retriable());
        assert!(!EngineError::Provider(
            fleetscale_provider::ProviderError::InstanceNotFound("1".into())
        )
        .is_retriable());
    }
}
