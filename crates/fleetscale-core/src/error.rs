//! Common error types for fleetscale.
//!
//! This module provides shared error types that are used across multiple crates.

use thiserror::Error;

/// A result type using `CoreError`.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur throughout the fleetscale system.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An invalid identifier was provided.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] crate::ids::IdError),

    /// A provider name did not match any known backend.
    #[error("unknown provider: {0}")]
    UnknownProvider(String),

    /// An internal error occurred.
    #[error("internal error: {0}")]
    Internal(String),
}
