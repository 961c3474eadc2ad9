//! Error types for the provider crate.

use thiserror::Error;

/// Errors that can occur while talking to a hosting backend.
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The instance no longer exists at the provider.
    #[error("instance not found: {0}")]
    InstanceNotFound(String),

    /// The provider API returned an error response.
    #[error("provider API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Message extracted from the response body.
        message: String,
    },

    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Whether this is the already-destroyed sentinel.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::InstanceNotFound(_))
    }

    /// Check if this error is retriable.
    #[must_use]
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::Http(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            Self::InstanceNotFound(_) | Self::Config(_) => false,
        }
    }
}

/// A specialized Result type for provider operations.
pub type Result<T> = std::result::Result<T, ProviderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_sentinel() {
        assert!(ProviderError::InstanceNotFound("42".into()).is_not_found());
        assert!(!ProviderError::Config("x".into()).is_not_found());
    }

    #[test]
    fn retriable_api_statuses() {
        let api = |status| ProviderError::Api {
            status,
            message: String::new(),
        };
        assert!(api(503).is_retriable());
        assert!(api(429).is_retriable());
        assert!(!api(422).is_retriable());
    }
}
