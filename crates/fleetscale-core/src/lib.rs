//! Core types and utilities for fleetscale.
//!
//! This crate provides the vocabulary shared by every other fleetscale crate:
//!
//! - **Identifiers**: [`ServerName`] and per-machine secret generation
//! - **Instances**: the provider-facing [`Instance`] descriptor and [`ProviderKind`]
//! - **TLS material**: the PEM bundle generated per machine ([`TlsMaterial`])
//! - **Error types**: common error definitions shared across crates
//!
//! # Example
//!
//! ```
//! use fleetscale_core::{generate_secret, ServerName};
//!
//! let name = ServerName::generate();
//! assert!(name.as_str().starts_with("agent-"));
//!
//! let secret = generate_secret();
//! assert_eq!(secret.len(), 64);
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod ids;
pub mod instance;

pub use error::{CoreError, Result};
pub use ids::{generate_secret, IdError, ServerName};
pub use instance::{Instance, ProviderKind, TlsMaterial};
