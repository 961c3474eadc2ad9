//! Hosting provider backends for fleetscale.
//!
//! This crate provides the [`Provider`] trait, a uniform `create`/`destroy`
//! contract over cloud APIs, and the [`HetznerProvider`] implementation.
//!
//! Every backend reports an already-gone resource as
//! [`ProviderError::InstanceNotFound`] so the engine can treat a repeated
//! destroy as success.
//!
//! # Example
//!
//! ```no_run
//! use fleetscale_core::ServerName;
//! use fleetscale_provider::{CreateOpts, HetznerConfig, HetznerProvider, Provider};
//!
//! # async fn example(tls: fleetscale_core::TlsMaterial) -> Result<(), Box<dyn std::error::Error>> {
//! let provider = HetznerProvider::new(HetznerConfig::from_env()?)?;
//!
//! let instance = provider
//!     .create(&CreateOpts {
//!         name: ServerName::generate(),
//!         tls,
//!     })
//!     .await?;
//! println!("booted {} at {}", instance.id, instance.address);
//!
//! provider.destroy(&instance).await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Testing
//!
//! Enable the `test-utils` feature for [`MockProvider`], an in-memory backend
//! with injectable failures.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod hetzner;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use error::{ProviderError, Result};
pub use hetzner::{HetznerConfig, HetznerProvider};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::{DestroyBehavior, MockProvider};

use async_trait::async_trait;
use fleetscale_core::{Instance, ProviderKind, ServerName, TlsMaterial};

/// Parameters for creating a machine.
#[derive(Debug, Clone)]
pub struct CreateOpts {
    /// Name of the server record; used as the machine hostname.
    pub name: ServerName,
    /// Certificate material to install for the remote Docker daemon.
    pub tls: TlsMaterial,
}

/// A hosting backend able to boot and destroy machines.
#[async_trait]
pub trait Provider: Send + Sync {
    /// The backend this provider talks to.
    fn kind(&self) -> ProviderKind;

    /// Boot a new machine.
    ///
    /// # Errors
    ///
    /// Returns an error if the cloud API rejects the request or is unreachable.
    async fn create(&self, opts: &CreateOpts) -> Result<Instance>;

    /// Destroy a machine.
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::InstanceNotFound` if the machine is already gone,
    /// or another error if the request fails.
    async fn destroy(&self, instance: &Instance) -> Result<()>;

    /// Look up the machine booted for `name`, if any.
    ///
    /// Used to recover machines whose create call succeeded but whose
    /// instance was never recorded.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn find(&self, name: &ServerName) -> Result<Option<Instance>>;
}
