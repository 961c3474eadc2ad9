//! Remote execution on provisioned machines.
//!
//! The engine never talks to a machine directly; it asks a
//! [`RemoteExecFactory`] for a [`RemoteExec`] handle bound to one server and
//! drives containers through it. The production transport is the machine's
//! Docker daemon over mutual TLS ([`DockerFactory`]).
//!
//! # Testing
//!
//! Enable the `test-utils` feature for [`MockRemoteFactory`], which records
//! every container operation in memory.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod certs;
pub mod docker;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

pub use docker::DockerFactory;
pub use error::{RemoteError, Result};

#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockRemoteFactory;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetscale_store::Server;

/// Description of a container to create on a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    /// Container name.
    pub name: String,
    /// Image reference, optionally tagged.
    pub image: String,
    /// Environment as `KEY=VALUE` pairs.
    pub env: Vec<String>,
    /// Volume binds as `host:container[:mode]`.
    pub binds: Vec<String>,
    /// Container labels.
    pub labels: HashMap<String, String>,
    /// Restart the container whenever it exits.
    pub restart_always: bool,
}

/// A container that exists on a machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerSummary {
    /// Container name without the leading slash.
    pub name: String,
    /// Image the container was created from.
    pub image: String,
}

/// Handle to one machine's container runtime.
///
/// Dropping the handle closes the underlying connection.
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Check that the machine answers.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon is unreachable.
    async fn ping(&self) -> Result<()>;

    /// Pull an image onto the machine.
    ///
    /// # Errors
    ///
    /// Returns an error if the pull fails.
    async fn pull_image(&self, image: &str) -> Result<()>;

    /// List all containers, running or not.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn list_containers(&self) -> Result<Vec<ContainerSummary>>;

    /// Create a container without starting it.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon rejects the container.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<()>;

    /// Start a created container.
    ///
    /// # Errors
    ///
    /// Returns an error if the container cannot be started.
    async fn start_container(&self, name: &str) -> Result<()>;

    /// Stop a container, waiting up to `timeout` for it to exit.
    ///
    /// # Errors
    ///
    /// Returns an error if the stop request fails.
    async fn stop_container(&self, name: &str, timeout: Duration) -> Result<()>;
}

/// Opens [`RemoteExec`] handles for servers.
#[async_trait]
pub trait RemoteExecFactory: Send + Sync {
    /// Connect to the given server.
    ///
    /// # Errors
    ///
    /// Returns `RemoteError::NotConfigured` if the server has no address or
    /// certificate material, or another error if the connection cannot be set up.
    async fn connect(&self, server: &Server) -> Result<Arc<dyn RemoteExec>>;

    /// Drop any local state kept for a server that has been torn down.
    ///
    /// # Errors
    ///
    /// Returns an error if local cleanup fails.
    async fn release(&self, _server: &Server) -> Result<()> {
        Ok(())
    }
}
