//! Tears down `shutdown` servers.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetscale_core::Instance;
use fleetscale_provider::Provider;
use fleetscale_remote::RemoteExecFactory;
use fleetscale_store::{Server, ServerState, Store};
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::installer::AGENT_CONTAINER;
use crate::lifecycle;
use crate::tasks::{self, Fanout};

/// Moves servers from `shutdown` through `stopping` to `stopped` or `error`.
#[derive(Clone)]
pub struct Collector {
    store: Arc<dyn Store>,
    provider: Arc<dyn Provider>,
    remote: Arc<dyn RemoteExecFactory>,
    cancel: CancellationToken,
    destroy_timeout: Duration,
    stop_timeout: Duration,
    fanout: Fanout,
}

impl Collector {
    /// Create a collector.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn Provider>,
        remote: Arc<dyn RemoteExecFactory>,
        cancel: CancellationToken,
        destroy_timeout: Duration,
        stop_timeout: Duration,
        limit: usize,
    ) -> Self {
        Self {
            store,
            provider,
            remote,
            cancel,
            destroy_timeout,
            stop_timeout,
            fanout: Fanout::new("collector", limit),
        }
    }

    /// Claim every `shutdown` server and start tearing it down.
    ///
    /// Returns the number of servers claimed.
    ///
    /// # Errors
    ///
    /// Returns an error if the servers cannot be listed or claimed.
    pub fn collect(&self) -> Result<usize> {
        let servers = self.store.list_state(ServerState::Shutdown)?;
        let mut claimed = 0;

        for mut server in servers {
            if !lifecycle::claim(self.store.as_ref(), &mut server, ServerState::Stopping)? {
                continue;
            }
            tracing::debug!(server = %server.name, "Claimed server for teardown");

            let this = self.clone();
            self.fanout
                .spawn(server.name.clone(), async move { this.teardown(server).await });
            claimed += 1;
        }

        Ok(claimed)
    }

    /// In-flight teardown tasks.
    #[must_use]
    pub fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    async fn teardown(&self, mut server: Server) {
        if server.is_provisioned() {
            if server.address.is_some() {
                self.stop_agent(&server).await;
            }

            let destroy = destroy_instance(self.provider.as_ref(), &server);
            match tasks::bounded(&self.cancel, self.destroy_timeout, destroy).await {
                Ok(()) => {}
                Err(EngineError::Interrupted) => {
                    tracing::debug!(server = %server.name, "Teardown interrupted");
                    return;
                }
                Err(e) => {
                    tracing::error!(server = %server.name, error = %e, "Failed to destroy server");
                    server.error = Some(e.to_string());
                    lifecycle::settle(self.store.as_ref(), &mut server, ServerState::Error);
                    return;
                }
            }
        }

        server.stopped = Some(Utc::now());
        lifecycle::settle(self.store.as_ref(), &mut server, ServerState::Stopped);
        if let Err(e) = self.remote.release(&server).await {
            tracing::warn!(server = %server.name, error = %e, "Failed to release remote state");
        }
        tracing::info!(server = %server.name, "Server stopped");
    }

    /// Ask the agent to finish its builds and exit. Failures are logged only.
    async fn stop_agent(&self, server: &Server) {
        let stop = async {
            let remote = self.remote.connect(server).await?;
            remote
                .stop_container(AGENT_CONTAINER, self.stop_timeout)
                .await?;
            Ok::<(), EngineError>(())
        };

        if let Err(e) = tasks::bounded(&self.cancel, self.stop_timeout, stop).await {
            tracing::warn!(server = %server.name, error = %e, "Failed to stop agent");
        }
    }
}

/// Destroy the machine behind `server`, treating an already-gone machine as
/// destroyed.
///
/// # Errors
///
/// Returns the provider error for anything other than not-found.
pub async fn destroy_instance(provider: &dyn Provider, server: &Server) -> Result<()> {
    let Some(instance) = server.instance() else {
        return Ok(());
    };
    destroy(provider, &instance).await
}

/// Destroy `instance`; not-found counts as destroyed.
pub(crate) async fn destroy(provider: &dyn Provider, instance: &Instance) -> Result<()> {
    match provider.destroy(instance).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_not_found() => {
            tracing::debug!(server = %instance.name, id = %instance.id, "Instance already gone");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
