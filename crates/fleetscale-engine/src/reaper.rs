//! Drains `error` servers.
//!
//! The reaper is the only way out of `error`. It destroys whatever machine
//! the server may still own and always finishes in `stopped`; a destroy
//! failure is kept in the server's error message for operators. A server
//! without a recorded instance may still own a machine if its create went
//! through before the process died, so the reaper looks it up by name.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetscale_provider::Provider;
use fleetscale_remote::RemoteExecFactory;
use fleetscale_store::{Server, ServerState, Store};
use tokio_util::sync::CancellationToken;

use crate::collector::{destroy, destroy_instance};
use crate::error::{EngineError, Result};
use crate::lifecycle;
use crate::tasks::{self, Fanout};

/// Moves servers from `error` to `stopped`.
#[derive(Clone)]
pub struct Reaper {
    store: Arc<dyn Store>,
    provider: Arc<dyn Provider>,
    remote: Arc<dyn RemoteExecFactory>,
    cancel: CancellationToken,
    destroy_timeout: Duration,
    fanout: Fanout,
}

impl Reaper {
    /// Create a reaper.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn Provider>,
        remote: Arc<dyn RemoteExecFactory>,
        cancel: CancellationToken,
        destroy_timeout: Duration,
        limit: usize,
    ) -> Self {
        Self {
            store,
            provider,
            remote,
            cancel,
            destroy_timeout,
            fanout: Fanout::new("reaper", limit),
        }
    }

    /// Start destroying every `error` server not already being reaped.
    ///
    /// Returns the number of servers picked up.
    ///
    /// # Errors
    ///
    /// Returns an error if the servers cannot be listed.
    pub fn reap(&self) -> Result<usize> {
        let servers: Vec<Server> = self
            .store
            .list_state(ServerState::Error)?
            .into_iter()
            .filter(|s| !self.fanout.is_active(&s.name))
            .collect();
        let count = servers.len();

        for server in servers {
            let this = self.clone();
            self.fanout
                .spawn(server.name.clone(), async move { this.drain_server(server).await });
        }

        Ok(count)
    }

    /// In-flight reaps.
    #[must_use]
    pub fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    async fn drain_server(&self, mut server: Server) {
        match tasks::bounded(&self.cancel, self.destroy_timeout, self.destroy_machine(&server)).await {
            Ok(()) => {}
            Err(EngineError::Interrupted) => return,
            Err(e) => {
                tracing::warn!(
                    server = %server.name,
                    error = %e,
                    "Failed to destroy errored server"
                );
                server.error = Some(format!("reaper: {e}"));
            }
        }

        server.stopped = Some(Utc::now());
        lifecycle::settle(self.store.as_ref(), &mut server, ServerState::Stopped);
        if server.state != ServerState::Stopped {
            return;
        }

        if let Err(e) = self.remote.release(&server).await {
            tracing::warn!(server = %server.name, error = %e, "Failed to release remote state");
        }
        tracing::info!(server = %server.name, "Reaped errored server");
    }

    async fn destroy_machine(&self, server: &Server) -> Result<()> {
        if server.is_provisioned() {
            return destroy_instance(self.provider.as_ref(), server).await;
        }

        match self.provider.find(&server.name).await? {
            Some(instance) => {
                tracing::warn!(
                    server = %server.name,
                    id = %instance.id,
                    "Destroying unrecorded machine"
                );
                destroy(self.provider.as_ref(), &instance).await
            }
            None => Ok(()),
        }
    }
}
