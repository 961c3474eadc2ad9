//! Liveness pings for `running` servers.

use std::sync::Arc;

use chrono::Utc;
use fleetscale_remote::RemoteExecFactory;
use fleetscale_store::{Server, ServerState, Store};
use tokio_util::sync::CancellationToken;

use crate::config::PingerConfig;
use crate::error::{EngineError, Result};
use crate::lifecycle;
use crate::tasks::{self, Fanout};

/// Flags `running` servers whose Docker daemon stops answering.
#[derive(Clone)]
pub struct Pinger {
    store: Arc<dyn Store>,
    remote: Arc<dyn RemoteExecFactory>,
    cancel: CancellationToken,
    config: PingerConfig,
    fanout: Fanout,
}

impl Pinger {
    /// Create a pinger.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        remote: Arc<dyn RemoteExecFactory>,
        cancel: CancellationToken,
        config: PingerConfig,
        limit: usize,
    ) -> Self {
        Self {
            store,
            remote,
            cancel,
            config,
            fanout: Fanout::new("pinger", limit),
        }
    }

    /// Start probing every `running` server not already being pinged.
    ///
    /// Returns the number of servers pinged.
    ///
    /// # Errors
    ///
    /// Returns an error if the servers cannot be listed.
    pub fn ping(&self) -> Result<usize> {
        let servers: Vec<Server> = self
            .store
            .list_state(ServerState::Running)?
            .into_iter()
            .filter(|s| !self.fanout.is_active(&s.name))
            .collect();
        let count = servers.len();

        for server in servers {
            let this = self.clone();
            self.fanout
                .spawn(server.name.clone(), async move { this.check(server).await });
        }

        Ok(count)
    }

    /// In-flight pings.
    #[must_use]
    pub fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    async fn check(&self, server: Server) {
        let mut last_error = None;

        for attempt in 1..=self.config.attempts {
            match tasks::bounded(&self.cancel, self.config.timeout, self.ping_once(&server)).await {
                Ok(()) | Err(EngineError::Interrupted) => return,
                Err(e) => {
                    tracing::debug!(server = %server.name, attempt, error = %e, "Ping failed");
                    last_error = Some(e);
                }
            }
            if attempt < self.config.attempts
                && tasks::pause(&self.cancel, self.config.pause).await.is_err()
            {
                return;
            }
        }

        let Some(error) = last_error else {
            return;
        };

        // The server may have moved on while we were probing.
        let mut current = match self.store.find(&server.name) {
            Ok(Some(current)) if current.state == ServerState::Running => current,
            Ok(_) => {
                tracing::debug!(server = %server.name, "Server changed state during ping");
                return;
            }
            Err(e) => {
                tracing::error!(server = %server.name, error = %e, "Failed to reload server");
                return;
            }
        };

        tracing::warn!(server = %current.name, error = %error, "Server unreachable");
        current.error = Some(format!("unreachable: {error}"));
        current.stopped = Some(Utc::now());
        lifecycle::settle(self.store.as_ref(), &mut current, ServerState::Error);
    }

    async fn ping_once(&self, server: &Server) -> Result<()> {
        let remote = self.remote.connect(server).await?;
        remote.ping().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::test_support::{seed, store};
    use fleetscale_remote::MockRemoteFactory;

    fn pinger(store: Arc<dyn Store>, remote: &MockRemoteFactory) -> Pinger {
        Pinger::new(
            store,
            Arc::new(remote.clone()),
            CancellationToken::new(),
            PingerConfig {
                enabled: true,
                attempts: 3,
                timeout: Duration::from_secs(1),
                pause: Duration::from_millis(5),
                ..PingerConfig::default()
            },
            0,
        )
    }

    #[tokio::test]
    async fn healthy_server_is_left_alone() {
        let (_dir, store) = store();
        let remote = MockRemoteFactory::new();
        let server = seed(store.as_ref(), ServerState::Running);

        let pinger = pinger(store.clone(), &remote);
        assert_eq!(pinger.ping().unwrap(), 1);
        pinger.fanout().drain().await;

        assert_eq!(store.find(&server.name).unwrap().unwrap().state, ServerState::Running);
        assert_eq!(remote.ping_count(), 1);
    }

    #[tokio::test]
    async fn unreachable_server_is_flagged_after_all_attempts() {
        let (_dir, store) = store();
        let remote = MockRemoteFactory::new();
        let server = seed(store.as_ref(), ServerState::Running);
        remote.set_unreachable(&server.name);

        let pinger = pinger(store.clone(), &remote);
        pinger.ping().unwrap();
        pinger.fanout().drain().await;

        let stored = store.find(&server.name).unwrap().unwrap();
        assert_eq!(stored.state, ServerState::Error);
        assert!(stored.error.unwrap().starts_with("unreachable"));
        assert!(stored.stopped.is_some());
        assert_eq!(remote.ping_count(), 3);
    }

    #[tokio::test]
    async fn server_that_moved_on_is_not_flagged() {
        let (_dir, store) = store();
        let remote = MockRemoteFactory::new();
        let mut server = seed(store.as_ref(), ServerState::Running);
        remote.set_unreachable(&server.name);

        let pinger = pinger(store.clone(), &remote);
        pinger.ping().unwrap();
        // Retired while the pings are in flight.
        server.state = ServerState::Shutdown;
        store.update(&mut server).unwrap();
        pinger.fanout().drain().await;

        assert_eq!(store.find(&server.name).unwrap().unwrap().state, ServerState::Shutdown);
    }
}
