//! Detects machines that stopped answering on their control port.
//!
//! A zombie is a server the store believes is alive but whose machine no
//! longer accepts connections. Zombies are retired to `shutdown` so the
//! collector destroys whatever is left of them.

use std::sync::Arc;

use chrono::Utc;
use fleetscale_remote::RemoteError;
use fleetscale_store::{Server, ServerState, Store};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::ZombieConfig;
use crate::error::{EngineError, Result};
use crate::lifecycle::{self, age_at_least};
use crate::tasks::{self, Fanout};

/// Retires servers whose control port refuses connections.
#[derive(Clone)]
pub struct ZombieDetector {
    store: Arc<dyn Store>,
    cancel: CancellationToken,
    config: ZombieConfig,
    fanout: Fanout,
}

impl ZombieDetector {
    /// Create a zombie detector.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        cancel: CancellationToken,
        config: ZombieConfig,
        limit: usize,
    ) -> Self {
        Self {
            store,
            cancel,
            config,
            fanout: Fanout::new("zombie", limit),
        }
    }

    /// Start dialing every provisioned, live server.
    ///
    /// Servers still `pending`, already being torn down, or owned by the
    /// reaper are skipped. Returns the number of servers dialed.
    ///
    /// # Errors
    ///
    /// Returns an error if the servers cannot be listed.
    pub fn detect(&self) -> Result<usize> {
        let candidates: Vec<Server> = self
            .store
            .list()?
            .into_iter()
            .filter(|s| lifecycle::is_valid_transition(s.state, ServerState::Shutdown))
            .filter(|s| s.address.as_deref().is_some_and(|a| !a.is_empty()))
            .filter(|s| !self.fanout.is_active(&s.name))
            .collect();
        let count = candidates.len();

        for server in candidates {
            let this = self.clone();
            self.fanout
                .spawn(server.name.clone(), async move { this.check(server).await });
        }

        Ok(count)
    }

    /// In-flight dials.
    #[must_use]
    pub fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    async fn check(&self, server: Server) {
        let Some(address) = server.address.as_deref() else {
            return;
        };
        let target = socket_addr(address, self.config.port);

        match tasks::bounded(&self.cancel, self.config.dial_timeout, dial(&target)).await {
            Ok(()) | Err(EngineError::Interrupted) => return,
            Err(e) => {
                tracing::debug!(server = %server.name, target = %target, error = %e, "Dial failed");
            }
        }

        if !age_at_least(server.created, Utc::now(), self.config.min_age) {
            tracing::debug!(server = %server.name, "Unreachable server is too young to retire");
            return;
        }

        let mut current = match self.store.find(&server.name) {
            Ok(Some(current)) if current.state == server.state => current,
            Ok(_) => return,
            Err(e) => {
                tracing::error!(server = %server.name, error = %e, "Failed to reload server");
                return;
            }
        };

        tracing::warn!(
            server = %current.name,
            state = %current.state,
            target = %target,
            "Retiring zombie server"
        );
        lifecycle::settle(self.store.as_ref(), &mut current, ServerState::Shutdown);
    }
}

async fn dial(target: &str) -> Result<()> {
    TcpStream::connect(target)
        .await
        .map(drop)
        .map_err(|e| {
            EngineError::Remote(RemoteError::Connect {
                target: target.to_string(),
                message: e.to_string(),
            })
        })
}

fn socket_addr(address: &str, port: u16) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{address}]:{port}")
    } else {
        format!("{address}:{port}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::test_support::{seed, store};
    use tokio::net::TcpListener;

    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        port
    }

    fn detector(store: Arc<dyn Store>, port: u16, min_age: Duration) -> ZombieDetector {
        ZombieDetector::new(
            store,
            CancellationToken::new(),
            ZombieConfig {
                port,
                dial_timeout: Duration::from_secs(2),
                min_age,
                ..ZombieConfig::default()
            },
            0,
        )
    }

    fn with_address(store: &dyn Store, state: ServerState, age: chrono::Duration) -> Server {
        let mut server = seed(store, state);
        server.address = Some("127.0.0.1".into());
        server.created = Utc::now() - age;
        store.update(&mut server).unwrap();
        server
    }

    #[tokio::test]
    async fn young_zombie_is_spared_until_old_enough() {
        let (_dir, store) = store();
        let port = closed_port().await;
        let mut server = with_address(store.as_ref(), ServerState::Running, chrono::Duration::minutes(5));

        let zombie = detector(store.clone(), port, Duration::from_secs(3600));
        assert_eq!(zombie.detect().unwrap(), 1);
        zombie.fanout().drain().await;
        assert_eq!(store.find(&server.name).unwrap().unwrap().state, ServerState::Running);

        server.created = Utc::now() - chrono::Duration::hours(2);
        store.update(&mut server).unwrap();

        zombie.detect().unwrap();
        zombie.fanout().drain().await;
        assert_eq!(store.find(&server.name).unwrap().unwrap().state, ServerState::Shutdown);
    }

    #[tokio::test]
    async fn live_machine_is_not_a_zombie() {
        let (_dir, store) = store();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = with_address(store.as_ref(), ServerState::Running, chrono::Duration::hours(2));

        let zombie = detector(store.clone(), port, Duration::ZERO);
        zombie.detect().unwrap();
        zombie.fanout().drain().await;

        assert_eq!(store.find(&server.name).unwrap().unwrap().state, ServerState::Running);
        drop(listener);
    }

    #[tokio::test]
    async fn excluded_states_are_never_dialed() {
        let (_dir, store) = store();
        let port = closed_port().await;
        for state in [
            ServerState::Pending,
            ServerState::Shutdown,
            ServerState::Stopping,
            ServerState::Error,
            ServerState::Stopped,
        ] {
            with_address(store.as_ref(), state, chrono::Duration::hours(2));
        }
        // No address yet.
        seed(store.as_ref(), ServerState::Created);

        let zombie = detector(store.clone(), port, Duration::ZERO);
        assert_eq!(zombie.detect().unwrap(), 0);
    }

    #[test]
    fn ipv6_addresses_are_bracketed() {
        assert_eq!(socket_addr("10.0.0.1", 2376), "10.0.0.1:2376");
        assert_eq!(socket_addr("2001:db8::1", 2376), "[2001:db8::1]:2376");
    }
}
