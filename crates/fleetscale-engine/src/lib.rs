//! Reconciliation engine for fleetscale.
//!
//! This crate sizes a pool of build-agent machines against a CI queue and
//! drives every machine through its lifecycle. Each reconciler owns one
//! source state, claims servers from it with a synchronous store write and
//! finishes the slow remote work in the background.
//!
//! # Architecture
//!
//! ```text
//!                  ┌────────────┐
//!    CI queue ───▶ │  Planner   │ ── pending / shutdown ──┐
//!                  └────────────┘                         │
//!                                                         ▼
//! ┌───────────┐  ┌───────────┐  ┌───────────┐  ┌─────────────────────┐
//! │ Allocator │  │ Installer │  │ Collector │  │ Store (RocksDB)     │
//! │  pending  │  │  created  │  │ shutdown  │  │ one record / server │
//! └───────────┘  └───────────┘  └───────────┘  └─────────────────────┘
//!       │              │              │
//!       ▼              ▼              ▼
//!   Provider      RemoteExec     Provider + RemoteExec
//!
//!  Reaper (error) · Pinger (running) · Zombie detector (live, provisioned)
//! ```
//!
//! The [`Engine`] runs each reconciler on its own interval, repairs servers
//! interrupted by a restart, and exposes the planner pause switch.
//!
//! # Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use fleetscale_engine::{Engine, EngineConfig, HttpQueueClient};
//! use fleetscale_provider::{HetznerConfig, HetznerProvider};
//! use fleetscale_remote::DockerFactory;
//! use fleetscale_store::RocksStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::from_env();
//! let store = Arc::new(RocksStore::open(&config.data_dir)?);
//! let provider = Arc::new(HetznerProvider::new(HetznerConfig::from_env()?)?);
//! let remote = Arc::new(DockerFactory::new(&config.cert_dir));
//! let queue = Arc::new(HttpQueueClient::new(&config.queue.server, &config.queue.token)?);
//!
//! let engine = Arc::new(Engine::new(config, store, provider, remote, queue));
//! engine.start()?;
//! // ...
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod allocator;
pub mod api;
pub mod collector;
pub mod config;
pub mod engine;
pub mod error;
pub mod installer;
pub mod lifecycle;
pub mod pinger;
pub mod planner;
pub mod queue;
pub mod reaper;
pub mod tasks;
pub mod zombie;

pub use allocator::Allocator;
pub use collector::Collector;
pub use config::EngineConfig;
pub use engine::{Engine, RecoveryReport, Sweep};
pub use error::{EngineError, Result};
pub use installer::Installer;
pub use pinger::Pinger;
pub use planner::{PlanOutcome, Planner};
pub use queue::{HttpQueueClient, QueueClient, Stage};
pub use reaper::Reaper;
pub use zombie::ZombieDetector;

#[cfg(any(test, feature = "test-utils"))]
pub use queue::MockQueue;

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use fleetscale_core::{generate_secret, ProviderKind, ServerName};
    use fleetscale_provider::{CreateOpts, Provider};
    use fleetscale_remote::certs;
    use fleetscale_store::{RocksStore, Server, ServerState, Store};

    pub fn store() -> (tempfile::TempDir, Arc<RocksStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RocksStore::open(dir.path()).unwrap());
        (dir, store)
    }

    /// Insert a fresh server in `state`.
    pub fn seed(store: &dyn Store, state: ServerState) -> Server {
        let mut server =
            Server::new_pending(ServerName::generate(), ProviderKind::Mock, 2, generate_secret());
        server.state = state;
        store.create(&mut server).unwrap();
        server
    }

    /// Insert a server in `state` backed by an instance on `provider`.
    pub async fn seed_provisioned(
        store: &dyn Store,
        provider: &dyn Provider,
        state: ServerState,
    ) -> Server {
        let mut server = seed(store, ServerState::Pending);
        let tls = certs::generate(&server.name).unwrap();
        let instance = provider
            .create(&CreateOpts {
                name: server.name.clone(),
                tls: tls.clone(),
            })
            .await
            .unwrap();
        server.apply_instance(&instance);
        server.tls = Some(tls);
        server.state = state;
        store.update(&mut server).unwrap();
        server
    }
}
