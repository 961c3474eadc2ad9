//! The orchestrator.
//!
//! [`Engine`] wires the reconcilers together and runs each on its own
//! interval until shutdown. Before the loops start it repairs servers left
//! in an intermediate state by a previous process.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use fleetscale_provider::Provider;
use fleetscale_remote::RemoteExecFactory;
use fleetscale_store::{ServerState, Store};
use parking_lot::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::allocator::Allocator;
use crate::collector::Collector;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::installer::Installer;
use crate::lifecycle;
use crate::pinger::Pinger;
use crate::planner::{PlanOutcome, Planner};
use crate::queue::QueueClient;
use crate::reaper::Reaper;
use crate::zombie::ZombieDetector;

/// Error message recorded on servers found in `creating` at startup.
pub const INTERRUPTED_CREATION: &str = "interrupted during creation";

/// The periodic jobs the engine runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sweep {
    /// Size the pool against the queue.
    Plan,
    /// Provision `pending` servers.
    Allocate,
    /// Install the agent on `created` servers.
    Install,
    /// Tear down `shutdown` servers.
    Collect,
    /// Drain `error` servers.
    Reap,
    /// Probe `running` servers.
    Ping,
    /// Retire unreachable servers.
    Zombie,
    /// Delete old `stopped` records.
    Purge,
}

impl Sweep {
    /// Every sweep, in the order the loops are started.
    pub const ALL: [Self; 8] = [
        Self::Plan,
        Self::Allocate,
        Self::Install,
        Self::Collect,
        Self::Reap,
        Self::Ping,
        Self::Zombie,
        Self::Purge,
    ];

    /// Lowercase name used in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Plan => "plan",
            Self::Allocate => "allocate",
            Self::Install => "install",
            Self::Collect => "collect",
            Self::Reap => "reap",
            Self::Ping => "ping",
            Self::Zombie => "zombie",
            Self::Purge => "purge",
        }
    }
}

impl fmt::Display for Sweep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Servers repaired by [`Engine::recover`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// `staging` servers reset to `created`.
    pub staging: usize,
    /// `stopping` servers reset to `shutdown`.
    pub stopping: usize,
    /// `creating` servers moved to `error`.
    pub creating: usize,
}

/// Runs every reconciler on its own loop.
pub struct Engine {
    store: Arc<dyn Store>,
    config: EngineConfig,
    planner: Planner,
    allocator: Allocator,
    installer: Installer,
    collector: Collector,
    reaper: Reaper,
    pinger: Pinger,
    zombie: ZombieDetector,
    paused: Mutex<bool>,
    cancel: CancellationToken,
    loops: TaskTracker,
}

impl Engine {
    /// Build an engine and its reconcilers.
    #[must_use]
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn Store>,
        provider: Arc<dyn Provider>,
        remote: Arc<dyn RemoteExecFactory>,
        queue: Arc<dyn QueueClient>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let limit = config.concurrency_limit;

        let planner = Planner::new(
            Arc::clone(&store),
            queue,
            config.pool.clone(),
            provider.kind(),
        );
        let allocator = Allocator::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            cancel.clone(),
            config.create_timeout,
            limit,
        );
        let installer = Installer::new(
            Arc::clone(&store),
            Arc::clone(&remote),
            cancel.clone(),
            config.agent.clone(),
            config.pool.selector.labels.clone(),
            limit,
        );
        let collector = Collector::new(
            Arc::clone(&store),
            Arc::clone(&provider),
            Arc::clone(&remote),
            cancel.clone(),
            config.destroy_timeout,
            config.stop_timeout,
            limit,
        );
        let reaper = Reaper::new(
            Arc::clone(&store),
            provider,
            Arc::clone(&remote),
            cancel.clone(),
            config.destroy_timeout,
            limit,
        );
        let pinger = Pinger::new(
            Arc::clone(&store),
            remote,
            cancel.clone(),
            config.pinger.clone(),
            limit,
        );
        let zombie = ZombieDetector::new(
            Arc::clone(&store),
            cancel.clone(),
            config.zombie.clone(),
            limit,
        );

        Self {
            store,
            config,
            planner,
            allocator,
            installer,
            collector,
            reaper,
            pinger,
            zombie,
            paused: Mutex::new(false),
            cancel,
            loops: TaskTracker::new(),
        }
    }

    /// Stop adding and retiring servers. In-flight work keeps draining.
    pub fn pause(&self) {
        *self.paused.lock() = true;
        tracing::info!("Planner paused");
    }

    /// Resume planning.
    pub fn resume(&self) {
        *self.paused.lock() = false;
        tracing::info!("Planner resumed");
    }

    /// Whether planning is paused.
    #[must_use]
    pub fn paused(&self) -> bool {
        *self.paused.lock()
    }

    /// Repair servers left mid-transition by a previous process.
    ///
    /// `staging` goes back to `created` and `stopping` back to `shutdown` so
    /// the installer and collector retry them. `creating` goes to `error`;
    /// the reaper looks the machine up by name and destroys it if the create
    /// went through.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be read or written.
    pub fn recover(&self) -> Result<RecoveryReport> {
        let store = self.store.as_ref();
        let mut report = RecoveryReport::default();

        for mut server in store.list_state(ServerState::Staging)? {
            if !lifecycle::claim(store, &mut server, ServerState::Created)? {
                continue;
            }
            tracing::info!(server = %server.name, "Reset interrupted installation");
            report.staging += 1;
        }

        for mut server in store.list_state(ServerState::Stopping)? {
            if !lifecycle::claim(store, &mut server, ServerState::Shutdown)? {
                continue;
            }
            tracing::info!(server = %server.name, "Reset interrupted teardown");
            report.stopping += 1;
        }

        for mut server in store.list_state(ServerState::Creating)? {
            server.error = Some(INTERRUPTED_CREATION.to_string());
            if !lifecycle::claim(store, &mut server, ServerState::Error)? {
                continue;
            }
            tracing::warn!(server = %server.name, "Creation interrupted; handing to reaper");
            report.creating += 1;
        }

        Ok(report)
    }

    /// Run crash recovery and start one loop per enabled sweep.
    ///
    /// # Errors
    ///
    /// Returns an error if recovery fails; no loops are started in that case.
    pub fn start(self: &Arc<Self>) -> Result<RecoveryReport> {
        let report = self.recover()?;
        tracing::info!(
            staging = report.staging,
            stopping = report.stopping,
            creating = report.creating,
            "Crash recovery complete"
        );

        for sweep in Sweep::ALL {
            let Some(every) = self.interval(sweep) else {
                tracing::debug!(sweep = %sweep, "Sweep disabled");
                continue;
            };
            let engine = Arc::clone(self);
            self.loops
                .spawn(async move { engine.run_loop(sweep, every).await });
        }

        Ok(report)
    }

    /// How often a sweep runs, or `None` if it is disabled.
    #[must_use]
    pub fn interval(&self, sweep: Sweep) -> Option<Duration> {
        let config = &self.config;
        match sweep {
            Sweep::Plan => Some(config.plan_interval),
            Sweep::Allocate | Sweep::Install | Sweep::Collect => Some(config.reconcile_interval),
            Sweep::Reap => config.reaper.enabled.then_some(config.reaper.interval),
            Sweep::Ping => config.pinger.enabled.then_some(config.pinger.interval),
            Sweep::Zombie => config.zombie.enabled.then_some(config.zombie.interval),
            Sweep::Purge => Some(config.purge_interval),
        }
    }

    async fn run_loop(&self, sweep: Sweep, every: Duration) {
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        tracing::debug!(sweep = %sweep, interval_secs = every.as_secs(), "Sweep loop started");

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = ticker.tick() => {
                    match self.run_once(sweep).await {
                        Ok(0) => {}
                        Ok(count) => tracing::debug!(sweep = %sweep, count, "Sweep finished"),
                        Err(EngineError::Interrupted) => break,
                        Err(e) => tracing::warn!(sweep = %sweep, error = %e, "Sweep failed"),
                    }
                }
            }
        }

        tracing::debug!(sweep = %sweep, "Sweep loop stopped");
    }

    /// Run one sweep now.
    ///
    /// Returns how many servers the sweep acted on. Background work started
    /// by the sweep may still be running; see [`Engine::drain`]. A plan
    /// sweep does nothing while the engine is paused.
    ///
    /// # Errors
    ///
    /// Returns the sweep-level error; per-server failures are recorded on
    /// the servers instead.
    pub async fn run_once(&self, sweep: Sweep) -> Result<usize> {
        match sweep {
            Sweep::Plan => {
                if self.paused() {
                    tracing::debug!("Planner paused; skipping");
                    return Ok(0);
                }
                Ok(match self.planner.plan().await? {
                    PlanOutcome::Unchanged => 0,
                    PlanOutcome::Added(names) | PlanOutcome::Retired(names) => names.len(),
                })
            }
            Sweep::Allocate => self.allocator.allocate(),
            Sweep::Install => self.installer.install(),
            Sweep::Collect => self.collector.collect(),
            Sweep::Reap => self.reaper.reap(),
            Sweep::Ping => self.pinger.ping(),
            Sweep::Zombie => self.zombie.detect(),
            Sweep::Purge => self.purge(),
        }
    }

    /// Delete `stopped` servers untouched for the retention period.
    ///
    /// # Errors
    ///
    /// Returns an error if the store fails.
    pub fn purge(&self) -> Result<usize> {
        let retention = chrono::Duration::from_std(self.config.purge_retention)
            .map_err(|e| EngineError::Config(format!("purge retention out of range: {e}")))?;
        let purged = self.store.purge(Utc::now() - retention)?;
        if purged > 0 {
            tracing::info!(purged, "Purged stopped servers");
        }
        Ok(purged)
    }

    /// Wait for every in-flight per-server task to finish.
    pub async fn drain(&self) {
        tokio::join!(
            self.allocator.fanout().drain(),
            self.installer.fanout().drain(),
            self.collector.fanout().drain(),
            self.reaper.fanout().drain(),
            self.pinger.fanout().drain(),
            self.zombie.fanout().drain(),
        );
    }

    /// Cancel every loop and in-flight task, then wait for them to exit.
    ///
    /// Servers interrupted mid-transition keep their intermediate state and
    /// are repaired by [`Engine::recover`] on the next start.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down engine");
        self.cancel.cancel();
        self.loops.close();
        self.loops.wait().await;
        self.drain().await;
        tracing::info!("Engine stopped");
    }

    /// Token cancelled on shutdown.
    #[must_use]
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The server store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// The engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::{MockQueue, Stage};
    use crate::test_support::{seed, store};
    use fleetscale_provider::MockProvider;
    use fleetscale_remote::MockRemoteFactory;

    fn engine(store: Arc<dyn Store>, queue: Arc<MockQueue>) -> Engine {
        Engine::new(
            EngineConfig::default(),
            store,
            Arc::new(MockProvider::new()),
            Arc::new(MockRemoteFactory::new()),
            queue,
        )
    }

    #[test]
    fn recovery_repairs_intermediate_states() {
        let (_dir, store) = store();
        let staging = seed(store.as_ref(), ServerState::Staging);
        let stopping = seed(store.as_ref(), ServerState::Stopping);
        let creating = seed(store.as_ref(), ServerState::Creating);
        let running = seed(store.as_ref(), ServerState::Running);

        let engine = engine(store.clone(), Arc::new(MockQueue::new()));
        let report = engine.recover().unwrap();

        assert_eq!(
            report,
            RecoveryReport {
                staging: 1,
                stopping: 1,
                creating: 1,
            }
        );
        assert_eq!(store.find(&staging.name).unwrap().unwrap().state, ServerState::Created);
        assert_eq!(store.find(&stopping.name).unwrap().unwrap().state, ServerState::Shutdown);
        let creating = store.find(&creating.name).unwrap().unwrap();
        assert_eq!(creating.state, ServerState::Error);
        assert_eq!(creating.error.as_deref(), Some(INTERRUPTED_CREATION));
        assert_eq!(store.find(&running.name).unwrap().unwrap().state, ServerState::Running);

        // A second pass finds nothing to do.
        assert_eq!(engine.recover().unwrap(), RecoveryReport::default());
    }

    #[tokio::test]
    async fn pause_skips_only_planning() {
        let (_dir, store) = store();
        let queue = Arc::new(MockQueue::new());
        let stage = Stage {
            status: "pending".into(),
            os: "linux".into(),
            arch: "amd64".into(),
            ..Stage::default()
        };
        queue.set_stages(vec![stage; 3]);
        let pending = seed(store.as_ref(), ServerState::Pending);

        let engine = engine(store.clone(), queue);
        engine.pause();
        assert!(engine.paused());

        assert_eq!(engine.run_once(Sweep::Plan).await.unwrap(), 0);
        assert_eq!(store.list().unwrap().len(), 1);

        // Allocation still drains existing work.
        assert_eq!(engine.run_once(Sweep::Allocate).await.unwrap(), 1);
        engine.drain().await;
        assert_eq!(store.find(&pending.name).unwrap().unwrap().state, ServerState::Created);

        engine.resume();
        assert!(!engine.paused());
        assert_eq!(engine.run_once(Sweep::Plan).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn purge_keeps_recent_records() {
        let (_dir, store) = store();
        let stopped = seed(store.as_ref(), ServerState::Stopped);

        let engine = engine(store.clone(), Arc::new(MockQueue::new()));
        assert_eq!(engine.run_once(Sweep::Purge).await.unwrap(), 0);
        assert!(store.find(&stopped.name).unwrap().is_some());
    }

    #[test]
    fn disabled_sweeps_have_no_interval() {
        let (_dir, store) = store();
        let engine = engine(store, Arc::new(MockQueue::new()));

        assert_eq!(engine.interval(Sweep::Allocate), Some(Duration::from_secs(10)));
        assert_eq!(engine.interval(Sweep::Ping), None);
        assert!(engine.interval(Sweep::Reap).is_some());
    }

    #[tokio::test]
    async fn start_and_shutdown() {
        let (_dir, store) = store();
        seed(store.as_ref(), ServerState::Staging);

        let engine = Arc::new(engine(store.clone(), Arc::new(MockQueue::new())));
        let report = engine.start().unwrap();
        assert_eq!(report.staging, 1);

        tokio::time::timeout(Duration::from_secs(10), engine.shutdown())
            .await
            .unwrap();
        assert!(engine.cancel_token().is_cancelled());
    }
}
