//! Pool sizing.
//!
//! Once per cycle the planner compares the work waiting in the CI queue with
//! the capacity of the live pool and either records new `pending` servers or
//! retires idle ones to `shutdown`. It never talks to a provider; the
//! allocator and collector act on what it writes.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use fleetscale_core::{generate_secret, ProviderKind, ServerName};
use fleetscale_store::{Server, ServerState, Store};

use crate::config::{PoolConfig, Selector};
use crate::error::Result;
use crate::lifecycle::{self, age_at_least};
use crate::queue::{QueueClient, Stage, STATUS_PENDING, STATUS_RUNNING};

/// Number of servers to add (positive) or remove (negative) so that
/// `pending` stages fit into `free` slots with `cap` slots per server.
///
/// Rounds toward positive infinity: a partly filled server still counts as
/// one more machine needed.
#[must_use]
pub const fn server_diff(pending: i64, free: i64, cap: i64) -> i64 {
    let need = pending - free;
    let quotient = need / cap;
    if need % cap > 0 {
        quotient + 1
    } else {
        quotient
    }
}

/// Clamp `additions` so that `count + result` never exceeds `ceiling`.
#[must_use]
pub fn server_ceil(count: i64, additions: i64, ceiling: i64) -> i64 {
    additions.min(ceiling - count).max(0)
}

/// Clamp `deletions` so that `count - result` never drops below `floor`.
#[must_use]
pub fn server_floor(count: i64, deletions: i64, floor: i64) -> i64 {
    if deletions == 0 {
        return 0;
    }
    deletions.min(count - floor).max(0)
}

/// What a planning cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOutcome {
    /// The pool is the right size.
    Unchanged,
    /// New `pending` servers were recorded.
    Added(Vec<ServerName>),
    /// Idle servers were moved to `shutdown`.
    Retired(Vec<ServerName>),
}

/// Sizes the pool against the CI queue.
#[derive(Clone)]
pub struct Planner {
    store: Arc<dyn Store>,
    queue: Arc<dyn QueueClient>,
    config: PoolConfig,
    provider: ProviderKind,
}

impl Planner {
    /// Create a planner recording servers for the given provider.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        queue: Arc<dyn QueueClient>,
        config: PoolConfig,
        provider: ProviderKind,
    ) -> Self {
        Self {
            store,
            queue,
            config,
            provider,
        }
    }

    /// Run one planning cycle.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue cannot be read or a store write fails.
    /// Nothing is retried within the cycle.
    pub async fn plan(&self) -> Result<PlanOutcome> {
        let stages = self.queue.queue().await?;
        let demand = Demand::count(&self.config.selector, &stages);

        let mut live: Vec<Server> = self
            .store
            .list()?
            .into_iter()
            .filter(|s| lifecycle::counts_toward_pool(s.state))
            .collect();

        for server in &mut live {
            if demand.busy.contains(server.name.as_str()) {
                self.store.busy(server)?;
            }
        }

        let capacity: i64 = live.iter().map(|s| i64::from(s.capacity)).sum();
        let servers = i64::try_from(live.len()).unwrap_or(i64::MAX);
        let cap = i64::from(self.config.capacity);
        let buffer = i64::from(self.config.buffer);
        let existing = i64::from(self.config.existing);

        let free = (capacity - demand.running - buffer).max(0);
        let pending = (demand.pending - existing).max(0);
        let diff = server_diff(pending, free, cap);

        tracing::debug!(
            pending,
            running = demand.running,
            capacity,
            servers,
            free,
            diff,
            "Computed pool demand"
        );

        if diff < 0 {
            let n = server_floor(servers, -diff, i64::from(self.config.min));
            self.retire(live, &demand.busy, usize::try_from(n).unwrap_or(0))
        } else if diff > 0 {
            let n = server_ceil(servers, diff, i64::from(self.config.max));
            self.add(usize::try_from(n).unwrap_or(0))
        } else {
            Ok(PlanOutcome::Unchanged)
        }
    }

    fn retire(
        &self,
        live: Vec<Server>,
        busy: &HashSet<String>,
        n: usize,
    ) -> Result<PlanOutcome> {
        if n == 0 {
            return Ok(PlanOutcome::Unchanged);
        }

        let now = Utc::now();
        let mut idle: Vec<Server> = live
            .into_iter()
            .filter(|s| s.state == ServerState::Running)
            .filter(|s| !busy.contains(s.name.as_str()))
            .filter(|s| age_at_least(s.created, now, self.config.min_age))
            .filter(|s| age_at_least(s.updated, now, self.config.idle_time))
            .collect();

        if idle.is_empty() {
            tracing::debug!(wanted = n, "No idle servers to retire");
            return Ok(PlanOutcome::Unchanged);
        }

        // Oldest machines go first.
        idle.sort_by_key(|s| s.created);

        let mut retired = Vec::with_capacity(n);
        for mut server in idle.into_iter().take(n) {
            if !lifecycle::claim(self.store.as_ref(), &mut server, ServerState::Shutdown)? {
                continue;
            }
            tracing::info!(server = %server.name, created = %server.created, "Retiring idle server");
            retired.push(server.name);
        }

        Ok(PlanOutcome::Retired(retired))
    }

    fn add(&self, n: usize) -> Result<PlanOutcome> {
        if n == 0 {
            return Ok(PlanOutcome::Unchanged);
        }

        let mut added = Vec::with_capacity(n);
        for _ in 0..n {
            let mut server = Server::new_pending(
                ServerName::generate(),
                self.provider,
                self.config.capacity,
                generate_secret(),
            );
            self.store.create(&mut server)?;
            tracing::info!(server = %server.name, "Recorded pending server");
            added.push(server.name);
        }

        Ok(PlanOutcome::Added(added))
    }
}

/// Matched queue entries, split by status.
#[derive(Debug, Default)]
struct Demand {
    pending: i64,
    running: i64,
    busy: HashSet<String>,
}

impl Demand {
    fn count(selector: &Selector, stages: &[Stage]) -> Self {
        let mut demand = Self::default();
        for stage in stages.iter().filter(|s| matches_selector(selector, s)) {
            match stage.status.as_str() {
                STATUS_PENDING => demand.pending += 1,
                STATUS_RUNNING => {
                    demand.running += 1;
                    if !stage.machine.is_empty() {
                        demand.busy.insert(stage.machine.clone());
                    }
                }
                _ => {}
            }
        }
        demand
    }
}

fn matches_selector(selector: &Selector, stage: &Stage) -> bool {
    stage.os == selector.os
        && stage.arch == selector.arch
        && stage.kernel == selector.kernel
        && stage.variant == selector.version
        && stage.labels == selector.labels
}
