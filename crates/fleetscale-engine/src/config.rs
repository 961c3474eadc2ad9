//! Engine configuration.
//!
//! Every setting has a default and can be overridden from a `FLEETSCALE_`
//! environment variable. Durations are given in whole seconds. Values that
//! fail to parse are ignored and the default is kept.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{EngineError, Result};

const PREFIX: &str = "FLEETSCALE_";

/// Which queue entries the pool serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selector {
    /// Operating system, e.g. `linux`.
    pub os: String,
    /// Architecture, e.g. `amd64`.
    pub arch: String,
    /// OS variant or version.
    pub version: String,
    /// Kernel.
    pub kernel: String,
    /// Labels a stage must carry, exactly.
    pub labels: HashMap<String, String>,
}

impl Default for Selector {
    fn default() -> Self {
        Self {
            os: "linux".to_string(),
            arch: "amd64".to_string(),
            version: String::new(),
            kernel: String::new(),
            labels: HashMap::new(),
        }
    }
}

/// Pool sizing policy used by the planner.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Minimum number of live servers.
    pub min: u32,
    /// Maximum number of live servers.
    pub max: u32,
    /// Spare capacity to keep warm.
    pub buffer: u32,
    /// Concurrent builds per server.
    pub capacity: u32,
    /// Minimum server age before it may be retired.
    pub min_age: Duration,
    /// Minimum idle time before a server may be retired.
    pub idle_time: Duration,
    /// Capacity served by machines outside this pool.
    pub existing: u32,
    /// Which queue entries count.
    pub selector: Selector,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min: 0,
            max: 4,
            buffer: 0,
            capacity: 2,
            min_age: Duration::from_secs(3600),
            idle_time: Duration::from_secs(600),
            existing: 0,
            selector: Selector::default(),
        }
    }
}

/// An optional helper container started next to the agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarConfig {
    /// Image to run.
    pub image: String,
    /// How often the sidecar does its work.
    pub interval: Duration,
}

/// What the installer puts on a machine.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Agent image.
    pub image: String,
    /// Protocol of the CI server RPC endpoint.
    pub rpc_proto: String,
    /// Host of the CI server RPC endpoint.
    pub rpc_host: String,
    /// Shared RPC secret; falls back to the server's own secret when empty.
    pub rpc_secret: String,
    /// Extra `KEY=VALUE` environment for the agent.
    pub env: Vec<String>,
    /// Extra volume binds for the agent.
    pub volumes: Vec<String>,
    /// Garbage collector sidecar.
    pub gc: Option<SidecarConfig>,
    /// Auto-update sidecar.
    pub watchtower: Option<SidecarConfig>,
    /// Pause between connectivity checks.
    pub retry_interval: Duration,
    /// Deadline for the whole installation.
    pub timeout: Duration,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            image: "drone/drone-runner-docker:1".to_string(),
            rpc_proto: "https".to_string(),
            rpc_host: String::new(),
            rpc_secret: String::new(),
            env: Vec::new(),
            volumes: Vec::new(),
            gc: None,
            watchtower: None,
            retry_interval: Duration::from_secs(60),
            timeout: Duration::from_secs(3600),
        }
    }
}

/// Reaper settings.
#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// Whether the reaper runs.
    pub enabled: bool,
    /// Time between sweeps.
    pub interval: Duration,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(3600),
        }
    }
}

/// Pinger settings.
#[derive(Debug, Clone)]
pub struct PingerConfig {
    /// Whether the pinger runs.
    pub enabled: bool,
    /// Time between sweeps.
    pub interval: Duration,
    /// Probes per server before it is flagged.
    pub attempts: u32,
    /// Deadline of a single ping.
    pub timeout: Duration,
    /// Pause between pings.
    pub pause: Duration,
}

impl Default for PingerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: Duration::from_secs(600),
            attempts: 5,
            timeout: Duration::from_secs(60),
            pause: Duration::from_secs(5),
        }
    }
}

/// Zombie detector settings.
#[derive(Debug, Clone)]
pub struct ZombieConfig {
    /// Whether the detector runs.
    pub enabled: bool,
    /// Time between sweeps.
    pub interval: Duration,
    /// Control port dialed on each machine.
    pub port: u16,
    /// Dial timeout.
    pub dial_timeout: Duration,
    /// Machines younger than this are never flagged.
    pub min_age: Duration,
}

impl Default for ZombieConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: Duration::from_secs(600),
            port: 2376,
            dial_timeout: Duration::from_secs(10),
            min_age: Duration::from_secs(3600),
        }
    }
}

/// Where the CI queue lives.
#[derive(Clone, Default)]
pub struct QueueConfig {
    /// Base URL of the CI server.
    pub server: String,
    /// API token.
    pub token: String,
}

impl std::fmt::Debug for QueueConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueConfig")
            .field("server", &self.server)
            .finish_non_exhaustive()
    }
}

/// Configuration for the whole engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Pool sizing.
    pub pool: PoolConfig,
    /// Agent installation.
    pub agent: AgentConfig,
    /// Reaper.
    pub reaper: ReaperConfig,
    /// Pinger.
    pub pinger: PingerConfig,
    /// Zombie detector.
    pub zombie: ZombieConfig,
    /// CI queue.
    pub queue: QueueConfig,
    /// Time between allocate, install and collect sweeps.
    pub reconcile_interval: Duration,
    /// Time between planner runs.
    pub plan_interval: Duration,
    /// Time between purge sweeps.
    pub purge_interval: Duration,
    /// How long stopped servers are kept.
    pub purge_retention: Duration,
    /// Deadline for a provider create.
    pub create_timeout: Duration,
    /// Deadline for a provider destroy.
    pub destroy_timeout: Duration,
    /// Grace period for stopping the agent during teardown.
    pub stop_timeout: Duration,
    /// Maximum in-flight tasks per reconciler; 0 means unbounded.
    pub concurrency_limit: usize,
    /// Where per-machine client certificates are staged.
    pub cert_dir: PathBuf,
    /// `RocksDB` directory.
    pub data_dir: PathBuf,
    /// Admin API listen address.
    pub listen_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool: PoolConfig::default(),
            agent: AgentConfig::default(),
            reaper: ReaperConfig::default(),
            pinger: PingerConfig::default(),
            zombie: ZombieConfig::default(),
            queue: QueueConfig::default(),
            reconcile_interval: Duration::from_secs(10),
            plan_interval: Duration::from_secs(60),
            purge_interval: Duration::from_secs(24 * 3600),
            purge_retention: Duration::from_secs(24 * 3600),
            create_timeout: Duration::from_secs(3600),
            destroy_timeout: Duration::from_secs(3600),
            stop_timeout: Duration::from_secs(3600),
            concurrency_limit: 0,
            cert_dir: PathBuf::from("/data/certs"),
            data_dir: PathBuf::from("/data/db"),
            listen_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Pool: `POOL_MIN`, `POOL_MAX`, `POOL_BUFFER`, `POOL_MIN_AGE`,
    /// `POOL_IDLE_TIME`, `AGENT_CAPACITY`, `EXISTING_CAPACITY`.
    /// Selector: `AGENT_OS`, `AGENT_ARCH`, `AGENT_VERSION`, `AGENT_KERNEL`,
    /// `AGENT_LABELS` (`k=v,k=v`).
    /// Agent: `AGENT_IMAGE`, `RPC_PROTO`, `RPC_HOST`, `RPC_SECRET`,
    /// `AGENT_ENV`, `AGENT_VOLUMES`, `INSTALL_RETRY_INTERVAL`,
    /// `INSTALL_TIMEOUT`, `GC_ENABLED`, `GC_IMAGE`, `GC_INTERVAL`,
    /// `WATCHTOWER_ENABLED`, `WATCHTOWER_IMAGE`, `WATCHTOWER_INTERVAL`.
    /// Loops: `PLAN_INTERVAL`, `RECONCILE_INTERVAL`, `REAPER_ENABLED`,
    /// `REAPER_INTERVAL`, `PINGER_ENABLED`, `PINGER_INTERVAL`,
    /// `PINGER_ATTEMPTS`, `PINGER_TIMEOUT`, `ZOMBIE_ENABLED`,
    /// `ZOMBIE_INTERVAL`, `ZOMBIE_MIN_AGE`, `ZOMBIE_PORT`,
    /// `ZOMBIE_DIAL_TIMEOUT`, `PURGE_RETENTION`, `CONCURRENCY_LIMIT`.
    /// Timeouts: `CREATE_TIMEOUT`, `DESTROY_TIMEOUT`, `STOP_TIMEOUT`.
    /// Process: `CERT_DIR`, `DATA_DIR`, `LISTEN_ADDR`.
    ///
    /// All of the above take the `FLEETSCALE_` prefix. The queue is read from
    /// the unprefixed `DRONE_SERVER` and `DRONE_TOKEN`.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        let pool = &mut config.pool;
        set(&mut pool.min, "POOL_MIN");
        set(&mut pool.max, "POOL_MAX");
        set(&mut pool.buffer, "POOL_BUFFER");
        set_secs(&mut pool.min_age, "POOL_MIN_AGE");
        set_secs(&mut pool.idle_time, "POOL_IDLE_TIME");
        set(&mut pool.capacity, "AGENT_CAPACITY");
        set(&mut pool.existing, "EXISTING_CAPACITY");
        set(&mut pool.selector.os, "AGENT_OS");
        set(&mut pool.selector.arch, "AGENT_ARCH");
        set(&mut pool.selector.version, "AGENT_VERSION");
        set(&mut pool.selector.kernel, "AGENT_KERNEL");
        if let Some(raw) = var("AGENT_LABELS") {
            pool.selector.labels = parse_labels(&raw);
        }

        let agent = &mut config.agent;
        set(&mut agent.image, "AGENT_IMAGE");
        set(&mut agent.rpc_proto, "RPC_PROTO");
        set(&mut agent.rpc_host, "RPC_HOST");
        set(&mut agent.rpc_secret, "RPC_SECRET");
        if let Some(raw) = var("AGENT_ENV") {
            agent.env = parse_list(&raw);
        }
        if let Some(raw) = var("AGENT_VOLUMES") {
            agent.volumes = parse_list(&raw);
        }
        set_secs(&mut agent.retry_interval, "INSTALL_RETRY_INTERVAL");
        set_secs(&mut agent.timeout, "INSTALL_TIMEOUT");
        agent.gc = sidecar("GC", "drone/gc", Duration::from_secs(3600));
        agent.watchtower = sidecar(
            "WATCHTOWER",
            "containrrr/watchtower",
            Duration::from_secs(300),
        );

        set(&mut config.reaper.enabled, "REAPER_ENABLED");
        set_secs(&mut config.reaper.interval, "REAPER_INTERVAL");

        let pinger = &mut config.pinger;
        set(&mut pinger.enabled, "PINGER_ENABLED");
        set_secs(&mut pinger.interval, "PINGER_INTERVAL");
        set(&mut pinger.attempts, "PINGER_ATTEMPTS");
        set_secs(&mut pinger.timeout, "PINGER_TIMEOUT");

        let zombie = &mut config.zombie;
        set(&mut zombie.enabled, "ZOMBIE_ENABLED");
        set_secs(&mut zombie.interval, "ZOMBIE_INTERVAL");
        set_secs(&mut zombie.min_age, "ZOMBIE_MIN_AGE");
        set(&mut zombie.port, "ZOMBIE_PORT");
        set_secs(&mut zombie.dial_timeout, "ZOMBIE_DIAL_TIMEOUT");

        if let Ok(val) = std::env::var("DRONE_SERVER") {
            config.queue.server = val.trim_end_matches('/').to_string();
        }
        if let Ok(val) = std::env::var("DRONE_TOKEN") {
            config.queue.token = val;
        }

        set_secs(&mut config.reconcile_interval, "RECONCILE_INTERVAL");
        set_secs(&mut config.plan_interval, "PLAN_INTERVAL");
        set_secs(&mut config.purge_retention, "PURGE_RETENTION");
        set_secs(&mut config.create_timeout, "CREATE_TIMEOUT");
        set_secs(&mut config.destroy_timeout, "DESTROY_TIMEOUT");
        set_secs(&mut config.stop_timeout, "STOP_TIMEOUT");
        set(&mut config.concurrency_limit, "CONCURRENCY_LIMIT");
        set(&mut config.cert_dir, "CERT_DIR");
        set(&mut config.data_dir, "DATA_DIR");
        set(&mut config.listen_addr, "LISTEN_ADDR");

        config
    }

    /// Check the configuration for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `EngineError::Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.pool.capacity == 0 {
            return Err(EngineError::Config("agent capacity must be at least 1".into()));
        }
        if self.pool.min > self.pool.max {
            return Err(EngineError::Config(format!(
                "pool min ({}) exceeds pool max ({})",
                self.pool.min, self.pool.max
            )));
        }
        if self.pinger.attempts == 0 {
            return Err(EngineError::Config("pinger attempts must be at least 1".into()));
        }
        for (name, interval) in [
            ("reconcile", self.reconcile_interval),
            ("plan", self.plan_interval),
            ("reaper", self.reaper.interval),
            ("pinger", self.pinger.interval),
            ("zombie", self.zombie.interval),
            ("purge", self.purge_interval),
        ] {
            if interval.is_zero() {
                return Err(EngineError::Config(format!("{name} interval must be positive")));
            }
        }
        Ok(())
    }
}

fn var(key: &str) -> Option<String> {
    std::env::var(format!("{PREFIX}{key}")).ok()
}

fn set<T: FromStr>(field: &mut T, key: &str) {
    if let Some(val) = var(key).and_then(|raw| raw.trim().parse().ok()) {
        *field = val;
    }
}

fn set_secs(field: &mut Duration, key: &str) {
    if let Some(secs) = var(key).and_then(|raw| raw.trim().parse::<u64>().ok()) {
        *field = Duration::from_secs(secs);
    }
}

fn sidecar(name: &str, image: &str, interval: Duration) -> Option<SidecarConfig> {
    let enabled = var(&format!("{name}_ENABLED"))
        .and_then(|raw| raw.trim().parse::<bool>().ok())
        .unwrap_or(false);
    if !enabled {
        return None;
    }
    let mut config = SidecarConfig {
        image: image.to_string(),
        interval,
    };
    set(&mut config.image, &format!("{name}_IMAGE"));
    set_secs(&mut config.interval, &format!("{name}_INTERVAL"));
    Some(config)
}

/// Parse a comma-separated list, dropping empty entries.
#[must_use]
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Parse `k=v,k=v` labels; entries without `=` are skipped.
#[must_use]
pub fn parse_labels(raw: &str) -> HashMap<String, String> {
    parse_list(raw)
        .into_iter()
        .filter_map(|entry| {
            entry
                .split_once('=')
                .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        })
        .collect()
}
