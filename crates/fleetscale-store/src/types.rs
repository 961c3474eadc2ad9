//! Domain types stored in the database.
//!
//! A [`Server`] is the durable unit of work: one record per machine the
//! control plane manages, from the moment the planner decides it is needed
//! until it is purged long after teardown.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use fleetscale_core::{Instance, ProviderKind, ServerName, TlsMaterial};
use serde::{Deserialize, Serialize};

/// A server record stored in the database.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Server {
    /// Unique name chosen by the planner.
    pub name: ServerName,
    /// Provider-assigned instance id, `None` until the instance is created.
    #[serde(default)]
    pub id: Option<String>,
    /// Hosting backend that owns the instance.
    pub provider: ProviderKind,
    /// Number of concurrent builds the machine runs.
    pub capacity: u32,
    /// Per-machine credential handed to the agent.
    pub secret: String,
    /// Reachable address of the machine.
    #[serde(default)]
    pub address: Option<String>,
    /// Region or location.
    #[serde(default)]
    pub region: Option<String>,
    /// Boot image.
    #[serde(default)]
    pub image: Option<String>,
    /// Machine size or type.
    #[serde(default)]
    pub size: Option<String>,
    /// Certificate material for the remote Docker daemon.
    #[serde(default)]
    pub tls: Option<TlsMaterial>,
    /// Current lifecycle state.
    pub state: ServerState,
    /// Last failure message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Creation timestamp, set by the store.
    pub created: DateTime<Utc>,
    /// Last modification timestamp, set by the store.
    pub updated: DateTime<Utc>,
    /// When the instance finished provisioning.
    #[serde(default)]
    pub started: Option<DateTime<Utc>>,
    /// When the instance was torn down.
    #[serde(default)]
    pub stopped: Option<DateTime<Utc>>,
    /// Last time a build was observed running on the machine.
    #[serde(default)]
    pub last_busy: Option<DateTime<Utc>>,
}

impl Server {
    /// Build a new `pending` server as the planner records it.
    ///
    /// Timestamps are placeholders until the store writes the record.
    #[must_use]
    pub fn new_pending(
        name: ServerName,
        provider: ProviderKind,
        capacity: u32,
        secret: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            name,
            id: None,
            provider,
            capacity,
            secret,
            address: None,
            region: None,
            image: None,
            size: None,
            tls: None,
            state: ServerState::Pending,
            error: None,
            created: now,
            updated: now,
            started: None,
            stopped: None,
            last_busy: None,
        }
    }

    /// Reconstruct the provider instance backing this server.
    ///
    /// Returns `None` when the server was never provisioned.
    #[must_use]
    pub fn instance(&self) -> Option<Instance> {
        let id = self.id.clone().filter(|id| !id.is_empty())?;
        Some(Instance {
            provider: self.provider,
            id,
            name: self.name.clone(),
            address: self.address.clone().unwrap_or_default(),
            region: self.region.clone().unwrap_or_default(),
            image: self.image.clone().unwrap_or_default(),
            size: self.size.clone().unwrap_or_default(),
        })
    }

    /// Copy the fields of a freshly created instance onto the record.
    pub fn apply_instance(&mut self, instance: &Instance) {
        self.provider = instance.provider;
        self.id = Some(instance.id.clone());
        self.address = Some(instance.address.clone());
        self.region = Some(instance.region.clone());
        self.image = Some(instance.image.clone());
        self.size = Some(instance.size.clone());
    }

    /// Whether a remote instance exists that would need destroying.
    #[must_use]
    pub fn is_provisioned(&self) -> bool {
        self.id.as_deref().is_some_and(|id| !id.is_empty())
    }
}

/// Lifecycle states for a server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ServerState {
    /// Recorded by the planner, waiting for the allocator.
    Pending = 1,
    /// Provider create in flight.
    Creating = 2,
    /// Instance exists, agent not installed yet.
    Created = 3,
    /// Agent installation in flight.
    Staging = 4,
    /// Agent is running and accepting builds.
    Running = 5,
    /// Marked for retirement.
    Shutdown = 6,
    /// Teardown in flight.
    Stopping = 7,
    /// Instance destroyed.
    Stopped = 8,
    /// A step failed; the reaper will clean up.
    Error = 9,
}

impl ServerState {
    /// Every state, in lifecycle order.
    pub const ALL: [Self; 9] = [
        Self::Pending,
        Self::Creating,
        Self::Created,
        Self::Staging,
        Self::Running,
        Self::Shutdown,
        Self::Stopping,
        Self::Stopped,
        Self::Error,
    ];

    /// Convert the state to its numeric representation.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to convert a numeric value to a `ServerState`.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Pending),
            2 => Some(Self::Creating),
            3 => Some(Self::Created),
            4 => Some(Self::Staging),
            5 => Some(Self::Running),
            6 => Some(Self::Shutdown),
            7 => Some(Self::Stopping),
            8 => Some(Self::Stopped),
            9 => Some(Self::Error),
            _ => None,
        }
    }

    /// Return the snake_case name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Creating => "creating",
            Self::Created => "created",
            Self::Staging => "staging",
            Self::Running => "running",
            Self::Shutdown => "shutdown",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServerState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| format!("unknown server state: {s}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(name: &ServerName) -> Instance {
        Instance {
            provider: ProviderKind::Hetzner,
            id: "4711".into(),
            name: name.clone(),
            address: "203.0.113.7".into(),
            region: "nbg1".into(),
            image: "ubuntu-24.04".into(),
            size: "cx22".into(),
        }
    }

    #[test]
    fn state_u8_roundtrip() {
        for state in ServerState::ALL {
            assert_eq!(ServerState::from_u8(state.as_u8()), Some(state));
            assert_eq!(state.to_string().parse::<ServerState>(), Ok(state));
        }
        assert_eq!(ServerState::from_u8(0), None);
        assert!("exploded".parse::<ServerState>().is_err());
    }

    #[test]
    fn state_serde_is_snake_case() {
        let json = serde_json::to_string(&ServerState::Shutdown).unwrap();
        assert_eq!(json, "\"shutdown\"");
    }

    #[test]
    fn unprovisioned_server_has_no_instance() {
        let server = Server::new_pending(
            ServerName::generate(),
            ProviderKind::Mock,
            2,
            "s".into(),
        );
        assert_eq!(server.state, ServerState::Pending);
        assert!(!server.is_provisioned());
        assert!(server.instance().is_none());
    }

    #[test]
    fn apply_then_reconstruct_instance() {
        let name = ServerName::generate();
        let mut server = Server::new_pending(name.clone(), ProviderKind::Mock, 2, "s".into());
        let created = instance(&name);
        server.apply_instance(&created);

        assert!(server.is_provisioned());
        assert_eq!(server.provider, ProviderKind::Hetzner);
        assert_eq!(server.address.as_deref(), Some("203.0.113.7"));
        assert_eq!(server.instance(), Some(created));
    }
}
