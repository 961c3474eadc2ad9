//! Mock remote execution for testing.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetscale_core::ServerName;
use fleetscale_store::Server;
use parking_lot::Mutex;

use crate::error::{RemoteError, Result};
use crate::{ContainerSpec, ContainerSummary, RemoteExec, RemoteExecFactory};

/// A factory whose handles operate on shared in-memory machines.
#[derive(Default, Clone)]
pub struct MockRemoteFactory {
    state: Arc<Mutex<MockState>>,
}

#[derive(Default)]
struct MockState {
    unreachable: HashSet<ServerName>,
    pull_error: Option<String>,
    failing_containers: HashSet<String>,
    machines: HashMap<ServerName, Vec<MockContainer>>,
    stops: Vec<(ServerName, String)>,
    released: Vec<ServerName>,
    pings: usize,
}

struct MockContainer {
    spec: ContainerSpec,
    running: bool,
}

impl MockRemoteFactory {
    /// Create a new mock factory where every machine answers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make pings to this server fail.
    pub fn set_unreachable(&self, server: &ServerName) {
        self.state.lock().unreachable.insert(server.clone());
    }

    /// Make pings to this server succeed again.
    pub fn set_reachable(&self, server: &ServerName) {
        self.state.lock().unreachable.remove(server);
    }

    /// Make every image pull fail.
    pub fn fail_pull(&self, message: impl Into<String>) {
        self.state.lock().pull_error = Some(message.into());
    }

    /// Make creating containers with this name fail.
    pub fn fail_container(&self, name: impl Into<String>) {
        self.state.lock().failing_containers.insert(name.into());
    }

    /// Pretend a stopped container already exists on a machine.
    pub fn seed_container(&self, server: &ServerName, name: &str, image: &str) {
        self.state
            .lock()
            .machines
            .entry(server.clone())
            .or_default()
            .push(MockContainer {
                spec: ContainerSpec {
                    name: name.to_string(),
                    image: image.to_string(),
                    ..ContainerSpec::default()
                },
                running: false,
            });
    }

    /// Specs of all containers on a machine.
    #[must_use]
    pub fn containers(&self, server: &ServerName) -> Vec<ContainerSpec> {
        self.state
            .lock()
            .machines
            .get(server)
            .map(|cs| cs.iter().map(|c| c.spec.clone()).collect())
            .unwrap_or_default()
    }

    /// Names of running containers on a machine.
    #[must_use]
    pub fn running(&self, server: &ServerName) -> Vec<String> {
        self.state
            .lock()
            .machines
            .get(server)
            .map(|cs| {
                cs.iter()
                    .filter(|c| c.running)
                    .map(|c| c.spec.name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Every stop request seen, in order.
    #[must_use]
    pub fn stops(&self) -> Vec<(ServerName, String)> {
        self.state.lock().stops.clone()
    }

    /// Servers released after teardown.
    #[must_use]
    pub fn released(&self) -> Vec<ServerName> {
        self.state.lock().released.clone()
    }

    /// Number of pings seen.
    #[must_use]
    pub fn ping_count(&self) -> usize {
        self.state.lock().pings
    }
}

#[async_trait]
impl RemoteExecFactory for MockRemoteFactory {
    async fn connect(&self, server: &Server) -> Result<Arc<dyn RemoteExec>> {
        Ok(Arc::new(MockRemote {
            server: server.name.clone(),
            state: Arc::clone(&self.state),
        }))
    }

    async fn release(&self, server: &Server) -> Result<()> {
        self.state.lock().released.push(server.name.clone());
        Ok(())
    }
}

struct MockRemote {
    server: ServerName,
    state: Arc<Mutex<MockState>>,
}

impl MockRemote {
    fn error(&self, operation: &'static str, message: &str) -> RemoteError {
        RemoteError::Operation {
            operation,
            target: self.server.to_string(),
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl RemoteExec for MockRemote {
    async fn ping(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.pings += 1;
        if state.unreachable.contains(&self.server) {
            return Err(self.error("ping", "connection refused"));
        }
        Ok(())
    }

    async fn pull_image(&self, _image: &str) -> Result<()> {
        match &self.state.lock().pull_error {
            Some(message) => Err(self.error("pull_image", message)),
            None => Ok(()),
        }
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        Ok(self
            .state
            .lock()
            .machines
            .get(&self.server)
            .map(|cs| {
                cs.iter()
                    .map(|c| ContainerSummary {
                        name: c.spec.name.clone(),
                        image: c.spec.image.clone(),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_containers.contains(&spec.name) {
            return Err(self.error("create_container", "rejected"));
        }
        let containers = state.machines.entry(self.server.clone()).or_default();
        if containers.iter().any(|c| c.spec.name == spec.name) {
            return Err(self.error("create_container", "name already in use"));
        }
        containers.push(MockContainer {
            spec: spec.clone(),
            running: false,
        });
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        let mut state = self.state.lock();
        let container = state
            .machines
            .get_mut(&self.server)
            .and_then(|cs| cs.iter_mut().find(|c| c.spec.name == name))
            .ok_or_else(|| self.error("start_container", "no such container"))?;
        container.running = true;
        Ok(())
    }

    async fn stop_container(&self, name: &str, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        state.stops.push((self.server.clone(), name.to_string()));
        if let Some(container) = state
            .machines
            .get_mut(&self.server)
            .and_then(|cs| cs.iter_mut().find(|c| c.spec.name == name))
        {
            container.running = false;
        }
        Ok(())
    }
}
