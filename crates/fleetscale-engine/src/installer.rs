//! Installs the build agent on `created` servers.
//!
//! The agent runs as a container on the machine's Docker daemon. When the
//! daemon answers, the installer pulls the agent image, creates the `agent`
//! container (or reuses one left by an earlier attempt) and starts it,
//! followed by any configured sidecars.

use std::collections::HashMap;
use std::sync::Arc;

use fleetscale_remote::{ContainerSpec, RemoteExec, RemoteExecFactory};
use fleetscale_store::{Server, ServerState, Store};
use tokio_util::sync::CancellationToken;

use crate::config::{AgentConfig, SidecarConfig};
use crate::error::{EngineError, Result};
use crate::lifecycle;
use crate::tasks::{self, Fanout};

/// Name of the agent container on every machine.
pub const AGENT_CONTAINER: &str = "agent";

/// Name of the garbage collector sidecar.
pub const GC_CONTAINER: &str = "gc";

/// Name of the auto-update sidecar.
pub const WATCHTOWER_CONTAINER: &str = "watchtower";

const DOCKER_SOCKET: &str = "/var/run/docker.sock:/var/run/docker.sock";

const SERVER_LABEL: &str = "io.fleetscale.server";

/// Moves servers from `created` through `staging` to `running` or `error`.
#[derive(Clone)]
pub struct Installer {
    store: Arc<dyn Store>,
    remote: Arc<dyn RemoteExecFactory>,
    cancel: CancellationToken,
    config: AgentConfig,
    labels: HashMap<String, String>,
    fanout: Fanout,
}

impl Installer {
    /// Create an installer.
    ///
    /// `labels` are advertised by the agent so the CI server routes matching
    /// stages to it.
    #[must_use]
    pub fn new(
        store: Arc<dyn Store>,
        remote: Arc<dyn RemoteExecFactory>,
        cancel: CancellationToken,
        config: AgentConfig,
        labels: HashMap<String, String>,
        limit: usize,
    ) -> Self {
        Self {
            store,
            remote,
            cancel,
            config,
            labels,
            fanout: Fanout::new("installer", limit),
        }
    }

    /// Claim every `created` server and start installing the agent on it.
    ///
    /// Returns the number of servers claimed.
    ///
    /// # Errors
    ///
    /// Returns an error if the servers cannot be listed or claimed.
    pub fn install(&self) -> Result<usize> {
        let servers = self.store.list_state(ServerState::Created)?;
        let mut claimed = 0;

        for mut server in servers {
            if !lifecycle::claim(self.store.as_ref(), &mut server, ServerState::Staging)? {
                continue;
            }
            tracing::debug!(server = %server.name, "Claimed server for installation");

            let this = self.clone();
            self.fanout
                .spawn(server.name.clone(), async move { this.setup(server).await });
            claimed += 1;
        }

        Ok(claimed)
    }

    /// In-flight installation tasks.
    #[must_use]
    pub fn fanout(&self) -> &Fanout {
        &self.fanout
    }

    async fn setup(&self, mut server: Server) {
        let result = tasks::bounded(&self.cancel, self.config.timeout, self.install_agent(&server)).await;

        match result {
            Ok(()) => {
                server.error = None;
                lifecycle::settle(self.store.as_ref(), &mut server, ServerState::Running);
                if server.state == ServerState::Running {
                    tracing::info!(server = %server.name, "Agent installed");
                }
            }
            Err(EngineError::Interrupted) => {
                tracing::debug!(server = %server.name, "Installation interrupted");
            }
            Err(e) => {
                tracing::error!(server = %server.name, error = %e, "Failed to install agent");
                server.error = Some(e.to_string());
                lifecycle::settle(self.store.as_ref(), &mut server, ServerState::Error);
            }
        }
    }

    async fn install_agent(&self, server: &Server) -> Result<()> {
        let remote = self.remote.connect(server).await?;
        self.wait_for_daemon(server, remote.as_ref()).await?;

        remote.pull_image(&self.config.image).await?;
        ensure_running(remote.as_ref(), &self.agent_spec(server)).await?;

        if let Some(gc) = &self.config.gc {
            self.start_sidecar(server, remote.as_ref(), gc_spec(gc)).await;
        }
        if let Some(watchtower) = &self.config.watchtower {
            self.start_sidecar(server, remote.as_ref(), watchtower_spec(watchtower))
                .await;
        }

        Ok(())
    }

    async fn wait_for_daemon(&self, server: &Server, remote: &dyn RemoteExec) -> Result<()> {
        loop {
            match remote.ping().await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::debug!(server = %server.name, error = %e, "Docker daemon not ready");
                }
            }
            tasks::pause(&self.cancel, self.config.retry_interval).await?;
        }
    }

    async fn start_sidecar(&self, server: &Server, remote: &dyn RemoteExec, spec: ContainerSpec) {
        let result: Result<()> = async {
            remote.pull_image(&spec.image).await?;
            ensure_running(remote, &spec).await
        }
        .await;

        if let Err(e) = result {
            tracing::warn!(
                server = %server.name,
                container = %spec.name,
                error = %e,
                "Failed to start sidecar"
            );
        }
    }

    fn agent_spec(&self, server: &Server) -> ContainerSpec {
        let secret = if self.config.rpc_secret.is_empty() {
            &server.secret
        } else {
            &self.config.rpc_secret
        };

        let mut env = vec![
            format!("DRONE_RPC_PROTO={}", self.config.rpc_proto),
            format!("DRONE_RPC_HOST={}", self.config.rpc_host),
            format!("DRONE_RPC_SECRET={secret}"),
            format!("DRONE_RUNNER_CAPACITY={}", server.capacity),
            format!("DRONE_RUNNER_NAME={}", server.name),
        ];
        if !self.labels.is_empty() {
            env.push(format!("DRONE_RUNNER_LABELS={}", runner_labels(&self.labels)));
        }
        env.extend(self.config.env.iter().cloned());

        let mut binds = vec![DOCKER_SOCKET.to_string()];
        binds.extend(self.config.volumes.iter().cloned());

        ContainerSpec {
            name: AGENT_CONTAINER.to_string(),
            image: self.config.image.clone(),
            env,
            binds,
            labels: HashMap::from([(SERVER_LABEL.to_string(), server.name.to_string())]),
            restart_always: true,
        }
    }
}

/// Create the container unless it already exists, then start it.
async fn ensure_running(remote: &dyn RemoteExec, spec: &ContainerSpec) -> Result<()> {
    let exists = remote
        .list_containers()
        .await?
        .iter()
        .any(|c| c.name == spec.name);

    if !exists {
        remote.create_container(spec).await?;
    }
    remote.start_container(&spec.name).await?;
    Ok(())
}

/// Render labels as the agent expects them: `k:v,k:v`, sorted by key.
fn runner_labels(labels: &HashMap<String, String>) -> String {
    let mut pairs: Vec<_> = labels.iter().map(|(k, v)| format!("{k}:{v}")).collect();
    pairs.sort();
    pairs.join(",")
}

fn gc_spec(config: &SidecarConfig) -> ContainerSpec {
    ContainerSpec {
        name: GC_CONTAINER.to_string(),
        image: config.image.clone(),
        env: vec![format!("GC_INTERVAL={}s", config.interval.as_secs())],
        binds: vec![DOCKER_SOCKET.to_string()],
        restart_always: true,
        ..ContainerSpec::default()
    }
}

fn watchtower_spec(config: &SidecarConfig) -> ContainerSpec {
    ContainerSpec {
        name: WATCHTOWER_CONTAINER.to_string(),
        image: config.image.clone(),
        env: vec![format!(
            "WATCHTOWER_POLL_INTERVAL={}",
            config.interval.as_secs()
        )],
        binds: vec![DOCKER_SOCKET.to_string()],
        restart_always: true,
        ..ContainerSpec::default()
    }
}
