//! Docker-over-TLS transport.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bollard::errors::Error as BollardError;
use bollard::models::{ContainerCreateBody, HostConfig, RestartPolicy, RestartPolicyNameEnum};
use bollard::query_parameters::{
    CreateContainerOptionsBuilder, CreateImageOptionsBuilder, ListContainersOptionsBuilder,
    StopContainerOptionsBuilder,
};
use bollard::{Docker, API_DEFAULT_VERSION};
use fleetscale_store::Server;
use futures::TryStreamExt;

use crate::error::{RemoteError, Result};
use crate::{ContainerSpec, ContainerSummary, RemoteExec, RemoteExecFactory};

/// Default port of a TLS-enabled Docker daemon.
pub const DEFAULT_PORT: u16 = 2376;

/// Client-side request timeout in seconds.
const REQUEST_TIMEOUT_SECS: u64 = 120;

/// Connects to machines' Docker daemons with per-machine client certificates.
#[derive(Debug, Clone)]
pub struct DockerFactory {
    cert_dir: PathBuf,
    port: u16,
}

impl DockerFactory {
    /// Create a factory that stages certificates under `cert_dir`.
    #[must_use]
    pub fn new(cert_dir: impl Into<PathBuf>) -> Self {
        Self {
            cert_dir: cert_dir.into(),
            port: DEFAULT_PORT,
        }
    }

    /// Override the daemon port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Write the server's certificate material to disk for the TLS client.
    async fn stage_certs(&self, server: &Server) -> Result<PathBuf> {
        let tls = server.tls.as_ref().ok_or_else(|| RemoteError::NotConfigured {
            server: server.name.to_string(),
            reason: "no certificate material",
        })?;

        let dir = self.cert_dir.join(server.name.as_str());
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join("ca.pem"), &tls.ca_cert).await?;
        tokio::fs::write(dir.join("cert.pem"), &tls.tls_cert).await?;
        tokio::fs::write(dir.join("key.pem"), &tls.tls_key).await?;
        Ok(dir)
    }
}

#[async_trait]
impl RemoteExecFactory for DockerFactory {
    async fn connect(&self, server: &Server) -> Result<Arc<dyn RemoteExec>> {
        let address = server
            .address
            .as_deref()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| RemoteError::NotConfigured {
                server: server.name.to_string(),
                reason: "no address",
            })?;

        let dir = self.stage_certs(server).await?;
        let target = format!("tcp://{address}:{}", self.port);

        let docker = Docker::connect_with_ssl(
            &target,
            &dir.join("key.pem"),
            &dir.join("cert.pem"),
            &dir.join("ca.pem"),
            REQUEST_TIMEOUT_SECS,
            API_DEFAULT_VERSION,
        )
        .map_err(|e| RemoteError::Connect {
            target: target.clone(),
            message: e.to_string(),
        })?;

        Ok(Arc::new(DockerRemote {
            docker,
            server: server.name.to_string(),
        }))
    }

    async fn release(&self, server: &Server) -> Result<()> {
        remove_staged_certs(&self.cert_dir, server.name.as_str()).await
    }
}

/// One machine's Docker daemon.
struct DockerRemote {
    docker: Docker,
    server: String,
}

impl DockerRemote {
    fn op_error(&self, operation: &'static str, subject: &str, source: &BollardError) -> RemoteError {
        RemoteError::Operation {
            operation,
            target: format!("{}/{subject}", self.server),
            message: source.to_string(),
        }
    }
}

/// Split `image[:tag]`, ignoring a registry port.
fn split_image(image: &str) -> (&str, &str) {
    match image.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (image, "latest"),
    }
}

fn status_code(error: &BollardError) -> Option<u16> {
    match error {
        BollardError::DockerResponseServerError { status_code, .. } => Some(*status_code),
        _ => None,
    }
}

#[async_trait]
impl RemoteExec for DockerRemote {
    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| self.op_error("ping", "daemon", &e))
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let (from_image, tag) = split_image(image);
        self.docker
            .create_image(
                Some(
                    CreateImageOptionsBuilder::new()
                        .from_image(from_image)
                        .tag(tag)
                        .build(),
                ),
                None,
                None,
            )
            .try_collect::<Vec<_>>()
            .await
            .map_err(|e| self.op_error("pull_image", image, &e))?;

        tracing::debug!(server = %self.server, image, "pulled image");
        Ok(())
    }

    async fn list_containers(&self) -> Result<Vec<ContainerSummary>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptionsBuilder::new().all(true).build()))
            .await
            .map_err(|e| self.op_error("list_containers", "daemon", &e))?;

        Ok(containers
            .into_iter()
            .flat_map(|c| {
                let image = c.image.unwrap_or_default();
                c.names
                    .unwrap_or_default()
                    .into_iter()
                    .map(move |name| ContainerSummary {
                        name: name.trim_start_matches('/').to_string(),
                        image: image.clone(),
                    })
            })
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<()> {
        let restart_policy = spec.restart_always.then(|| RestartPolicy {
            name: Some(RestartPolicyNameEnum::ALWAYS),
            maximum_retry_count: None,
        });

        let body = ContainerCreateBody {
            image: Some(spec.image.clone()),
            env: (!spec.env.is_empty()).then(|| spec.env.clone()),
            labels: (!spec.labels.is_empty()).then(|| spec.labels.clone()),
            host_config: Some(HostConfig {
                binds: (!spec.binds.is_empty()).then(|| spec.binds.clone()),
                restart_policy,
                ..HostConfig::default()
            }),
            ..ContainerCreateBody::default()
        };

        self.docker
            .create_container(
                Some(CreateContainerOptionsBuilder::new().name(&spec.name).build()),
                body,
            )
            .await
            .map_err(|e| self.op_error("create_container", &spec.name, &e))?;
        Ok(())
    }

    async fn start_container(&self, name: &str) -> Result<()> {
        match self
            .docker
            .start_container(name, None::<bollard::query_parameters::StartContainerOptions>)
            .await
        {
            Ok(()) => Ok(()),
            // Already running.
            Err(e) if status_code(&e) == Some(304) => Ok(()),
            Err(e) => Err(self.op_error("start_container", name, &e)),
        }
    }

    async fn stop_container(&self, name: &str, timeout: Duration) -> Result<()> {
        let secs = i32::try_from(timeout.as_secs()).unwrap_or(i32::MAX);
        match self
            .docker
            .stop_container(name, Some(StopContainerOptionsBuilder::new().t(secs).build()))
            .await
        {
            Ok(()) => Ok(()),
            // Already stopped or gone.
            Err(e) if matches!(status_code(&e), Some(304 | 404)) => Ok(()),
            Err(e) => Err(self.op_error("stop_container", name, &e)),
        }
    }
}

/// Remove staged certificates for a server that no longer exists.
async fn remove_staged_certs(cert_dir: &Path, server: &str) -> Result<()> {
    match tokio::fs::remove_dir_all(cert_dir.join(server)).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleetscale_core::{ProviderKind, ServerName};

    fn server() -> Server {
        Server::new_pending(
            ServerName::parse("agent-docker").unwrap(),
            ProviderKind::Mock,
            2,
            "secret".into(),
        )
    }

    #[test]
    fn split_image_tags() {
        assert_eq!(split_image("drone/drone-runner-docker:1"), ("drone/drone-runner-docker", "1"));
        assert_eq!(split_image("drone/gc"), ("drone/gc", "latest"));
        assert_eq!(
            split_image("registry.local:5000/agent"),
            ("registry.local:5000/agent", "latest")
        );
        assert_eq!(
            split_image("registry.local:5000/agent:2"),
            ("registry.local:5000/agent", "2")
        );
    }

    #[tokio::test]
    async fn refuses_server_without_address() {
        let dir = tempfile::tempdir().unwrap();
        let factory = DockerFactory::new(dir.path());
        let err = factory.connect(&server()).await.err().unwrap();
        assert!(matches!(err, RemoteError::NotConfigured { reason: "no address", .. }));
    }

    #[tokio::test]
    async fn refuses_server_without_certs() {
        let dir = tempfile::tempdir().unwrap();
        let factory = DockerFactory::new(dir.path());
        let mut server = server();
        server.address = Some("203.0.113.9".into());
        let err = factory.connect(&server).await.err().unwrap();
        assert!(matches!(
            err,
            RemoteError::NotConfigured { reason: "no certificate material", .. }
        ));
    }

    #[tokio::test]
    async fn stages_certificates_per_server() {
        let dir = tempfile::tempdir().unwrap();
        let factory = DockerFactory::new(dir.path());
        let mut server = server();
        server.tls = Some(crate::certs::generate(&server.name).unwrap());

        let staged = factory.stage_certs(&server).await.unwrap();
        assert_eq!(staged, dir.path().join("agent-docker"));
        let cert = std::fs::read_to_string(staged.join("cert.pem")).unwrap();
        assert_eq!(Some(cert), server.tls.as_ref().map(|t| t.tls_cert.clone()));

        factory.release(&server).await.unwrap();
        assert!(!staged.exists());
        // Releasing twice is fine.
        factory.release(&server).await.unwrap();
    }
}
