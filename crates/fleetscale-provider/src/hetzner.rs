//! Hetzner Cloud provider over the public REST API.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::time::Duration;

use async_trait::async_trait;
use fleetscale_core::{Instance, ProviderKind, ServerName, TlsMaterial};
use serde::{Deserialize, Serialize};

use crate::error::{ProviderError, Result};
use crate::{CreateOpts, Provider};

/// Port the remote Docker daemon listens on.
pub const DOCKER_TLS_PORT: u16 = 2376;

/// Label attached to every machine this control plane boots.
const MANAGED_BY: (&str, &str) = ("managed-by", "fleetscale");

/// Shell script run at first boot to issue the daemon's serving certificate.
const ISSUE_SERVER_CERT: &str = r#"#!/bin/sh
set -e
cd /etc/docker
IP=$(curl -fsS http://169.254.169.254/hetzner/v1/metadata/public-ipv4)
openssl genrsa -out server-key.pem 2048
openssl req -new -key server-key.pem -subj "/CN=$(hostname)" -out server.csr
printf 'subjectAltName=DNS:%s,DNS:localhost,IP:%s\nextendedKeyUsage=serverAuth\n' "$(hostname)" "$IP" > extfile.cnf
openssl x509 -req -in server.csr -CA ca.pem -CAkey ca-key.pem -CAcreateserial -days 1825 -out server-cert.pem -extfile extfile.cnf
chmod 0600 server-key.pem ca-key.pem
rm -f server.csr extfile.cnf
"#;

/// Configuration for the Hetzner provider.
#[derive(Clone)]
pub struct HetznerConfig {
    /// API token.
    pub token: String,
    /// Base URL of the API.
    pub api_url: String,
    /// Location to boot machines in.
    pub location: String,
    /// Server type (size).
    pub server_type: String,
    /// Boot image.
    pub image: String,
    /// Names of SSH keys to install.
    pub ssh_keys: Vec<String>,
}

impl std::fmt::Debug for HetznerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HetznerConfig")
            .field("api_url", &self.api_url)
            .field("location", &self.location)
            .field("server_type", &self.server_type)
            .field("image", &self.image)
            .field("ssh_keys", &self.ssh_keys)
            .finish_non_exhaustive()
    }
}

impl HetznerConfig {
    /// Create a config with the given token and default placement.
    #[must_use]
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            api_url: "https://api.hetzner.cloud/v1".to_string(),
            location: "nbg1".to_string(),
            server_type: "cx22".to_string(),
            image: "ubuntu-24.04".to_string(),
            ssh_keys: Vec::new(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// - `HETZNER_API_TOKEN` (required)
    /// - `HETZNER_API_URL` (default: `https://api.hetzner.cloud/v1`)
    /// - `HETZNER_LOCATION` (default: `nbg1`)
    /// - `HETZNER_SERVER_TYPE` (default: `cx22`)
    /// - `HETZNER_IMAGE` (default: `ubuntu-24.04`)
    /// - `HETZNER_SSH_KEYS` (comma-separated names, optional)
    ///
    /// # Errors
    ///
    /// Returns `ProviderError::Config` if the token is missing.
    pub fn from_env() -> Result<Self> {
        let token = std::env::var("HETZNER_API_TOKEN")
            .map_err(|_| ProviderError::Config("HETZNER_API_TOKEN is not set".into()))?;

        let mut config = Self::new(token);
        if let Ok(val) = std::env::var("HETZNER_API_URL") {
            config.api_url = val.trim_end_matches('/').to_string();
        }
        if let Ok(val) = std::env::var("HETZNER_LOCATION") {
            config.location = val;
        }
        if let Ok(val) = std::env::var("HETZNER_SERVER_TYPE") {
            config.server_type = val;
        }
        if let Ok(val) = std::env::var("HETZNER_IMAGE") {
            config.image = val;
        }
        config.ssh_keys = std::env::var("HETZNER_SSH_KEYS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(config)
    }
}

/// Hetzner Cloud provider.
#[derive(Debug, Clone)]
pub struct HetznerProvider {
    client: reqwest::Client,
    config: HetznerConfig,
}

impl HetznerProvider {
    /// Create a provider with a default HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: HetznerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    /// Create a provider with a custom reqwest client.
    #[must_use]
    pub fn with_client(client: reqwest::Client, config: HetznerConfig) -> Self {
        Self { client, config }
    }

    /// Render the cloud-init document that installs Docker with mutual TLS.
    ///
    /// The daemon's serving certificate is minted on the machine so it can
    /// carry the public IP as a SAN; the leaf in `tls` is the client identity.
    fn cloud_init_user_data(tls: &TlsMaterial) -> String {
        let mut doc = String::from("#cloud-config\nwrite_files:\n");
        for (path, content) in [
            ("/etc/docker/ca.pem", tls.ca_cert.as_str()),
            ("/etc/docker/ca-key.pem", tls.ca_key.as_str()),
            ("/usr/local/bin/fleetscale-docker-tls", ISSUE_SERVER_CERT),
        ] {
            let _ = writeln!(doc, "  - path: {path}\n    permissions: '0700'\n    content: |");
            for line in content.lines() {
                let _ = writeln!(doc, "      {line}");
            }
        }
        let _ = writeln!(
            doc,
            "  - path: /etc/systemd/system/docker.service.d/override.conf\n    content: |\n      \
             [Service]\n      ExecStart=\n      ExecStart=/usr/bin/dockerd -H fd:// \
             -H tcp://0.0.0.0:{DOCKER_TLS_PORT} --tlsverify --tlscacert=/etc/docker/ca.pem \
             --tlscert=/etc/docker/server-cert.pem --tlskey=/etc/docker/server-key.pem"
        );
        doc.push_str(
            "runcmd:\n  - /usr/local/bin/fleetscale-docker-tls\n  \
             - curl -fsSL https://get.docker.com | sh\n  - systemctl daemon-reload\n  \
             - systemctl restart docker\n",
        );
        doc
    }

    /// Turn a non-success response into a provider error.
    /// Describe a Hetzner server as an [`Instance`].
    fn instance(&self, name: &ServerName, server: ServerBody) -> Instance {
        Instance {
            provider: ProviderKind::Hetzner,
            id: server.id.to_string(),
            name: name.clone(),
            address: server.public_net.ipv4.map(|v4| v4.ip).unwrap_or_default(),
            region: self.config.location.clone(),
            image: self.config.image.clone(),
            size: self.config.server_type.clone(),
        }
    }

    async fn api_error(response: reqwest::Response) -> ProviderError {
        let status = response.status().as_u16();
        let message = response
            .json::<ErrorEnvelope>()
            .await
            .map(|e| e.error.message)
            .unwrap_or_else(|_| format!("Hetzner API returned status {status}"));
        ProviderError::Api { status, message }
    }
}

#[derive(Debug, Serialize)]
struct CreateServerRequest<'a> {
    name: &'a str,
    server_type: &'a str,
    image: &'a str,
    location: &'a str,
    ssh_keys: &'a [String],
    user_data: String,
    labels: HashMap<&'a str, &'a str>,
    start_after_create: bool,
}

#[derive(Debug, Deserialize)]
struct CreateServerResponse {
    server: ServerBody,
}

#[derive(Debug, Deserialize)]
struct ListServersResponse {
    servers: Vec<ServerBody>,
}

#[derive(Debug, Deserialize)]
struct ServerBody {
    id: i64,
    public_net: PublicNet,
}

#[derive(Debug, Deserialize)]
struct PublicNet {
    ipv4: Option<Ipv4>,
}

#[derive(Debug, Deserialize)]
struct Ipv4 {
    ip: String,
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[async_trait]
impl Provider for HetznerProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Hetzner
    }

    async fn create(&self, opts: &CreateOpts) -> Result<Instance> {
        let url = format!("{}/servers", self.config.api_url);
        let request = CreateServerRequest {
            name: opts.name.as_str(),
            server_type: &self.config.server_type,
            image: &self.config.image,
            location: &self.config.location,
            ssh_keys: &self.config.ssh_keys,
            user_data: Self::cloud_init_user_data(&opts.tls),
            labels: HashMap::from([MANAGED_BY]),
            start_after_create: true,
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.config.token)
            .json(&request)
            .send()
            .await?;

        if !response.status().is_success() {
            let err = Self::api_error(response).await;
            tracing::error!(server = %opts.name, error = %err, "hetzner: create failed");
            return Err(err);
        }

        let body: CreateServerResponse = response.json().await?;
        let instance = self.instance(&opts.name, body.server);

        tracing::info!(
            server = %opts.name,
            server_id = %instance.id,
            address = %instance.address,
            "hetzner: server created"
        );

        Ok(instance)
    }

    async fn destroy(&self, instance: &Instance) -> Result<()> {
        let url = format!("{}/servers/{}", self.config.api_url, instance.id);

        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.config.token)
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::debug!(server = %instance.name, server_id = %instance.id, "hetzner: server already gone");
            return Err(ProviderError::InstanceNotFound(instance.id.clone()));
        }
        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        tracing::info!(server = %instance.name, server_id = %instance.id, "hetzner: server deleted");
        Ok(())
    }

    async fn find(&self, name: &ServerName) -> Result<Option<Instance>> {
        let url = format!("{}/servers", self.config.api_url);

        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.config.token)
            .query(&[("name", name.as_str())])
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::api_error(response).await);
        }

        let body: ListServersResponse = response.json().await?;
        Ok(body
            .servers
            .into_iter()
            .next()
            .map(|server| self.instance(name, server)))
    }
}
