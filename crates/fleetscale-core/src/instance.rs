//! Provider-facing descriptors shared by the store, providers and engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::ids::ServerName;

/// Known hosting provider backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    /// Hetzner Cloud.
    Hetzner,
    /// In-memory provider used by tests and local development.
    Mock,
}

impl ProviderKind {
    /// Return the lowercase name used in configuration and storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Hetzner => "hetzner",
            Self::Mock => "mock",
        }
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hetzner" => Ok(Self::Hetzner),
            "mock" => Ok(Self::Mock),
            other => Err(CoreError::UnknownProvider(other.to_string())),
        }
    }
}

/// Ephemeral view of a remote compute resource.
///
/// Returned by a provider on create and handed back to it on destroy. It is
/// never persisted on its own; its fields are copied onto the server record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    /// Backend that owns the resource.
    pub provider: ProviderKind,
    /// Provider-assigned identifier.
    pub id: String,
    /// Name of the server this instance backs.
    pub name: ServerName,
    /// Reachable address (usually the public IPv4).
    pub address: String,
    /// Region or location the instance runs in.
    pub region: String,
    /// Image the instance was booted from.
    pub image: String,
    /// Machine size or type.
    pub size: String,
}

/// PEM-encoded certificate material generated for one machine.
///
/// The CA signs the leaf certificate; the remote Docker daemon and the
/// control plane both present the leaf for mutual TLS.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TlsMaterial {
    /// CA private key.
    pub ca_key: String,
    /// CA certificate.
    pub ca_cert: String,
    /// Leaf private key.
    pub tls_key: String,
    /// Leaf certificate.
    pub tls_cert: String,
}

impl fmt::Debug for TlsMaterial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsMaterial")
            .field("ca_cert", &self.ca_cert.len())
            .field("tls_cert", &self.tls_cert.len())
            .finish_non_exhaustive()
    }
}
