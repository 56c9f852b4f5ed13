//! Shared types used across cachefleet crates.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Opaque identifier of a provisioned instance (the broker's instance id).
pub type InstanceId = String;

/// Opaque identifier of a binding.
pub type BindingId = String;

/// Default port the cache server listens on for dedicated nodes.
pub const DEFAULT_CACHE_PORT: u16 = 6379;

/// Default port of the per-node agent.
pub const DEFAULT_AGENT_PORT: u16 = 9876;

/// A provisioned cache server.
///
/// The serialized field names match the persisted state file layout.
/// Records are never edited in place: rotating a password produces a new
/// record that replaces the old one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    #[serde(rename = "ID")]
    pub id: InstanceId,
    #[serde(rename = "Host")]
    pub host: String,
    #[serde(rename = "Port")]
    pub port: u16,
    #[serde(rename = "Password", default, skip_serializing_if = "String::is_empty")]
    pub password: String,
}

impl Instance {
    pub fn new(id: &str, host: &str, port: u16, password: &str) -> Self {
        Self {
            id: id.to_string(),
            host: host.to_string(),
            port,
            password: password.to_string(),
        }
    }

    /// `host:port` of the cache admin endpoint.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Same instance with new credentials.
    pub fn with_credentials(&self, credentials: &Credentials) -> Self {
        Self {
            id: self.id.clone(),
            host: self.host.clone(),
            port: credentials.port,
            password: credentials.password.clone(),
        }
    }
}

/// Credentials reported by a node agent for its local cache server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub port: u16,
    pub password: String,
}

/// Credentials handed to an application on bind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BindingCredentials {
    pub host: String,
    pub port: u16,
    pub password: String,
}

impl From<&Instance> for BindingCredentials {
    fn from(instance: &Instance) -> Self {
        Self {
            host: instance.host.clone(),
            port: instance.port,
            password: instance.password.clone(),
        }
    }
}

/// An instance id that cannot name a directory under a data root.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid instance id {0:?}")]
pub struct InvalidInstanceId(pub String);

/// Instance ids become directory names on shared hosts, so they must be a
/// single non-empty path component.
pub fn validate_instance_id(id: &str) -> Result<(), InvalidInstanceId> {
    let bad = id.is_empty()
        || id == "."
        || id == ".."
        || id.contains(['/', '\\', '\0']);
    if bad {
        return Err(InvalidInstanceId(id.to_string()));
    }
    Ok(())
}

/// Generate a fresh instance password: 32 hex characters from the OS RNG.
pub fn generate_password() -> std::io::Result<String> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes).map_err(std::io::Error::other)?;
    Ok(hex::encode(bytes))
}
