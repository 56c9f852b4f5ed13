//! Agent error types.

use std::path::PathBuf;
use std::time::Duration;

use cachefleet_redis::{AdminError, ConfError};
use cachefleet_supervisor::SupervisorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    /// The request never produced a response.
    #[error("request to {url} failed: {source}")]
    Transport { url: String, source: reqwest::Error },

    /// The agent answered with a non-2xx status.
    #[error("agent at {host} answered {status}: {body}")]
    Remote {
        host: String,
        status: u16,
        body: String,
    },

    #[error("invalid response from {host}: {reason}")]
    Decode { host: String, reason: String },

    #[error("config error: {0}")]
    Conf(#[from] ConfError),

    #[error("unit error: {0}")]
    Unit(#[from] SupervisorError),

    #[error("admin error: {0}")]
    Admin(#[from] AdminError),

    #[error("failed to wipe {path}: {source}")]
    Wipe {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to generate password: {0}")]
    Password(std::io::Error),

    #[error("cache server did not accept connections within {0:?}")]
    StartTimeout(Duration),
}

impl AgentError {
    /// HTTP status reported by the remote agent, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            AgentError::Remote { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type AgentResult<T> = Result<T, AgentError>;
