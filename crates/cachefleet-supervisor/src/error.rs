//! Supervisor error types.

use std::path::PathBuf;
use std::time::Duration;

use cachefleet_core::InvalidInstanceId;
use cachefleet_health::ProcessError;
use cachefleet_redis::ConfError;
use thiserror::Error;

/// Errors raised while supervising local instances.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid instance record {path}: {source}")]
    Record {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error(transparent)]
    InvalidId(#[from] InvalidInstanceId),

    #[error("config error: {0}")]
    Conf(#[from] ConfError),

    #[error("process error: {0}")]
    Process(#[from] ProcessError),

    #[error("unit {unit} command {command:?} failed: {reason}")]
    Unit {
        unit: String,
        command: String,
        reason: String,
    },

    #[error("instance {instance_id} did not accept connections within {timeout:?}")]
    StartTimeout {
        instance_id: String,
        timeout: Duration,
    },
}

impl SupervisorError {
    /// Whether a single retry of the failed step may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            SupervisorError::Io { .. }
                | SupervisorError::Unit { .. }
                | SupervisorError::Conf(ConfError::Io { .. })
        )
    }
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
