//! Pool error types.

use std::path::PathBuf;

use cachefleet_agent::AgentError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PoolError {
    #[error("no free nodes left in the pool")]
    PoolExhausted,

    #[error("instance {0} already exists")]
    DuplicateInstance(String),

    #[error("binding {binding_id} already exists for instance {instance_id}")]
    DuplicateBinding {
        instance_id: String,
        binding_id: String,
    },

    #[error("instance {0} not found")]
    InstanceNotFound(String),

    #[error("binding {binding_id} not found for instance {instance_id}")]
    BindingNotFound {
        instance_id: String,
        binding_id: String,
    },

    #[error("agent on {host} failed: {source}")]
    Agent { host: String, source: AgentError },

    #[error("failed to persist state to {path}: {source}")]
    Persist {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid state file {path}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("state file inconsistent with configuration: {0}")]
    Inconsistent(String),
}

pub type PoolResult<T> = Result<T, PoolError>;
