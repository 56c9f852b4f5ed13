//! Backup error types.

use std::path::PathBuf;
use std::time::Duration;

use cachefleet_redis::{AdminError, ConfError};
use cachefleet_supervisor::SupervisorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BackupError {
    #[error("step {step} failed: {source}")]
    Step {
        step: String,
        source: Box<BackupError>,
    },

    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("instance is locked by {0}")]
    Locked(PathBuf),

    #[error("config error: {0}")]
    Conf(#[from] ConfError),

    #[error("admin error: {0}")]
    Admin(#[from] AdminError),

    #[error("background save on {0} failed")]
    SaveFailed(String),

    #[error("background save did not finish within {0:?}")]
    SaveTimeout(Duration),

    #[error("object store error: {0}")]
    Store(#[from] StoreError),

    #[error("instance enumeration failed: {0}")]
    Instances(#[from] SupervisorError),

    #[error("instance lookup failed: {0}")]
    Lookup(String),
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid endpoint {0}")]
    Endpoint(String),

    #[error("request signing failed: {0}")]
    Signing(String),

    #[error("request to {url} failed: {source}")]
    Transport { url: String, source: reqwest::Error },

    #[error("{method} {url} answered {status}: {body}")]
    Status {
        method: &'static str,
        url: String,
        status: u16,
        body: String,
    },

    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
}

pub type BackupResult<T> = Result<T, BackupError>;
pub type StoreResult<T> = Result<T, StoreError>;
