//! Backup steps run inside a [`Pipeline`](crate::pipeline::Pipeline).

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cachefleet_health::deadline::{Terminate, do_within};
use cachefleet_redis::AdminClient;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{BackupError, BackupResult};
use crate::pipeline::{Artifact, Task};
use crate::store::ObjectStore;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const SAVE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// `<prefix>/<node_id>/<instance_id>/<YYYY-MM-DDTHH:MM:SSZ>-redis-backup`.
/// Slashes around the prefix are trimmed; an empty prefix adds nothing.
pub fn object_key(prefix: &str, node_id: &str, instance_id: &str, at: DateTime<Utc>) -> String {
    let stamp = at.format("%Y-%m-%dT%H:%M:%SZ");
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{node_id}/{instance_id}/{stamp}-redis-backup")
    } else {
        format!("{prefix}/{node_id}/{instance_id}/{stamp}-redis-backup")
    }
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> BackupError + '_ {
    move |source| BackupError::Io {
        path: path.to_path_buf(),
        source,
    }
}

// ── snapshot ───────────────────────────────────────────────────────

/// Trigger BGSAVE and wait for it to finish.
///
/// Completion is read from `INFO persistence`: the save is over once
/// `rdb_bgsave_in_progress` drops to 0, and good only if
/// `rdb_last_bgsave_status` is `ok`. LASTSAVE alone has one-second
/// resolution and misses a save that finishes in the second it started.
pub struct SnapshotTask {
    address: String,
    password: Option<String>,
    timeout: Duration,
}

impl SnapshotTask {
    pub fn new(address: impl Into<String>, password: Option<String>, timeout: Duration) -> Self {
        Self {
            address: address.into(),
            password,
            timeout,
        }
    }
}

async fn wait_for_save(
    mut client: AdminClient,
    before: i64,
    mut terminate: Terminate,
) -> BackupResult<()> {
    loop {
        let state = client.persistence().await?;
        if !state.bgsave_in_progress || state.last_save_time > before {
            if !state.last_bgsave_ok {
                return Err(BackupError::SaveFailed(client.address().to_string()));
            }
            debug!(address = %client.address(), last_save = state.last_save_time, "background save finished");
            return Ok(());
        }
        tokio::select! {
            _ = tokio::time::sleep(SAVE_POLL_INTERVAL) => {}
            _ = terminate.terminated() => return Ok(()),
        }
    }
}

#[async_trait]
impl Task for SnapshotTask {
    fn name(&self) -> &str {
        "snapshot"
    }

    async fn run(&self, artifact: Artifact) -> BackupResult<Artifact> {
        let mut client =
            AdminClient::connect(&self.address, self.password.as_deref(), CONNECT_TIMEOUT).await?;
        let before = client.lastsave().await?;
        client.bgsave().await?;
        debug!(address = %self.address, before, "background save started");

        match do_within(self.timeout, move |terminate| wait_for_save(client, before, terminate)).await {
            Ok(result) => result?,
            Err(_) => return Err(BackupError::SaveTimeout(self.timeout)),
        }
        tokio::fs::metadata(&artifact.local_path)
            .await
            .map_err(io_error(&artifact.local_path))?;
        Ok(artifact)
    }
}

// ── stage ──────────────────────────────────────────────────────────

/// Move the snapshot out of the data directory.
pub struct StageTask {
    target: PathBuf,
}

impl StageTask {
    pub fn new(staging_directory: &Path, instance_id: &str) -> Self {
        Self {
            target: staging_directory.join(format!("{instance_id}-dump.rdb")),
        }
    }
}

#[async_trait]
impl Task for StageTask {
    fn name(&self) -> &str {
        "stage"
    }

    async fn run(&self, artifact: Artifact) -> BackupResult<Artifact> {
        if let Some(dir) = self.target.parent() {
            tokio::fs::create_dir_all(dir).await.map_err(io_error(dir))?;
        }
        tokio::fs::copy(&artifact.local_path, &self.target)
            .await
            .map_err(io_error(&artifact.local_path))?;
        tokio::fs::remove_file(&artifact.local_path)
            .await
            .map_err(io_error(&artifact.local_path))?;
        Ok(Artifact::new(&self.target))
    }
}

// ── upload ─────────────────────────────────────────────────────────

pub struct UploadTask {
    store: Arc<dyn ObjectStore>,
    bucket: String,
    key: String,
}

impl UploadTask {
    pub fn new(store: Arc<dyn ObjectStore>, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

#[async_trait]
impl Task for UploadTask {
    fn name(&self) -> &str {
        "upload"
    }

    async fn run(&self, artifact: Artifact) -> BackupResult<Artifact> {
        self.store.ensure_bucket(&self.bucket).await?;
        let size = self
            .store
            .put_file(&self.bucket, &self.key, &artifact.local_path)
            .await?;
        info!(bucket = %self.bucket, key = %self.key, size, "backup uploaded");
        Ok(artifact)
    }
}

// ── cleanup ────────────────────────────────────────────────────────

pub struct CleanupTask;

#[async_trait]
impl Task for CleanupTask {
    fn name(&self) -> &str {
        "cleanup"
    }

    async fn run(&self, artifact: Artifact) -> BackupResult<Artifact> {
        tokio::fs::remove_file(&artifact.local_path)
            .await
            .map_err(io_error(&artifact.local_path))?;
        Ok(artifact)
    }
}
