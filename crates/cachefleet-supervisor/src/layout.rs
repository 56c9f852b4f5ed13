//! On-disk layout of locally supervised instances.
//!
//! ```text
//! <data_directory>/<instance_id>/
//!     instance.json       id, host, port, password
//!     redis.conf          effective config
//!     redis-server.pid
//!     lock                present during a backup or manual maintenance
//!     db/                 snapshot directory
//! <log_directory>/<instance_id>/redis-server.log
//! ```

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use cachefleet_core::{Instance, validate_instance_id};
use tracing::{debug, warn};

use crate::error::{SupervisorError, SupervisorResult};

pub const RECORD_FILE: &str = "instance.json";
pub const CONFIG_FILE: &str = "redis.conf";
pub const PID_FILE: &str = "redis-server.pid";
pub const LOCK_FILE: &str = "lock";
pub const DB_DIR: &str = "db";
pub const LOG_FILE: &str = "redis-server.log";

/// Paths belonging to one instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstancePaths {
    pub root: PathBuf,
    pub log_dir: PathBuf,
}

impl InstancePaths {
    pub fn record(&self) -> PathBuf {
        self.root.join(RECORD_FILE)
    }

    pub fn config(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn pidfile(&self) -> PathBuf {
        self.root.join(PID_FILE)
    }

    pub fn lock(&self) -> PathBuf {
        self.root.join(LOCK_FILE)
    }

    pub fn db_dir(&self) -> PathBuf {
        self.root.join(DB_DIR)
    }

    pub fn log_file(&self) -> PathBuf {
        self.log_dir.join(LOG_FILE)
    }
}

/// Root directories holding every local instance.
#[derive(Debug, Clone)]
pub struct Layout {
    data_directory: PathBuf,
    log_directory: PathBuf,
}

impl Layout {
    pub fn new(data_directory: impl Into<PathBuf>, log_directory: impl Into<PathBuf>) -> Self {
        Self {
            data_directory: data_directory.into(),
            log_directory: log_directory.into(),
        }
    }

    pub fn data_directory(&self) -> &Path {
        &self.data_directory
    }

    /// Paths of one instance. Ids that are not a single path component
    /// are rejected.
    pub fn paths(&self, instance_id: &str) -> SupervisorResult<InstancePaths> {
        validate_instance_id(instance_id)?;
        Ok(InstancePaths {
            root: self.data_directory.join(instance_id),
            log_dir: self.log_directory.join(instance_id),
        })
    }

    /// Whether a `lock` marker excludes the instance from supervision.
    pub fn is_locked(&self, instance_id: &str) -> bool {
        self.paths(instance_id)
            .is_ok_and(|paths| paths.lock().exists())
    }

    /// Create the instance, db and log directories.
    pub fn ensure_dirs(&self, instance_id: &str) -> SupervisorResult<InstancePaths> {
        let paths = self.paths(instance_id)?;
        for dir in [&paths.root, &paths.db_dir(), &paths.log_dir] {
            fs::create_dir_all(dir).map_err(|source| io_error(dir, source))?;
        }
        Ok(paths)
    }

    /// Persist the instance record, creating its directory if needed.
    pub fn write_record(&self, instance: &Instance) -> SupervisorResult<()> {
        let paths = self.ensure_dirs(&instance.id)?;
        let path = paths.record();
        let json = serde_json::to_vec_pretty(instance).map_err(|source| SupervisorError::Record {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(|source| io_error(&path, source))?;
        debug!(instance_id = %instance.id, "instance record written");
        Ok(())
    }

    pub fn read_record(&self, instance_id: &str) -> SupervisorResult<Instance> {
        let path = self.paths(instance_id)?.record();
        let bytes = fs::read(&path).map_err(|source| io_error(&path, source))?;
        serde_json::from_slice(&bytes).map_err(|source| SupervisorError::Record { path, source })
    }

    /// Every instance with a readable record, sorted by id.
    ///
    /// A missing data directory means no instances. Directories without a
    /// record are skipped; unreadable records are logged and skipped.
    pub fn all_instances(&self) -> SupervisorResult<Vec<Instance>> {
        let entries = match fs::read_dir(&self.data_directory) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => return Err(io_error(&self.data_directory, source)),
        };

        let mut instances = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| io_error(&self.data_directory, source))?;
            if !entry.path().is_dir() {
                continue;
            }
            let Some(id) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let Ok(paths) = self.paths(&id) else {
                continue;
            };
            if !paths.record().exists() {
                continue;
            }
            match self.read_record(&id) {
                Ok(instance) => instances.push(instance),
                Err(e) => warn!(instance_id = %id, error = %e, "skipping unreadable instance record"),
            }
        }
        instances.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(instances)
    }

    /// Delete the instance and log directories.
    pub fn remove(&self, instance_id: &str) -> SupervisorResult<()> {
        let paths = self.paths(instance_id)?;
        for dir in [&paths.root, &paths.log_dir] {
            match fs::remove_dir_all(dir) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(io_error(dir, source)),
            }
        }
        debug!(%instance_id, "instance directories removed");
        Ok(())
    }
}

fn io_error(path: &Path, source: io::Error) -> SupervisorError {
    SupervisorError::Io {
        path: path.to_path_buf(),
        source,
    }
}
