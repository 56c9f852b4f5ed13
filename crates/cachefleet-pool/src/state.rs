//! Persistent pool state — one JSON document, replaced atomically.
//!
//! ```json
//! {
//!   "available_instances": [{"ID": "", "Host": "10.0.0.2", "Port": 6379}],
//!   "allocated_instances": [{"ID": "inst-A", "Host": "10.0.0.1", "Port": 6379, "Password": "…"}],
//!   "bindings": {"inst-A": ["b1"]}
//! }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use cachefleet_core::Instance;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{PoolError, PoolResult};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateDocument {
    #[serde(default)]
    pub available_instances: Vec<Instance>,
    #[serde(default)]
    pub allocated_instances: Vec<Instance>,
    #[serde(default)]
    pub bindings: BTreeMap<String, BTreeSet<String>>,
}

/// Location of the state document.
#[derive(Debug, Clone)]
pub struct StateFile {
    path: PathBuf,
}

impl StateFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The stored document, or `None` when no file exists yet.
    pub fn load(&self) -> PoolResult<Option<StateDocument>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(PoolError::Persist {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| PoolError::Decode {
                path: self.path.clone(),
                source,
            })
    }

    /// Write to a sibling temp file, sync, then rename over the target.
    pub fn save(&self, doc: &StateDocument) -> PoolResult<()> {
        let persist = |source| PoolError::Persist {
            path: self.path.clone(),
            source,
        };
        let json = serde_json::to_vec_pretty(doc).map_err(|source| PoolError::Decode {
            path: self.path.clone(),
            source,
        })?;

        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = fs::File::create(&tmp).map_err(persist)?;
        file.write_all(&json).map_err(persist)?;
        file.sync_all().map_err(persist)?;
        drop(file);
        fs::rename(&tmp, &self.path).map_err(persist)?;

        debug!(
            path = ?self.path,
            allocated = doc.allocated_instances.len(),
            available = doc.available_instances.len(),
            "pool state persisted"
        );
        Ok(())
    }

    /// [`save`](Self::save) on the blocking thread pool, so the write and
    /// fsync never stall an async worker.
    pub async fn persist(&self, doc: StateDocument) -> PoolResult<()> {
        let file = self.clone();
        tokio::task::spawn_blocking(move || file.save(&doc))
            .await
            .map_err(|e| PoolError::Persist {
                path: self.path.clone(),
                source: io::Error::other(e),
            })?
    }
}
