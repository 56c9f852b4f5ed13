//! Recovery pipeline — named, ordered tasks threading an [`Artifact`].
//!
//! Tasks run in order, each receiving the previous task's artifact. The
//! first failure stops the pipeline; nothing is rolled back.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::{error, info};

use crate::error::{BackupError, BackupResult};

/// The file a pipeline step hands to the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub local_path: PathBuf,
}

impl Artifact {
    pub fn new(local_path: impl Into<PathBuf>) -> Self {
        Self {
            local_path: local_path.into(),
        }
    }
}

#[async_trait]
pub trait Task: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, artifact: Artifact) -> BackupResult<Artifact>;
}

pub struct Pipeline {
    name: String,
    tasks: Vec<Box<dyn Task>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, tasks: Vec<Box<dyn Task>>) -> Self {
        Self {
            name: name.into(),
            tasks,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run every task in order. A failure is wrapped in
    /// [`BackupError::Step`] naming the task.
    pub async fn run(&self, mut artifact: Artifact) -> BackupResult<Artifact> {
        for task in &self.tasks {
            info!(pipeline = %self.name, task = task.name(), "starting");
            artifact = match task.run(artifact).await {
                Ok(next) => {
                    info!(pipeline = %self.name, task = task.name(), "done");
                    next
                }
                Err(e) => {
                    error!(pipeline = %self.name, task = task.name(), error = %e, "failed");
                    return Err(BackupError::Step {
                        step: task.name().to_string(),
                        source: Box::new(e),
                    });
                }
            };
        }
        Ok(artifact)
    }
}
