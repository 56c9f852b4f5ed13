//! cachefleet-backup — snapshot cache instances to object storage.
//!
//! ```text
//! BackupRunner ── per instance, under a lock marker ──▶ Pipeline
//!     snapshot ─▶ stage ─▶ upload ─▶ cleanup
//! ```

pub mod error;
pub mod pipeline;
pub mod runner;
pub mod store;
pub mod tasks;

pub use error::{BackupError, BackupResult, StoreError, StoreResult};
pub use pipeline::{Artifact, Pipeline, Task};
pub use runner::{BackupReport, BackupRunner, Target};
pub use store::{ObjectStore, S3Credentials, S3Store};
