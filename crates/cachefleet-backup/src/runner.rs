//! One backup run over every instance on this host.
//!
//! Shared hosts keep one instance per directory under the data root;
//! dedicated nodes keep a single `redis.conf` directly in it and learn
//! their instance id from the broker.

use std::fs::OpenOptions;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cachefleet_core::config::{BackupConfig, BrokerLookupConfig};
use cachefleet_redis::RedisConf;
use cachefleet_supervisor::Layout;
use chrono::Utc;
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::error::{BackupError, BackupResult};
use crate::pipeline::{Artifact, Pipeline, Task};
use crate::store::ObjectStore;
use crate::tasks::{CleanupTask, SnapshotTask, StageTask, UploadTask, object_key};

const DEDICATED_CONFIG: &str = "redis.conf";
const DEDICATED_LOCK: &str = "lock";

/// One instance to back up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub instance_id: String,
    pub config_path: PathBuf,
    pub lock_path: PathBuf,
}

#[derive(Debug, Default)]
pub struct BackupReport {
    pub succeeded: Vec<String>,
    pub failed: Vec<(String, BackupError)>,
}

impl BackupReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Lock marker created by this run and removed on drop, whatever the
/// outcome. A marker that already exists belongs to someone else and is
/// never taken over.
struct LockGuard {
    path: PathBuf,
}

impl LockGuard {
    fn acquire(path: &Path) -> BackupResult<Self> {
        match OpenOptions::new().write(true).create_new(true).open(path) {
            Ok(_) => Ok(Self {
                path: path.to_path_buf(),
            }),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                Err(BackupError::Locked(path.to_path_buf()))
            }
            Err(source) => Err(BackupError::Io {
                path: path.to_path_buf(),
                source,
            }),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove backup lock");
        }
    }
}

#[derive(Debug, Deserialize)]
struct InstanceLookup {
    instance_id: String,
}

pub struct BackupRunner {
    config: BackupConfig,
    store: Arc<dyn ObjectStore>,
    http: reqwest::Client,
}

impl BackupRunner {
    pub fn new(config: BackupConfig, store: Arc<dyn ObjectStore>) -> Self {
        Self {
            config,
            store,
            http: reqwest::Client::new(),
        }
    }

    /// Back up every instance. Per-instance failures are collected in the
    /// report; only enumeration failure is returned as an error.
    pub async fn run(&self) -> BackupResult<BackupReport> {
        let mut report = BackupReport::default();
        if !self.config.enabled {
            info!("backups disabled");
            return Ok(report);
        }

        let targets = self.targets().await?;
        info!(count = targets.len(), "backup run starting");
        for target in targets {
            match self.backup(&target).await {
                Ok(()) => report.succeeded.push(target.instance_id),
                Err(e) => {
                    error!(instance_id = %target.instance_id, error = %e, "backup failed");
                    report.failed.push((target.instance_id, e));
                }
            }
        }
        info!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            "backup run complete"
        );
        Ok(report)
    }

    /// Instances hosted under the data directory.
    pub async fn targets(&self) -> BackupResult<Vec<Target>> {
        let data = &self.config.redis_data_directory;
        let dedicated = data.join(DEDICATED_CONFIG);
        if dedicated.is_file() {
            let instance_id = match &self.config.broker {
                Some(broker) => self.lookup_instance(broker).await?,
                None => self.config.node_id.clone(),
            };
            return Ok(vec![Target {
                instance_id,
                config_path: dedicated,
                lock_path: data.join(DEDICATED_LOCK),
            }]);
        }

        let layout = Layout::new(data, data);
        let mut targets = Vec::new();
        for instance in layout.all_instances()? {
            let paths = layout.paths(&instance.id)?;
            targets.push(Target {
                instance_id: instance.id,
                config_path: paths.config(),
                lock_path: paths.lock(),
            });
        }
        Ok(targets)
    }

    async fn lookup_instance(&self, broker: &BrokerLookupConfig) -> BackupResult<String> {
        let url = format!("{}/instance", broker.url.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .query(&[("host", broker.node_ip.as_str())])
            .basic_auth(&broker.username, Some(&broker.password))
            .send()
            .await
            .map_err(|e| BackupError::Lookup(format!("{url}: {e}")))?;
        if !resp.status().is_success() {
            return Err(BackupError::Lookup(format!(
                "{url} answered {} for host {}",
                resp.status(),
                broker.node_ip
            )));
        }
        let lookup: InstanceLookup = resp
            .json()
            .await
            .map_err(|e| BackupError::Lookup(format!("{url}: {e}")))?;
        Ok(lookup.instance_id)
    }

    async fn backup(&self, target: &Target) -> BackupResult<()> {
        let _lock = LockGuard::acquire(&target.lock_path)?;

        let conf = RedisConf::load(&target.config_path)?;
        let address = format!("127.0.0.1:{}", conf.port()?);
        let snapshot = conf.snapshot_path()?;
        let key = object_key(
            &self.config.path_prefix,
            &self.config.node_id,
            &target.instance_id,
            Utc::now(),
        );

        let tasks: Vec<Box<dyn Task>> = vec![
            Box::new(SnapshotTask::new(
                address,
                conf.require_pass().map(str::to_string),
                self.config.bg_save_timeout(),
            )),
            Box::new(StageTask::new(&self.config.staging_directory, &target.instance_id)),
            Box::new(UploadTask::new(
                self.store.clone(),
                &self.config.bucket_name,
                key,
            )),
            Box::new(CleanupTask),
        ];
        Pipeline::new(format!("backup {}", target.instance_id), tasks)
            .run(Artifact::new(snapshot))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use axum::Router;
    use axum::extract::Query;
    use axum::http::StatusCode;
    use axum::routing::get;
    use cachefleet_core::Instance;
    use cachefleet_redis::testing::MockRedis;
    use std::collections::HashMap;

    fn config(data: &Path, staging: &Path) -> BackupConfig {
        BackupConfig {
            enabled: true,
            bucket_name: "backups".into(),
            endpoint_url: "http://unused".into(),
            region: "us-east-1".into(),
            access_key: "a".into(),
            secret_key: "s".into(),
            path_prefix: "prefix".into(),
            bg_save_timeout_seconds: 2,
            redis_data_directory: data.to_path_buf(),
            node_id: "node-0".into(),
            staging_directory: staging.to_path_buf(),
            broker: None,
        }
    }

    fn write_conf(path: &Path, port: u16, password: &str, dir: &Path) {
        let mut conf = RedisConf::new();
        conf.set("port", port.to_string());
        conf.set("requirepass", password);
        conf.set("dir", dir.display().to_string());
        conf.save(path).unwrap();
    }

    /// A shared instance backed by a mock server whose BGSAVE writes `size`
    /// bytes into the instance's db directory.
    async fn shared_instance(data: &Path, id: &str, size: usize) -> MockRedis {
        let layout = Layout::new(data, data);
        let redis = MockRedis::start("pw").await;
        layout
            .write_record(&Instance::new(id, "127.0.0.1", redis.port(), "pw"))
            .unwrap();
        let paths = layout.paths(id).unwrap();
        write_conf(&paths.config(), redis.port(), "pw", &paths.db_dir());
        redis.set_dump(&paths.db_dir().join("dump.rdb"), &vec![9u8; size]);
        redis
    }

    #[tokio::test]
    async fn backs_up_shared_instance_and_cleans_up() {
        let data = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let _redis = shared_instance(data.path(), "inst-A", 4096).await;
        let store = Arc::new(MemoryStore::default());

        let runner = BackupRunner::new(config(data.path(), staging.path()), store.clone());
        let report = runner.run().await.unwrap();
        assert!(report.is_success());
        assert_eq!(report.succeeded, vec!["inst-A"]);

        let objects = store.objects.lock().unwrap();
        let (key, body) = objects.iter().next().unwrap();
        assert!(key.starts_with("backups/prefix/node-0/inst-A/"));
        assert!(key.ends_with("-redis-backup"));
        assert_eq!(body.len(), 4096);

        assert_eq!(std::fs::read_dir(staging.path()).unwrap().count(), 0);
        assert!(!data.path().join("inst-A").join("lock").exists());
        assert!(!data.path().join("inst-A/db/dump.rdb").exists());
    }

    #[tokio::test]
    async fn one_failure_does_not_stop_the_rest() {
        let data = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let _good = shared_instance(data.path(), "inst-A", 16).await;
        let bad = shared_instance(data.path(), "inst-B", 16).await;
        bad.fail_bgsave();
        let _good2 = shared_instance(data.path(), "inst-C", 16).await;
        let store = Arc::new(MemoryStore::default());

        let report = BackupRunner::new(config(data.path(), staging.path()), store.clone())
            .run()
            .await
            .unwrap();
        assert!(!report.is_success());
        assert_eq!(report.succeeded, vec!["inst-A", "inst-C"]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "inst-B");
        assert!(matches!(&report.failed[0].1, BackupError::Step { step, .. } if step == "snapshot"));
        assert!(!data.path().join("inst-B").join("lock").exists());
        assert_eq!(store.objects.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn upload_failure_keeps_lock_released() {
        let data = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let _redis = shared_instance(data.path(), "inst-A", 16).await;
        let store = Arc::new(MemoryStore::default());
        *store.fail_uploads.lock().unwrap() = true;

        let report = BackupRunner::new(config(data.path(), staging.path()), store)
            .run()
            .await
            .unwrap();
        assert!(matches!(&report.failed[0].1, BackupError::Step { step, .. } if step == "upload"));
        assert!(!data.path().join("inst-A").join("lock").exists());
    }

    #[tokio::test]
    async fn existing_maintenance_lock_is_left_alone() {
        let data = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let redis = shared_instance(data.path(), "inst-A", 16).await;
        let _other = shared_instance(data.path(), "inst-B", 16).await;
        let lock = data.path().join("inst-A").join("lock");
        std::fs::write(&lock, "operator maintenance").unwrap();
        let store = Arc::new(MemoryStore::default());

        let report = BackupRunner::new(config(data.path(), staging.path()), store.clone())
            .run()
            .await
            .unwrap();
        assert_eq!(report.succeeded, vec!["inst-B"]);
        assert_eq!(report.failed.len(), 1);
        assert!(matches!(&report.failed[0].1, BackupError::Locked(path) if *path == lock));
        assert_eq!(std::fs::read_to_string(&lock).unwrap(), "operator maintenance");
        assert_eq!(redis.saves(), 0);
        assert_eq!(store.objects.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn disabled_runs_nothing() {
        let data = tempfile::tempdir().unwrap();
        let _redis = shared_instance(data.path(), "inst-A", 16).await;
        let mut cfg = config(data.path(), data.path());
        cfg.enabled = false;
        let store = Arc::new(MemoryStore::default());
        let report = BackupRunner::new(cfg, store.clone()).run().await.unwrap();
        assert!(report.succeeded.is_empty());
        assert!(store.objects.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn dedicated_node_asks_broker_for_instance_id() {
        let data = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let redis = MockRedis::start("pw").await;
        let store_dir = data.path().join("store");
        std::fs::create_dir_all(&store_dir).unwrap();
        write_conf(&data.path().join("redis.conf"), redis.port(), "pw", &store_dir);
        redis.set_dump(&store_dir.join("dump.rdb"), b"dedicated");

        let router = Router::new().route(
            "/instance",
            get(|Query(q): Query<HashMap<String, String>>| async move {
                if q.get("host").map(String::as_str) == Some("10.0.0.7") {
                    Ok(axum::Json(serde_json::json!({"instance_id": "inst-D"})))
                } else {
                    Err(StatusCode::NOT_FOUND)
                }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let broker_url = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let mut cfg = config(data.path(), staging.path());
        cfg.broker = Some(BrokerLookupConfig {
            url: broker_url,
            username: "admin".into(),
            password: "secret".into(),
            node_ip: "10.0.0.7".into(),
        });
        let store = Arc::new(MemoryStore::default());
        let report = BackupRunner::new(cfg, store.clone()).run().await.unwrap();
        assert_eq!(report.succeeded, vec!["inst-D"]);
        let objects = store.objects.lock().unwrap();
        assert!(objects.keys().next().unwrap().starts_with("backups/prefix/node-0/inst-D/"));
        assert!(!data.path().join("lock").exists());
    }

    #[tokio::test]
    async fn dedicated_node_without_broker_uses_node_id() {
        let data = tempfile::tempdir().unwrap();
        write_conf(&data.path().join("redis.conf"), 6379, "pw", data.path());
        let runner = BackupRunner::new(
            config(data.path(), data.path()),
            Arc::new(MemoryStore::default()),
        );
        let targets = runner.targets().await.unwrap();
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].instance_id, "node-0");
        assert_eq!(targets[0].lock_path, data.path().join("lock"));
    }
}
