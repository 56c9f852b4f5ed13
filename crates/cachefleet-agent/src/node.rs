//! The node's single cache server as managed by its agent.
//!
//! Factory reset walks a small state machine:
//!
//! ```text
//! RUNNING --stop unit--> STOPPED --wipe, rotate, rewrite--> CONFIGURED
//!         --start unit, probe--> RUNNING
//! ```
//!
//! Any failing step leaves the node FAILED and the error is reported to
//! the caller. Resets are serialized per node.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cachefleet_core::{Credentials, generate_password};
use cachefleet_health::PortProbe;
use cachefleet_redis::RedisConf;
use cachefleet_redis::conf::REQUIRE_PASS;
use cachefleet_supervisor::UnitController;
use tokio::sync::Mutex;
use tracing::{error, info};

use crate::error::{AgentError, AgentResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResetState {
    Running,
    Stopped,
    Configured,
    Failed,
}

impl fmt::Display for ResetState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResetState::Running => "RUNNING",
            ResetState::Stopped => "STOPPED",
            ResetState::Configured => "CONFIGURED",
            ResetState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

pub struct NodeRedis {
    conf_path: PathBuf,
    unit_name: String,
    units: Arc<dyn UnitController>,
    start_timeout: Duration,
    probe_host: String,
    reset_lock: Mutex<()>,
}

impl NodeRedis {
    pub fn new(
        conf_path: impl Into<PathBuf>,
        unit_name: impl Into<String>,
        units: Arc<dyn UnitController>,
        start_timeout: Duration,
    ) -> Self {
        Self {
            conf_path: conf_path.into(),
            unit_name: unit_name.into(),
            units,
            start_timeout,
            probe_host: "127.0.0.1".into(),
            reset_lock: Mutex::new(()),
        }
    }

    pub fn conf_path(&self) -> &Path {
        &self.conf_path
    }

    /// Port and password from the node's config file.
    pub fn credentials(&self) -> AgentResult<Credentials> {
        let conf = RedisConf::load(&self.conf_path)?;
        Ok(Credentials {
            port: conf.port()?,
            password: conf.require_pass().unwrap_or_default().to_string(),
        })
    }

    /// Stop, wipe, rotate the password, restart and wait for the port.
    pub async fn reset(&self) -> AgentResult<()> {
        let _serialized = self.reset_lock.lock().await;
        let mut state = ResetState::Running;
        match self.run_reset(&mut state).await {
            Ok(()) => {
                info!(unit = %self.unit_name, "factory reset complete");
                Ok(())
            }
            Err(e) => {
                error!(unit = %self.unit_name, during = %state, error = %e, "factory reset failed");
                self.transition(&mut state, ResetState::Failed);
                Err(e)
            }
        }
    }

    async fn run_reset(&self, state: &mut ResetState) -> AgentResult<()> {
        self.units.stop(&self.unit_name, &self.conf_path).await?;
        self.transition(state, ResetState::Stopped);

        let mut conf = RedisConf::load(&self.conf_path)?;
        if let Some(dir) = conf.dir() {
            wipe(&dir)?;
        }
        let password = generate_password().map_err(AgentError::Password)?;
        conf.set(REQUIRE_PASS, password);
        conf.save(&self.conf_path)?;
        self.transition(state, ResetState::Configured);

        self.units.start(&self.unit_name, &self.conf_path).await?;
        let address = format!("{}:{}", self.probe_host, conf.port()?);
        PortProbe::new(address)
            .check(self.start_timeout)
            .await
            .map_err(|_| AgentError::StartTimeout(self.start_timeout))?;
        self.transition(state, ResetState::Running);
        Ok(())
    }

    fn transition(&self, state: &mut ResetState, next: ResetState) {
        info!(unit = %self.unit_name, from = %state, to = %next, "reset state change");
        *state = next;
    }
}

/// Delete every regular file in the data directory, keeping the directory.
fn wipe(dir: &Path) -> AgentResult<()> {
    let wipe_err = |source| AgentError::Wipe {
        path: dir.to_path_buf(),
        source,
    };
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(wipe_err(e)),
    };
    for entry in entries {
        let path = entry.map_err(wipe_err)?.path();
        if path.is_file() {
            std::fs::remove_file(&path).map_err(|source| AgentError::Wipe { path, source })?;
        }
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use cachefleet_supervisor::testing::FakeUnits;

    pub(crate) struct NodeFixture {
        pub dir: tempfile::TempDir,
        pub units: Arc<FakeUnits>,
        pub node: Arc<NodeRedis>,
    }

    pub(crate) async fn node_fixture() -> NodeFixture {
        let dir = tempfile::tempdir().unwrap();
        let port = {
            let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let data = dir.path().join("store");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("dump.rdb"), b"REDIS0009").unwrap();
        std::fs::write(data.join("appendonly.aof"), b"*1\r\n").unwrap();

        let conf_path = dir.path().join("redis.conf");
        std::fs::write(
            &conf_path,
            format!(
                "port {port}\nrequirepass old-password\ndir {}\npidfile {}\n",
                data.display(),
                dir.path().join("redis.pid").display()
            ),
        )
        .unwrap();

        let units = Arc::new(FakeUnits::new());
        units.start("redis", &conf_path).await.unwrap();
        let node = Arc::new(NodeRedis::new(
            &conf_path,
            "redis",
            units.clone(),
            Duration::from_secs(2),
        ));
        NodeFixture { dir, units, node }
    }

    #[tokio::test]
    async fn credentials_come_from_config() {
        let f = node_fixture().await;
        let creds = f.node.credentials().unwrap();
        assert_eq!(creds.password, "old-password");
        assert!(creds.port > 0);
    }

    #[tokio::test]
    async fn reset_rotates_password_and_wipes_data() {
        let f = node_fixture().await;
        let before = f.node.credentials().unwrap();
        f.node.reset().await.unwrap();

        let after = f.node.credentials().unwrap();
        assert_eq!(after.port, before.port);
        assert_ne!(after.password, before.password);
        assert_eq!(after.password.len(), 32);

        let data = f.dir.path().join("store");
        assert!(data.is_dir());
        assert!(!data.join("dump.rdb").exists());
        assert!(!data.join("appendonly.aof").exists());

        assert_eq!(f.units.stops(), 1);
        assert_eq!(f.units.starts(), 2);
        assert!(f.units.is_running("redis"));
    }

    #[tokio::test]
    async fn failed_start_is_reported() {
        let f = node_fixture().await;
        f.units.fail_next_starts(1);
        let err = f.node.reset().await.unwrap_err();
        assert!(matches!(err, AgentError::Unit(_)));
    }

    #[tokio::test]
    async fn unreadable_config_fails_credentials() {
        let f = node_fixture().await;
        std::fs::write(f.node.conf_path(), "port\n").unwrap();
        assert!(matches!(f.node.credentials(), Err(AgentError::Conf(_))));
    }
}
