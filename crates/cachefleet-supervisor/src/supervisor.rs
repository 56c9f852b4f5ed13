//! Local supervisor — keeps each local instance's cache server running.
//!
//! Start sequence for an instance that is not running:
//!
//! 1. create data, db and log directories
//! 2. write the effective config: the default config overlaid with
//!    port, requirepass, dir, logfile and pidfile
//! 3. start the unit named after the instance
//! 4. probe the admin port until it accepts or the start timeout fires
//!
//! Steps 1–3 are retried once when the failure is transient. A probe
//! timeout is reported as [`SupervisorError::StartTimeout`].

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cachefleet_core::Instance;
use cachefleet_health::{PortProbe, process};
use cachefleet_redis::RedisConf;
use cachefleet_redis::conf::{DIR, LOGFILE, PIDFILE, PORT, REQUIRE_PASS};
use tracing::{debug, info, warn};

use crate::error::{SupervisorError, SupervisorResult};
use crate::layout::{InstancePaths, Layout};
use crate::unit::UnitController;

/// How long a killed process may take to leave the process table.
const KILL_TIMEOUT: Duration = Duration::from_secs(10);

pub struct LocalSupervisor {
    layout: Layout,
    default_config_path: PathBuf,
    start_timeout: Duration,
    units: Arc<dyn UnitController>,
}

impl LocalSupervisor {
    pub fn new(
        layout: Layout,
        default_config_path: impl Into<PathBuf>,
        start_timeout: Duration,
        units: Arc<dyn UnitController>,
    ) -> Self {
        Self {
            layout,
            default_config_path: default_config_path.into(),
            start_timeout,
            units,
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn all_instances(&self) -> SupervisorResult<Vec<Instance>> {
        self.layout.all_instances()
    }

    /// Whether the pidfile names a live process.
    pub fn is_running(&self, instance: &Instance) -> bool {
        let Ok(paths) = self.layout.paths(&instance.id) else {
            return false;
        };
        match process::read_pidfile(&paths.pidfile()) {
            Ok(pid) => process::is_alive(pid),
            Err(_) => false,
        }
    }

    /// Start the instance unless its process is alive.
    pub async fn ensure_running(&self, instance: &Instance) -> SupervisorResult<()> {
        if self.is_running(instance) {
            debug!(instance_id = %instance.id, "instance running");
            return Ok(());
        }
        info!(instance_id = %instance.id, port = instance.port, "instance not running, starting");
        self.start(instance).await
    }

    async fn start(&self, instance: &Instance) -> SupervisorResult<()> {
        let paths = retry_once(&instance.id, "create directories", || async {
            self.layout.ensure_dirs(&instance.id)
        })
        .await?;

        retry_once(&instance.id, "write config", || async {
            self.write_config(instance, &paths)
        })
        .await?;

        let config = paths.config();
        retry_once(&instance.id, "start unit", || {
            self.units.start(&instance.id, &config)
        })
        .await?;

        PortProbe::new(instance.address())
            .check(self.start_timeout)
            .await
            .map_err(|_| SupervisorError::StartTimeout {
                instance_id: instance.id.clone(),
                timeout: self.start_timeout,
            })?;

        info!(instance_id = %instance.id, address = %instance.address(), "instance accepting connections");
        Ok(())
    }

    fn write_config(&self, instance: &Instance, paths: &InstancePaths) -> SupervisorResult<()> {
        let mut conf = RedisConf::load(&self.default_config_path)?;
        conf.set(PORT, instance.port.to_string());
        conf.set(REQUIRE_PASS, instance.password.as_str());
        conf.set(DIR, paths.db_dir().to_string_lossy());
        conf.set(LOGFILE, paths.log_file().to_string_lossy());
        conf.set(PIDFILE, paths.pidfile().to_string_lossy());
        conf.save(&paths.config())?;
        Ok(())
    }

    /// SIGKILL the instance's process and wait for it to exit.
    pub async fn kill(&self, instance: &Instance) -> SupervisorResult<()> {
        let pid = process::read_pidfile(&self.layout.paths(&instance.id)?.pidfile())?;
        process::kill_and_wait(pid, KILL_TIMEOUT).await?;
        info!(instance_id = %instance.id, pid, "instance killed");
        Ok(())
    }

    /// Record a new instance and start it.
    pub async fn create(&self, instance: &Instance) -> SupervisorResult<()> {
        self.layout.write_record(instance)?;
        self.ensure_running(instance).await
    }

    /// Kill the instance if it runs and remove its directories.
    pub async fn destroy(&self, instance: &Instance) -> SupervisorResult<()> {
        if self.is_running(instance) {
            self.kill(instance).await?;
        }
        self.layout.remove(&instance.id)
    }
}

async fn retry_once<T, F, Fut>(instance_id: &str, step: &str, mut attempt: F) -> SupervisorResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SupervisorResult<T>>,
{
    match attempt().await {
        Err(e) if e.is_transient() => {
            warn!(%instance_id, step, error = %e, "start step failed, retrying once");
            attempt().await
        }
        other => other,
    }
}
