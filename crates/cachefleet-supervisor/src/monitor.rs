//! Process monitor — background loop re-ensuring every local instance.
//!
//! Each tick enumerates the instances on disk and calls
//! [`LocalSupervisor::ensure_running`] for those without a `lock` marker.
//! Failures of a single instance are logged and the loop carries on;
//! failing to enumerate instances ends the loop with an error.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::SupervisorResult;
use crate::supervisor::LocalSupervisor;

/// Outcome of one pass over all instances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckReport {
    pub checked: usize,
    pub locked: usize,
    pub failed: usize,
}

pub struct ProcessMonitor {
    supervisor: Arc<LocalSupervisor>,
    interval: Duration,
    dormant: Arc<AtomicBool>,
}

impl ProcessMonitor {
    pub fn new(supervisor: Arc<LocalSupervisor>, interval: Duration) -> Self {
        Self {
            supervisor,
            interval,
            dormant: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flip dormancy. Returns the new state.
    pub fn toggle_dormancy(&self) -> bool {
        let dormant = !self.dormant.fetch_xor(true, Ordering::SeqCst);
        info!(dormant, "process monitor dormancy toggled");
        dormant
    }

    pub fn is_dormant(&self) -> bool {
        self.dormant.load(Ordering::SeqCst)
    }

    /// One pass over every instance on disk.
    pub async fn check_all(&self) -> SupervisorResult<CheckReport> {
        let mut report = CheckReport::default();
        for instance in self.supervisor.all_instances()? {
            if self.supervisor.layout().is_locked(&instance.id) {
                debug!(instance_id = %instance.id, "instance locked, skipping");
                report.locked += 1;
                continue;
            }
            report.checked += 1;
            if let Err(e) = self.supervisor.ensure_running(&instance).await {
                error!(instance_id = %instance.id, error = %e, "failed to ensure instance is running");
                report.failed += 1;
            }
        }
        Ok(report)
    }

    /// Tick until `shutdown` flips. Dormant ticks do nothing.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> SupervisorResult<()> {
        info!(interval = ?self.interval, "process monitor started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    if self.is_dormant() {
                        debug!("process monitor dormant");
                        continue;
                    }
                    let report = self.check_all().await?;
                    debug!(checked = report.checked, locked = report.locked, failed = report.failed, "process check complete");
                }
                _ = shutdown.changed() => {
                    info!("process monitor shutting down");
                    return Ok(());
                }
            }
        }
    }
}
