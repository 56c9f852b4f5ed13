//! Consistency schedule — periodic survey of node key counts.
//!
//! Free nodes have been reset and must hold zero keys; a free node with
//! keys is reported as drift. Allocated instances are surveyed too and
//! their counts logged at debug. Nothing is ever repaired.

use std::sync::Arc;
use std::time::Duration;

use cachefleet_agent::NodeAgent;
use cachefleet_core::Instance;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::pool::RemoteNodePool;

/// Result of one survey.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SurveyReport {
    /// Free nodes holding keys, with their counts.
    pub drifted: Vec<(Instance, u64)>,
    /// Nodes whose key count could not be read.
    pub unreachable: Vec<String>,
}

pub struct ConsistencyChecker {
    pool: Arc<RemoteNodePool>,
    agent: Arc<dyn NodeAgent>,
    interval: Duration,
}

impl ConsistencyChecker {
    pub fn new(pool: Arc<RemoteNodePool>, agent: Arc<dyn NodeAgent>, interval: Duration) -> Self {
        Self {
            pool,
            agent,
            interval,
        }
    }

    pub async fn survey(&self) -> SurveyReport {
        let doc = self.pool.snapshot().await;
        let mut report = SurveyReport::default();

        for node in &doc.available_instances {
            match self.agent.key_count(&node.host).await {
                Ok(0) => debug!(host = %node.host, "free node is empty"),
                Ok(keys) => {
                    warn!(
                        instance_id = %node.id,
                        host = %node.host,
                        port = node.port,
                        keys,
                        "free node holds keys after reset"
                    );
                    report.drifted.push((node.clone(), keys));
                }
                Err(e) => {
                    warn!(host = %node.host, error = %e, "failed to count keys on free node");
                    report.unreachable.push(node.host.clone());
                }
            }
        }

        for instance in &doc.allocated_instances {
            match self.agent.key_count(&instance.host).await {
                Ok(keys) => debug!(instance_id = %instance.id, host = %instance.host, keys, "allocated instance surveyed"),
                Err(e) => {
                    debug!(instance_id = %instance.id, host = %instance.host, error = %e, "failed to count keys");
                    report.unreachable.push(instance.host.clone());
                }
            }
        }
        report
    }

    /// Survey every interval until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "consistency schedule started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    let report = self.survey().await;
                    info!(
                        drifted = report.drifted.len(),
                        unreachable = report.unreachable.len(),
                        "consistency survey complete"
                    );
                }
                _ = shutdown.changed() => {
                    debug!("consistency schedule shutting down");
                    break;
                }
            }
        }
    }
}
