//! Debug snapshot — read-only JSON view of the pool.

use serde::{Deserialize, Serialize};

use crate::pool::RemoteNodePool;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DebugSnapshot {
    pub pool: PoolView,
    pub allocated: AllocatedView,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolView {
    /// Every configured node, free or allocated.
    pub count: usize,
    /// One single-host cluster per free node.
    pub clusters: Vec<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedView {
    pub count: usize,
    pub clusters: Vec<AllocatedCluster>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedCluster {
    pub id: String,
    pub hosts: Vec<String>,
    pub bindings: Vec<String>,
}

impl DebugSnapshot {
    pub async fn capture(pool: &RemoteNodePool) -> Self {
        let doc = pool.snapshot().await;
        let free: Vec<Vec<String>> = doc
            .available_instances
            .iter()
            .map(|node| vec![node.host.clone()])
            .collect();
        let allocated: Vec<AllocatedCluster> = doc
            .allocated_instances
            .iter()
            .map(|instance| AllocatedCluster {
                id: instance.id.clone(),
                hosts: vec![instance.host.clone()],
                bindings: doc
                    .bindings
                    .get(&instance.id)
                    .map(|set| set.iter().cloned().collect())
                    .unwrap_or_default(),
            })
            .collect();

        Self {
            pool: PoolView {
                count: free.len() + allocated.len(),
                clusters: free,
            },
            allocated: AllocatedView {
                count: allocated.len(),
                clusters: allocated,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::StateFile;
    use cachefleet_agent::testing::FakeAgent;
    use std::sync::Arc;

    #[tokio::test]
    async fn snapshot_counts_both_sides() {
        let dir = tempfile::tempdir().unwrap();
        let hosts: Vec<String> = ["10.0.0.1", "10.0.0.2", "10.0.0.3"]
            .iter()
            .map(|h| h.to_string())
            .collect();
        let pool = RemoteNodePool::open(
            &hosts,
            6379,
            StateFile::new(dir.path().join("state.json")),
            Arc::new(FakeAgent::new()),
        )
        .unwrap();
        pool.create("inst-A").await.unwrap();
        pool.bind("inst-A", "b1").await.unwrap();

        let json = serde_json::to_value(DebugSnapshot::capture(&pool).await).unwrap();
        assert_eq!(json["pool"]["count"], 3);
        assert_eq!(
            json["pool"]["clusters"],
            serde_json::json!([["10.0.0.2"], ["10.0.0.3"]])
        );
        assert_eq!(json["allocated"]["count"], 1);
        assert_eq!(
            json["allocated"]["clusters"][0],
            serde_json::json!({"id": "inst-A", "hosts": ["10.0.0.1"], "bindings": ["b1"]})
        );
    }
}
