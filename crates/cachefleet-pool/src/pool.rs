//! Remote node pool — a static fleet of worker nodes handed out one
//! instance per node.
//!
//! Every mutation follows the same pattern under one mutex: clone the
//! current state, apply the change to the clone, persist the clone, then
//! swap it in. A failed persist leaves the in-memory state untouched.
//!
//! The mutex is held across agent calls for `create` and `destroy` only.
//! `bind` fetches credentials with the lock released and re-validates
//! before committing.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use cachefleet_agent::{AgentError, NodeAgent};
use cachefleet_core::{BindingCredentials, Instance};
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{PoolError, PoolResult};
use crate::state::{StateDocument, StateFile};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Slot {
    Free,
    Allocated(Instance),
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Node {
    host: String,
    slot: Slot,
}

#[derive(Debug, Clone, Default)]
struct PoolState {
    /// Configured order; allocation is first-fit over this list.
    nodes: Vec<Node>,
    bindings: BTreeMap<String, BTreeSet<String>>,
}

impl PoolState {
    fn position(&self, instance_id: &str) -> Option<usize> {
        self.nodes
            .iter()
            .position(|n| matches!(&n.slot, Slot::Allocated(i) if i.id == instance_id))
    }

    fn instance(&self, instance_id: &str) -> Option<&Instance> {
        self.position(instance_id).and_then(|idx| match &self.nodes[idx].slot {
            Slot::Allocated(instance) => Some(instance),
            Slot::Free => None,
        })
    }

    fn allocated(&self) -> impl Iterator<Item = &Instance> {
        self.nodes.iter().filter_map(|n| match &n.slot {
            Slot::Allocated(instance) => Some(instance),
            Slot::Free => None,
        })
    }

    fn free_hosts(&self) -> impl Iterator<Item = &str> {
        self.nodes
            .iter()
            .filter(|n| n.slot == Slot::Free)
            .map(|n| n.host.as_str())
    }

    fn document(&self, port: u16) -> StateDocument {
        StateDocument {
            available_instances: self
                .free_hosts()
                .map(|host| Instance::new("", host, port, ""))
                .collect(),
            allocated_instances: self.allocated().cloned().collect(),
            bindings: self.bindings.clone(),
        }
    }
}

pub struct RemoteNodePool {
    state: Mutex<PoolState>,
    store: StateFile,
    agent: Arc<dyn NodeAgent>,
    port: u16,
}

impl RemoteNodePool {
    /// Build the pool over `hosts`, restoring allocations from the state
    /// file when it exists.
    ///
    /// Allocated instances must sit on configured hosts and bindings must
    /// belong to allocated instances. Configured hosts the file does not
    /// mention start free.
    pub fn open(
        hosts: &[String],
        port: u16,
        store: StateFile,
        agent: Arc<dyn NodeAgent>,
    ) -> PoolResult<Self> {
        let mut state = PoolState {
            nodes: hosts
                .iter()
                .map(|host| Node {
                    host: host.clone(),
                    slot: Slot::Free,
                })
                .collect(),
            bindings: BTreeMap::new(),
        };

        if let Some(doc) = store.load()? {
            restore(&mut state, doc)?;
            info!(
                path = ?store.path(),
                allocated = state.allocated().count(),
                "pool state restored"
            );
        } else {
            info!(path = ?store.path(), nodes = hosts.len(), "no pool state found, all nodes free");
        }

        Ok(Self {
            state: Mutex::new(state),
            store,
            agent,
            port,
        })
    }

    async fn commit(&self, current: &mut PoolState, next: PoolState) -> PoolResult<()> {
        self.store.persist(next.document(self.port)).await?;
        *current = next;
        Ok(())
    }

    /// Reserve the lowest-index free node for `instance_id`.
    pub async fn create(&self, instance_id: &str) -> PoolResult<Instance> {
        let mut state = self.state.lock().await;
        if state.position(instance_id).is_some() {
            return Err(PoolError::DuplicateInstance(instance_id.to_string()));
        }
        let idx = state
            .nodes
            .iter()
            .position(|n| n.slot == Slot::Free)
            .ok_or(PoolError::PoolExhausted)?;

        let mut next = state.clone();
        let instance = Instance::new(instance_id, &next.nodes[idx].host, self.port, "");
        next.nodes[idx].slot = Slot::Allocated(instance.clone());
        self.commit(&mut state, next).await?;

        info!(%instance_id, host = %instance.host, "node allocated");
        Ok(instance)
    }

    /// Reset the instance's node, then free it and drop its bindings.
    /// A failed reset leaves the instance allocated.
    pub async fn destroy(&self, instance_id: &str) -> PoolResult<()> {
        let mut state = self.state.lock().await;
        let idx = state
            .position(instance_id)
            .ok_or_else(|| PoolError::InstanceNotFound(instance_id.to_string()))?;
        let host = state.nodes[idx].host.clone();

        self.agent
            .reset(&host)
            .await
            .map_err(|source| PoolError::Agent {
                host: host.clone(),
                source,
            })?;

        let mut next = state.clone();
        next.nodes[idx].slot = Slot::Free;
        next.bindings.remove(instance_id);
        self.commit(&mut state, next).await?;

        info!(%instance_id, %host, "node released");
        Ok(())
    }

    /// Record a binding and return the node's live credentials.
    pub async fn bind(&self, instance_id: &str, binding_id: &str) -> PoolResult<BindingCredentials> {
        let host = {
            let state = self.state.lock().await;
            check_bindable(&state, instance_id, binding_id)?;
            state
                .instance(instance_id)
                .map(|i| i.host.clone())
                .ok_or_else(|| PoolError::InstanceNotFound(instance_id.to_string()))?
        };

        let credentials = self
            .agent
            .credentials(&host)
            .await
            .map_err(|source| PoolError::Agent {
                host: host.clone(),
                source,
            })?;

        let mut state = self.state.lock().await;
        check_bindable(&state, instance_id, binding_id)?;
        let idx = state
            .position(instance_id)
            .ok_or_else(|| PoolError::InstanceNotFound(instance_id.to_string()))?;

        let mut next = state.clone();
        let instance = match &next.nodes[idx].slot {
            Slot::Allocated(current) if current.host == host => current.with_credentials(&credentials),
            // Destroyed and re-created on another node while unlocked.
            _ => return Err(PoolError::InstanceNotFound(instance_id.to_string())),
        };
        next.nodes[idx].slot = Slot::Allocated(instance.clone());
        next.bindings
            .entry(instance_id.to_string())
            .or_default()
            .insert(binding_id.to_string());
        self.commit(&mut state, next).await?;

        info!(%instance_id, %binding_id, %host, "binding created");
        Ok(BindingCredentials::from(&instance))
    }

    pub async fn unbind(&self, instance_id: &str, binding_id: &str) -> PoolResult<()> {
        let mut state = self.state.lock().await;
        if state.position(instance_id).is_none() {
            return Err(PoolError::InstanceNotFound(instance_id.to_string()));
        }
        let bound = state
            .bindings
            .get(instance_id)
            .is_some_and(|set| set.contains(binding_id));
        if !bound {
            return Err(PoolError::BindingNotFound {
                instance_id: instance_id.to_string(),
                binding_id: binding_id.to_string(),
            });
        }

        let mut next = state.clone();
        if let Some(set) = next.bindings.get_mut(instance_id) {
            set.remove(binding_id);
            if set.is_empty() {
                next.bindings.remove(instance_id);
            }
        }
        self.commit(&mut state, next).await?;

        info!(%instance_id, %binding_id, "binding removed");
        Ok(())
    }

    // ── Read-only projections ──────────────────────────────────────

    pub async fn find(&self, instance_id: &str) -> Option<Instance> {
        self.state.lock().await.instance(instance_id).cloned()
    }

    /// Allocated instances in node order.
    pub async fn all_instances(&self) -> Vec<Instance> {
        self.state.lock().await.allocated().cloned().collect()
    }

    /// Free nodes as id-less instances.
    pub async fn available_instances(&self) -> Vec<Instance> {
        self.state.lock().await.document(self.port).available_instances
    }

    pub async fn bindings_for_instance(&self, instance_id: &str) -> PoolResult<Vec<String>> {
        let state = self.state.lock().await;
        if state.position(instance_id).is_none() {
            return Err(PoolError::InstanceNotFound(instance_id.to_string()));
        }
        Ok(state
            .bindings
            .get(instance_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Id of the instance allocated on `host`, if any.
    pub async fn instance_id_for_host(&self, host: &str) -> Option<String> {
        let state = self.state.lock().await;
        state
            .nodes
            .iter()
            .find(|n| n.host == host)
            .and_then(|n| match &n.slot {
                Slot::Allocated(instance) => Some(instance.id.clone()),
                Slot::Free => None,
            })
    }

    /// Consistent copy of the persisted view.
    pub async fn snapshot(&self) -> StateDocument {
        self.state.lock().await.document(self.port)
    }

    /// Reset every free node concurrently. Returns the hosts that failed.
    pub async fn reset_available(&self) -> Vec<(String, AgentError)> {
        let hosts: Vec<String> = {
            let state = self.state.lock().await;
            state.free_hosts().map(str::to_string).collect()
        };
        info!(nodes = hosts.len(), "resetting free nodes");

        let mut resets = JoinSet::new();
        for host in hosts {
            let agent = Arc::clone(&self.agent);
            resets.spawn(async move {
                let result = agent.reset(&host).await;
                (host, result)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = resets.join_next().await {
            match joined {
                Ok((host, Ok(()))) => debug!(%host, "free node reset"),
                Ok((host, Err(e))) => {
                    warn!(%host, error = %e, "failed to reset free node");
                    failures.push((host, e));
                }
                Err(e) => warn!(error = %e, "reset task panicked"),
            }
        }
        failures.sort_by(|a, b| a.0.cmp(&b.0));
        failures
    }
}

fn check_bindable(state: &PoolState, instance_id: &str, binding_id: &str) -> PoolResult<()> {
    if state.position(instance_id).is_none() {
        return Err(PoolError::InstanceNotFound(instance_id.to_string()));
    }
    if state
        .bindings
        .get(instance_id)
        .is_some_and(|set| set.contains(binding_id))
    {
        return Err(PoolError::DuplicateBinding {
            instance_id: instance_id.to_string(),
            binding_id: binding_id.to_string(),
        });
    }
    Ok(())
}

fn restore(state: &mut PoolState, doc: StateDocument) -> PoolResult<()> {
    let mut seen = BTreeSet::new();
    for instance in doc.allocated_instances {
        if !seen.insert(instance.id.clone()) {
            return Err(PoolError::Inconsistent(format!(
                "instance {} allocated twice",
                instance.id
            )));
        }
        let node = state
            .nodes
            .iter_mut()
            .find(|n| n.host == instance.host)
            .ok_or_else(|| {
                PoolError::Inconsistent(format!(
                    "instance {} is on unconfigured host {}",
                    instance.id, instance.host
                ))
            })?;
        if node.slot != Slot::Free {
            return Err(PoolError::Inconsistent(format!(
                "host {} allocated twice",
                instance.host
            )));
        }
        node.slot = Slot::Allocated(instance);
    }

    for (instance_id, bindings) in doc.bindings {
        if !seen.contains(&instance_id) {
            return Err(PoolError::Inconsistent(format!(
                "bindings recorded for unallocated instance {instance_id}"
            )));
        }
        if !bindings.is_empty() {
            state.bindings.insert(instance_id, bindings);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cachefleet_agent::testing::FakeAgent;

    const HOSTS: [&str; 3] = ["10.0.0.1", "10.0.0.2", "10.0.0.3"];

    struct Fixture {
        dir: tempfile::TempDir,
        agent: Arc<FakeAgent>,
        pool: RemoteNodePool,
    }

    impl Fixture {
        fn state_path(&self) -> std::path::PathBuf {
            self.dir.path().join("state.json")
        }

        fn reopen(&self) -> RemoteNodePool {
            open(&self.state_path(), self.agent.clone())
        }

        fn persisted(&self) -> StateDocument {
            StateFile::new(self.state_path()).load().unwrap().unwrap()
        }
    }

    fn hosts() -> Vec<String> {
        HOSTS.iter().map(|h| h.to_string()).collect()
    }

    fn open(path: &std::path::Path, agent: Arc<FakeAgent>) -> RemoteNodePool {
        RemoteNodePool::open(&hosts(), 6379, StateFile::new(path), agent).unwrap()
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let agent = Arc::new(FakeAgent::new());
        let pool = open(&dir.path().join("state.json"), agent.clone());
        Fixture { dir, agent, pool }
    }

    async fn assert_partition(pool: &RemoteNodePool) {
        let mut hosts: Vec<String> = pool
            .all_instances()
            .await
            .into_iter()
            .chain(pool.available_instances().await)
            .map(|i| i.host)
            .collect();
        hosts.sort();
        assert_eq!(hosts, self::hosts());

        let doc = pool.snapshot().await;
        for instance_id in doc.bindings.keys() {
            assert!(doc.allocated_instances.iter().any(|i| &i.id == instance_id));
        }
    }

    #[tokio::test]
    async fn first_fit_until_exhausted() {
        let f = fixture();
        for (n, expected) in ["A", "B", "C"].iter().zip(HOSTS) {
            let instance = f.pool.create(&format!("inst-{n}")).await.unwrap();
            assert_eq!(instance.host, expected);
            assert_eq!(instance.port, 6379);
        }
        assert!(matches!(
            f.pool.create("inst-D").await,
            Err(PoolError::PoolExhausted)
        ));

        let doc = f.persisted();
        assert_eq!(doc.allocated_instances.len(), 3);
        assert!(doc.available_instances.is_empty());
        assert_partition(&f.pool).await;
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let f = fixture();
        f.pool.create("inst-A").await.unwrap();
        assert!(matches!(
            f.pool.create("inst-A").await,
            Err(PoolError::DuplicateInstance(id)) if id == "inst-A"
        ));
    }

    #[tokio::test]
    async fn bind_fetches_credentials_and_persists() {
        let f = fixture();
        f.pool.create("inst-A").await.unwrap();
        let creds = f.pool.bind("inst-A", "b1").await.unwrap();

        assert_eq!(f.agent.credential_requests(), vec!["10.0.0.1"]);
        assert_eq!(creds.host, "10.0.0.1");
        assert_eq!(creds.port, 6379);
        assert_eq!(creds.password, "pw-10.0.0.1");

        let doc = f.persisted();
        assert_eq!(
            doc.bindings,
            BTreeMap::from([("inst-A".to_string(), BTreeSet::from(["b1".to_string()]))])
        );
        assert_eq!(doc.allocated_instances[0].password, "pw-10.0.0.1");
    }

    #[tokio::test]
    async fn bind_errors() {
        let f = fixture();
        assert!(matches!(
            f.pool.bind("nope", "b1").await,
            Err(PoolError::InstanceNotFound(_))
        ));
        f.pool.create("inst-A").await.unwrap();
        f.pool.bind("inst-A", "b1").await.unwrap();
        assert!(matches!(
            f.pool.bind("inst-A", "b1").await,
            Err(PoolError::DuplicateBinding { .. })
        ));

        f.agent.fail("10.0.0.1");
        assert!(matches!(
            f.pool.bind("inst-A", "b2").await,
            Err(PoolError::Agent { .. })
        ));
        assert_eq!(f.pool.bindings_for_instance("inst-A").await.unwrap(), vec!["b1"]);
    }

    #[tokio::test]
    async fn unbind_removes_binding() {
        let f = fixture();
        f.pool.create("inst-A").await.unwrap();
        f.pool.bind("inst-A", "b1").await.unwrap();
        f.pool.bind("inst-A", "b2").await.unwrap();

        f.pool.unbind("inst-A", "b1").await.unwrap();
        assert_eq!(f.pool.bindings_for_instance("inst-A").await.unwrap(), vec!["b2"]);
        assert!(matches!(
            f.pool.unbind("inst-A", "b1").await,
            Err(PoolError::BindingNotFound { .. })
        ));
        assert!(matches!(
            f.pool.unbind("nope", "b2").await,
            Err(PoolError::InstanceNotFound(_))
        ));

        f.pool.unbind("inst-A", "b2").await.unwrap();
        assert!(f.persisted().bindings.is_empty());
    }

    #[tokio::test]
    async fn destroy_resets_and_frees_node() {
        let f = fixture();
        f.pool.create("inst-A").await.unwrap();
        f.pool.create("inst-B").await.unwrap();
        f.pool.bind("inst-A", "b1").await.unwrap();

        f.pool.destroy("inst-A").await.unwrap();
        assert_eq!(f.agent.resets(), vec!["10.0.0.1"]);
        assert!(f.pool.find("inst-A").await.is_none());
        assert!(f.persisted().bindings.is_empty());
        assert_partition(&f.pool).await;

        // The freed node is the first fit again.
        assert_eq!(f.pool.create("inst-C").await.unwrap().host, "10.0.0.1");
    }

    #[tokio::test]
    async fn failed_reset_keeps_instance_allocated() {
        let f = fixture();
        f.pool.create("inst-A").await.unwrap();
        f.agent.fail("10.0.0.1");
        assert!(matches!(
            f.pool.destroy("inst-A").await,
            Err(PoolError::Agent { .. })
        ));
        assert!(f.pool.find("inst-A").await.is_some());
        assert!(matches!(
            f.pool.destroy("nope").await,
            Err(PoolError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn persist_failure_rolls_back() {
        let f = fixture();
        f.pool.create("inst-A").await.unwrap();

        // Block the temp file path so the next save fails.
        std::fs::create_dir(f.dir.path().join("state.json.tmp")).unwrap();
        assert!(matches!(
            f.pool.create("inst-B").await,
            Err(PoolError::Persist { .. })
        ));
        assert!(f.pool.find("inst-B").await.is_none());
        assert_eq!(f.pool.available_instances().await.len(), 2);
    }

    #[tokio::test]
    async fn state_survives_reopen() {
        let f = fixture();
        f.pool.create("inst-A").await.unwrap();
        f.pool.create("inst-B").await.unwrap();
        f.pool.bind("inst-B", "b1").await.unwrap();

        let reopened = f.reopen();
        assert_eq!(reopened.instance_id_for_host("10.0.0.2").await.as_deref(), Some("inst-B"));
        assert_eq!(reopened.instance_id_for_host("10.0.0.3").await, None);
        assert_eq!(reopened.bindings_for_instance("inst-B").await.unwrap(), vec!["b1"]);
        assert_eq!(reopened.create("inst-C").await.unwrap().host, "10.0.0.3");
    }

    #[tokio::test]
    async fn state_on_unknown_host_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(
            &path,
            r#"{"available_instances":[],"allocated_instances":[{"ID":"x","Host":"10.9.9.9","Port":6379}],"bindings":{}}"#,
        )
        .unwrap();
        let result = RemoteNodePool::open(
            &hosts(),
            6379,
            StateFile::new(&path),
            Arc::new(FakeAgent::new()),
        );
        assert!(matches!(result, Err(PoolError::Inconsistent(_))));
    }

    #[tokio::test]
    async fn reset_available_reports_failures() {
        let f = fixture();
        f.pool.create("inst-A").await.unwrap();
        f.agent.fail("10.0.0.3");

        let failures = f.pool.reset_available().await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, "10.0.0.3");

        let mut reset = f.agent.resets();
        reset.sort();
        assert_eq!(reset, vec!["10.0.0.2", "10.0.0.3"]);
    }
}
