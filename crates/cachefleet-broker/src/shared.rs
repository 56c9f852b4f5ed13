//! Shared instances: many cache servers on this host, told apart by port.
//!
//! Each instance is an `instance.json` record under the supervisor's data
//! root. Bindings are not recorded; every bind hands out the instance's
//! own credentials.

use std::net::TcpListener;
use std::sync::Arc;

use async_trait::async_trait;
use cachefleet_core::{BindingCredentials, Instance, generate_password};
use cachefleet_supervisor::LocalSupervisor;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::provider::{InstanceProvider, ProviderError, ProviderResult};

pub struct SharedProvider {
    supervisor: Arc<LocalSupervisor>,
    host: String,
    max_instances: usize,
    /// Serializes capacity checks with record creation.
    create_lock: Mutex<()>,
}

impl SharedProvider {
    pub fn new(supervisor: Arc<LocalSupervisor>, host: impl Into<String>, max_instances: usize) -> Self {
        Self {
            supervisor,
            host: host.into(),
            max_instances,
            create_lock: Mutex::new(()),
        }
    }

    fn record_exists(&self, instance_id: &str) -> ProviderResult<bool> {
        Ok(self.supervisor.layout().paths(instance_id)?.record().is_file())
    }

    fn require(&self, instance_id: &str) -> ProviderResult<Instance> {
        if !self.record_exists(instance_id)? {
            return Err(ProviderError::InstanceNotFound(instance_id.to_string()));
        }
        Ok(self.supervisor.layout().read_record(instance_id)?)
    }
}

/// An ephemeral port the kernel considers free right now.
fn free_port() -> ProviderResult<u16> {
    let listener = TcpListener::bind("127.0.0.1:0")
        .map_err(|e| ProviderError::Internal(format!("free port search failed: {e}")))?;
    let port = listener
        .local_addr()
        .map_err(|e| ProviderError::Internal(format!("free port search failed: {e}")))?
        .port();
    Ok(port)
}

#[async_trait]
impl InstanceProvider for SharedProvider {
    async fn create(&self, instance_id: &str) -> ProviderResult<()> {
        let _guard = self.create_lock.lock().await;
        if self.record_exists(instance_id)? {
            return Err(ProviderError::DuplicateInstance(instance_id.to_string()));
        }
        let existing = self.supervisor.all_instances()?.len();
        if existing >= self.max_instances {
            warn!(%instance_id, existing, max = self.max_instances, "shared host is full");
            return Err(ProviderError::PoolExhausted);
        }

        let password = generate_password()
            .map_err(|e| ProviderError::Internal(format!("password generation failed: {e}")))?;
        let instance = Instance::new(instance_id, &self.host, free_port()?, &password);
        if let Err(e) = self.supervisor.create(&instance).await {
            if let Err(cleanup) = self.supervisor.destroy(&instance).await {
                warn!(%instance_id, error = %cleanup, "failed to clean up after failed create");
            }
            return Err(e.into());
        }
        info!(%instance_id, port = instance.port, "shared instance created");
        Ok(())
    }

    async fn destroy(&self, instance_id: &str) -> ProviderResult<()> {
        let instance = self.require(instance_id)?;
        self.supervisor.destroy(&instance).await?;
        info!(%instance_id, "shared instance destroyed");
        Ok(())
    }

    async fn find(&self, instance_id: &str) -> ProviderResult<Option<Instance>> {
        if !self.record_exists(instance_id)? {
            return Ok(None);
        }
        Ok(Some(self.supervisor.layout().read_record(instance_id)?))
    }

    async fn bind(&self, instance_id: &str, _binding_id: &str) -> ProviderResult<BindingCredentials> {
        let instance = self.require(instance_id)?;
        Ok(BindingCredentials::from(&instance))
    }

    async fn unbind(&self, instance_id: &str, _binding_id: &str) -> ProviderResult<()> {
        self.require(instance_id).map(|_| ())
    }
}
