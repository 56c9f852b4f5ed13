//! The capability both instance flavors expose to the broker.

use std::sync::Arc;

use async_trait::async_trait;
use cachefleet_core::{BindingCredentials, Instance, InvalidInstanceId};
use cachefleet_pool::{PoolError, RemoteNodePool};
use cachefleet_supervisor::SupervisorError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("no capacity left for a new instance")]
    PoolExhausted,

    #[error("instance {0} already exists")]
    DuplicateInstance(String),

    #[error("binding {binding_id} already exists for instance {instance_id}")]
    DuplicateBinding {
        instance_id: String,
        binding_id: String,
    },

    #[error("instance {0} not found")]
    InstanceNotFound(String),

    #[error("binding {binding_id} not found for instance {instance_id}")]
    BindingNotFound {
        instance_id: String,
        binding_id: String,
    },

    #[error(transparent)]
    InvalidInstanceId(#[from] InvalidInstanceId),

    #[error("remote node unavailable: {0}")]
    Remote(String),

    #[error("{0}")]
    Internal(String),
}

impl ProviderError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            ProviderError::InstanceNotFound(_) | ProviderError::BindingNotFound { .. }
        )
    }
}

impl From<PoolError> for ProviderError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::PoolExhausted => ProviderError::PoolExhausted,
            PoolError::DuplicateInstance(id) => ProviderError::DuplicateInstance(id),
            PoolError::DuplicateBinding {
                instance_id,
                binding_id,
            } => ProviderError::DuplicateBinding {
                instance_id,
                binding_id,
            },
            PoolError::InstanceNotFound(id) => ProviderError::InstanceNotFound(id),
            PoolError::BindingNotFound {
                instance_id,
                binding_id,
            } => ProviderError::BindingNotFound {
                instance_id,
                binding_id,
            },
            e @ PoolError::Agent { .. } => ProviderError::Remote(e.to_string()),
            other => ProviderError::Internal(other.to_string()),
        }
    }
}

impl From<SupervisorError> for ProviderError {
    fn from(e: SupervisorError) -> Self {
        match e {
            SupervisorError::InvalidId(e) => ProviderError::InvalidInstanceId(e),
            other => ProviderError::Internal(other.to_string()),
        }
    }
}

pub type ProviderResult<T> = Result<T, ProviderError>;

#[async_trait]
pub trait InstanceProvider: Send + Sync {
    async fn create(&self, instance_id: &str) -> ProviderResult<()>;
    async fn destroy(&self, instance_id: &str) -> ProviderResult<()>;
    async fn find(&self, instance_id: &str) -> ProviderResult<Option<Instance>>;
    async fn bind(&self, instance_id: &str, binding_id: &str) -> ProviderResult<BindingCredentials>;
    async fn unbind(&self, instance_id: &str, binding_id: &str) -> ProviderResult<()>;
}

/// Dedicated instances: one node of the remote pool each.
pub struct DedicatedProvider {
    pool: Arc<RemoteNodePool>,
}

impl DedicatedProvider {
    pub fn new(pool: Arc<RemoteNodePool>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl InstanceProvider for DedicatedProvider {
    async fn create(&self, instance_id: &str) -> ProviderResult<()> {
        self.pool.create(instance_id).await?;
        Ok(())
    }

    async fn destroy(&self, instance_id: &str) -> ProviderResult<()> {
        Ok(self.pool.destroy(instance_id).await?)
    }

    async fn find(&self, instance_id: &str) -> ProviderResult<Option<Instance>> {
        Ok(self.pool.find(instance_id).await)
    }

    async fn bind(&self, instance_id: &str, binding_id: &str) -> ProviderResult<BindingCredentials> {
        Ok(self.pool.bind(instance_id, binding_id).await?)
    }

    async fn unbind(&self, instance_id: &str, binding_id: &str) -> ProviderResult<()> {
        Ok(self.pool.unbind(instance_id, binding_id).await?)
    }
}
