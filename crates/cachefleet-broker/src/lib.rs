//! cachefleet-broker — service broker API for cache instances.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/v2/catalog` | Service and plans |
//! | PUT | `/v2/service_instances/{id}` | Provision (plan from body) |
//! | DELETE | `/v2/service_instances/{id}` | Deprovision |
//! | PUT | `/v2/service_instances/{id}/service_bindings/{bid}` | Bind, returns credentials |
//! | DELETE | `/v2/service_instances/{id}/service_bindings/{bid}` | Unbind |
//! | GET | `/instance?host=<ip>` | Instance allocated on a node |
//! | GET | `/debug` | Pool snapshot |
//!
//! Every route requires HTTP Basic auth.

pub mod catalog;
pub mod handlers;
pub mod provider;
pub mod shared;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, put};
use cachefleet_agent::{BasicAuth, correlate, require_basic_auth};
use cachefleet_core::config::CatalogConfig;
use cachefleet_pool::RemoteNodePool;

pub use catalog::{Catalog, PlanKind};
pub use provider::{DedicatedProvider, InstanceProvider, ProviderError, ProviderResult};
pub use shared::SharedProvider;

/// Shared state for broker handlers.
#[derive(Clone)]
pub struct BrokerState {
    pub catalog: Arc<Catalog>,
    pub catalog_config: Arc<CatalogConfig>,
    pub shared: Option<Arc<dyn InstanceProvider>>,
    pub dedicated: Option<Arc<dyn InstanceProvider>>,
    pub pool: Option<Arc<RemoteNodePool>>,
}

impl BrokerState {
    /// Wire the configured providers. The dedicated provider is backed by
    /// `pool`.
    pub fn new(
        catalog_config: CatalogConfig,
        shared: Option<Arc<dyn InstanceProvider>>,
        pool: Option<Arc<RemoteNodePool>>,
    ) -> Self {
        let dedicated = pool
            .clone()
            .map(|pool| Arc::new(DedicatedProvider::new(pool)) as Arc<dyn InstanceProvider>);
        let catalog = Catalog::new(&catalog_config, shared.is_some(), dedicated.is_some());
        Self {
            catalog: Arc::new(catalog),
            catalog_config: Arc::new(catalog_config),
            shared,
            dedicated,
            pool,
        }
    }
}

/// Build the broker router behind Basic auth.
pub fn build_router(state: BrokerState, auth: BasicAuth) -> Router {
    Router::new()
        .route("/v2/catalog", get(handlers::catalog))
        .route(
            "/v2/service_instances/{id}",
            put(handlers::provision).delete(handlers::deprovision),
        )
        .route(
            "/v2/service_instances/{id}/service_bindings/{binding_id}",
            put(handlers::bind).delete(handlers::unbind),
        )
        .route("/instance", get(handlers::instance_for_host))
        .route("/debug", get(handlers::debug))
        .with_state(state)
        .layer(axum::middleware::from_fn_with_state(auth, require_basic_auth))
        .layer(axum::middleware::from_fn(correlate))
}
