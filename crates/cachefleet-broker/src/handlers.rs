//! Broker HTTP handlers.
//!
//! Errors answer `{"description": "..."}`. A missing instance or binding
//! is `410 Gone` when deleting and `404` everywhere else.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use cachefleet_core::validate_instance_id;
use cachefleet_pool::DebugSnapshot;
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::BrokerState;
use crate::catalog::PlanKind;
use crate::provider::{InstanceProvider, ProviderError};

#[derive(Serialize)]
struct ErrorBody {
    description: String,
}

fn error_response(status: StatusCode, description: impl Into<String>) -> Response {
    (
        status,
        Json(ErrorBody {
            description: description.into(),
        }),
    )
        .into_response()
}

fn empty(status: StatusCode) -> Response {
    (status, Json(serde_json::json!({}))).into_response()
}

/// Whether the operation removes something; changes the not-found status.
#[derive(Clone, Copy)]
enum Op {
    Create,
    Delete,
    Lookup,
}

fn provider_error(e: ProviderError, op: Op) -> Response {
    let status = match (&e, op) {
        (ProviderError::PoolExhausted, _) => StatusCode::INTERNAL_SERVER_ERROR,
        (ProviderError::DuplicateInstance(_) | ProviderError::DuplicateBinding { .. }, _) => {
            StatusCode::CONFLICT
        }
        (ProviderError::InvalidInstanceId(_), _) => StatusCode::BAD_REQUEST,
        (e, Op::Delete) if e.is_not_found() => StatusCode::GONE,
        (e, Op::Create | Op::Lookup) if e.is_not_found() => StatusCode::NOT_FOUND,
        (ProviderError::Remote(_), _) => StatusCode::SERVICE_UNAVAILABLE,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(error = %e, status = status.as_u16(), "broker operation failed");
    } else {
        warn!(error = %e, status = status.as_u16(), "broker operation rejected");
    }
    error_response(status, e.to_string())
}

fn check_instance_id(instance_id: &str) -> Result<(), Response> {
    validate_instance_id(instance_id).map_err(|e| provider_error(e.into(), Op::Lookup))
}

impl BrokerState {
    fn provider(&self, kind: PlanKind) -> Option<&Arc<dyn InstanceProvider>> {
        match kind {
            PlanKind::Shared => self.shared.as_ref(),
            PlanKind::Dedicated => self.dedicated.as_ref(),
        }
    }

    fn provider_for_plan(&self, plan_id: &str) -> Result<&Arc<dyn InstanceProvider>, Response> {
        self.catalog
            .plan_kind(&self.catalog_config, plan_id)
            .and_then(|kind| self.provider(kind))
            .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, format!("unknown plan {plan_id}")))
    }

    /// The provider named by `plan_id`, or the one that knows the instance.
    async fn provider_for_instance(
        &self,
        plan_id: Option<&str>,
        instance_id: &str,
    ) -> Result<Option<&Arc<dyn InstanceProvider>>, Response> {
        if let Some(plan_id) = plan_id {
            return self.provider_for_plan(plan_id).map(Some);
        }
        for provider in [self.shared.as_ref(), self.dedicated.as_ref()].into_iter().flatten() {
            match provider.find(instance_id).await {
                Ok(Some(_)) => return Ok(Some(provider)),
                Ok(None) => {}
                Err(e) => return Err(provider_error(e, Op::Lookup)),
            }
        }
        Ok(None)
    }

    /// Instance ids are unique across plans: refuse an id another provider
    /// already holds.
    async fn reject_if_elsewhere(
        &self,
        chosen: &Arc<dyn InstanceProvider>,
        instance_id: &str,
    ) -> Result<(), Response> {
        for other in [self.shared.as_ref(), self.dedicated.as_ref()].into_iter().flatten() {
            if Arc::ptr_eq(other, chosen) {
                continue;
            }
            match other.find(instance_id).await {
                Ok(None) => {}
                Ok(Some(_)) => {
                    return Err(provider_error(
                        ProviderError::DuplicateInstance(instance_id.to_string()),
                        Op::Create,
                    ));
                }
                Err(e) => return Err(provider_error(e, Op::Lookup)),
            }
        }
        Ok(())
    }
}

// ── Catalog ────────────────────────────────────────────────────────

/// GET /v2/catalog
pub async fn catalog(State(state): State<BrokerState>) -> impl IntoResponse {
    Json(state.catalog.as_ref().clone())
}

// ── Instances ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct ProvisionRequest {
    #[serde(default)]
    pub service_id: Option<String>,
    pub plan_id: String,
}

/// PUT /v2/service_instances/{id}
pub async fn provision(
    State(state): State<BrokerState>,
    Path(instance_id): Path<String>,
    Json(req): Json<ProvisionRequest>,
) -> Response {
    if let Err(resp) = check_instance_id(&instance_id) {
        return resp;
    }
    let provider = match state.provider_for_plan(&req.plan_id) {
        Ok(provider) => provider,
        Err(resp) => return resp,
    };
    if let Err(resp) = state.reject_if_elsewhere(provider, &instance_id).await {
        return resp;
    }
    match provider.create(&instance_id).await {
        Ok(()) => {
            info!(%instance_id, plan_id = %req.plan_id, "instance provisioned");
            empty(StatusCode::CREATED)
        }
        Err(e) => provider_error(e, Op::Create),
    }
}

/// DELETE /v2/service_instances/{id}
pub async fn deprovision(
    State(state): State<BrokerState>,
    Path(instance_id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = check_instance_id(&instance_id) {
        return resp;
    }
    let provider = match state
        .provider_for_instance(params.get("plan_id").map(String::as_str), &instance_id)
        .await
    {
        Ok(Some(provider)) => provider,
        Ok(None) => return provider_error(ProviderError::InstanceNotFound(instance_id), Op::Delete),
        Err(resp) => return resp,
    };
    match provider.destroy(&instance_id).await {
        Ok(()) => {
            info!(%instance_id, "instance deprovisioned");
            empty(StatusCode::OK)
        }
        Err(e) => provider_error(e, Op::Delete),
    }
}

// ── Bindings ───────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct BindRequest {
    #[serde(default)]
    pub service_id: Option<String>,
    #[serde(default)]
    pub plan_id: Option<String>,
    #[serde(default)]
    pub app_guid: Option<String>,
}

/// PUT /v2/service_instances/{id}/service_bindings/{binding_id}
pub async fn bind(
    State(state): State<BrokerState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    Json(req): Json<BindRequest>,
) -> Response {
    if let Err(resp) = check_instance_id(&instance_id) {
        return resp;
    }
    let provider = match state
        .provider_for_instance(req.plan_id.as_deref(), &instance_id)
        .await
    {
        Ok(Some(provider)) => provider,
        Ok(None) => return provider_error(ProviderError::InstanceNotFound(instance_id), Op::Lookup),
        Err(resp) => return resp,
    };
    match provider.bind(&instance_id, &binding_id).await {
        Ok(credentials) => {
            info!(%instance_id, %binding_id, app_guid = ?req.app_guid, "binding created");
            (
                StatusCode::CREATED,
                Json(serde_json::json!({ "credentials": credentials })),
            )
                .into_response()
        }
        Err(e) => provider_error(e, Op::Create),
    }
}

/// DELETE /v2/service_instances/{id}/service_bindings/{binding_id}
pub async fn unbind(
    State(state): State<BrokerState>,
    Path((instance_id, binding_id)): Path<(String, String)>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Err(resp) = check_instance_id(&instance_id) {
        return resp;
    }
    let provider = match state
        .provider_for_instance(params.get("plan_id").map(String::as_str), &instance_id)
        .await
    {
        Ok(Some(provider)) => provider,
        Ok(None) => return provider_error(ProviderError::InstanceNotFound(instance_id), Op::Delete),
        Err(resp) => return resp,
    };
    match provider.unbind(&instance_id, &binding_id).await {
        Ok(()) => {
            info!(%instance_id, %binding_id, "binding removed");
            empty(StatusCode::OK)
        }
        Err(e) => provider_error(e, Op::Delete),
    }
}

// ── Extensions ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct HostQuery {
    pub host: String,
}

/// GET /instance?host=<ip>
pub async fn instance_for_host(
    State(state): State<BrokerState>,
    Query(query): Query<HostQuery>,
) -> Response {
    let found = match &state.pool {
        Some(pool) => pool.instance_id_for_host(&query.host).await,
        None => None,
    };
    match found {
        Some(instance_id) => Json(serde_json::json!({ "instance_id": instance_id })).into_response(),
        None => error_response(
            StatusCode::NOT_FOUND,
            format!("no instance allocated on {}", query.host),
        ),
    }
}

/// GET /debug
pub async fn debug(State(state): State<BrokerState>) -> Response {
    match &state.pool {
        Some(pool) => Json(DebugSnapshot::capture(pool).await).into_response(),
        None => error_response(StatusCode::NOT_FOUND, "no dedicated pool configured"),
    }
}
