//! Agent HTTP server.
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | GET | `/` | `{"port", "password"}` of the node's cache server |
//! | DELETE | `/` | factory reset |
//!
//! Failures answer `500` with a plaintext diagnostic. Any other method or
//! path answers `404`.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use tracing::error;

use crate::http::{BasicAuth, correlate, require_basic_auth};
use crate::node::NodeRedis;

#[derive(Clone)]
pub struct AgentState {
    pub node: Arc<NodeRedis>,
}

/// Build the agent router behind Basic auth.
pub fn build_router(node: Arc<NodeRedis>, auth: BasicAuth) -> Router {
    Router::new()
        .route(
            "/",
            get(credentials).delete(reset).fallback(not_found),
        )
        .fallback(not_found)
        .with_state(AgentState { node })
        .layer(axum::middleware::from_fn_with_state(auth, require_basic_auth))
        .layer(axum::middleware::from_fn(correlate))
}

/// GET /
pub async fn credentials(State(state): State<AgentState>) -> Response {
    match state.node.credentials() {
        Ok(credentials) => Json(credentials).into_response(),
        Err(e) => {
            error!(error = %e, "failed to read credentials");
            plaintext_error(&e.to_string())
        }
    }
}

/// DELETE /
pub async fn reset(State(state): State<AgentState>) -> Response {
    match state.node.reset().await {
        Ok(()) => StatusCode::OK.into_response(),
        Err(e) => plaintext_error(&e.to_string()),
    }
}

async fn not_found() -> StatusCode {
    StatusCode::NOT_FOUND
}

fn plaintext_error(message: &str) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, message.to_string()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::tests::node_fixture;
    use axum::body::Body;
    use axum::http::{Method, Request, header};
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use cachefleet_core::Credentials;
    use tower::ServiceExt;

    fn request(method: Method, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(
                header::AUTHORIZATION,
                format!("Basic {}", STANDARD.encode("agent:agent-secret")),
            )
            .body(Body::empty())
            .unwrap()
    }

    async fn body_bytes(resp: Response) -> Vec<u8> {
        axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap()
            .to_vec()
    }

    fn router(node: Arc<NodeRedis>) -> Router {
        build_router(node, BasicAuth::new("agent", "agent-secret"))
    }

    #[tokio::test]
    async fn get_returns_credentials_as_json() {
        let f = node_fixture().await;
        let resp = router(f.node.clone())
            .oneshot(request(Method::GET, "/"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers()[header::CONTENT_TYPE],
            "application/json"
        );
        let creds: Credentials = serde_json::from_slice(&body_bytes(resp).await).unwrap();
        assert_eq!(creds.password, "old-password");
    }

    #[tokio::test]
    async fn delete_resets_then_get_returns_new_password() {
        let f = node_fixture().await;
        let app = router(f.node.clone());

        let resp = app.clone().oneshot(request(Method::DELETE, "/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(body_bytes(resp).await.is_empty());

        let conf = cachefleet_redis::RedisConf::load(f.node.conf_path()).unwrap();
        let rotated = conf.require_pass().unwrap().to_string();
        assert_ne!(rotated, "old-password");

        let resp = app.oneshot(request(Method::GET, "/")).await.unwrap();
        let creds: Credentials = serde_json::from_slice(&body_bytes(resp).await).unwrap();
        assert_eq!(creds.password, rotated);
    }

    #[tokio::test]
    async fn broken_config_is_plaintext_500() {
        let f = node_fixture().await;
        std::fs::write(f.node.conf_path(), "port\n").unwrap();
        let resp = router(f.node.clone())
            .oneshot(request(Method::GET, "/"))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = String::from_utf8(body_bytes(resp).await).unwrap();
        assert!(body.contains("no value"));
    }

    #[tokio::test]
    async fn other_methods_and_paths_are_404() {
        let f = node_fixture().await;
        let app = router(f.node.clone());
        let resp = app.clone().oneshot(request(Method::POST, "/")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        let resp = app.oneshot(request(Method::GET, "/other")).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_credentials_are_rejected() {
        let f = node_fixture().await;
        let req = Request::builder().uri("/").body(Body::empty()).unwrap();
        let resp = router(f.node.clone()).oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }
}
