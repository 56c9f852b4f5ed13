//! HTTP middleware shared by the agent and the broker.
//!
//! - [`require_basic_auth`] rejects requests without the configured
//!   Basic credentials with `401` and a `WWW-Authenticate` challenge.
//! - [`correlate`] wraps each request in a span carrying a correlation
//!   id, taken from `X-Correlation-Id` or generated.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use cachefleet_core::config::BasicAuthConfig;
use subtle::ConstantTimeEq;
use tracing::{Instrument, debug, info_span};

pub const CORRELATION_HEADER: &str = "x-correlation-id";

/// Credentials a request must present.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    expected: Arc<str>,
}

impl BasicAuth {
    pub fn new(username: &str, password: &str) -> Self {
        Self {
            expected: Arc::from(STANDARD.encode(format!("{username}:{password}"))),
        }
    }

    fn accepts(&self, headers: &HeaderMap) -> bool {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "))
            .is_some_and(|encoded| {
                bool::from(encoded.trim().as_bytes().ct_eq(self.expected.as_bytes()))
            })
    }
}

impl From<&BasicAuthConfig> for BasicAuth {
    fn from(config: &BasicAuthConfig) -> Self {
        Self::new(&config.username, &config.password)
    }
}

/// `axum::middleware::from_fn_with_state` handler enforcing [`BasicAuth`].
pub async fn require_basic_auth(
    State(auth): State<BasicAuth>,
    request: Request,
    next: Next,
) -> Response {
    if auth.accepts(request.headers()) {
        return next.run(request).await;
    }
    debug!(method = %request.method(), path = %request.uri().path(), "rejected unauthenticated request");
    (
        StatusCode::UNAUTHORIZED,
        [(
            header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"cachefleet\""),
        )],
        "Not Authorized",
    )
        .into_response()
}

/// `axum::middleware::from_fn` handler adding a correlation id span.
pub async fn correlate(request: Request, next: Next) -> Response {
    let correlation_id = request
        .headers()
        .get(CORRELATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(new_correlation_id);
    let span = info_span!(
        "request",
        correlation_id = %correlation_id,
        method = %request.method(),
        path = %request.uri().path(),
    );
    async move {
        let response = next.run(request).await;
        debug!(status = response.status().as_u16(), "request complete");
        response
    }
    .instrument(span)
    .await
}

fn new_correlation_id() -> String {
    let mut bytes = [0u8; 8];
    match getrandom::getrandom(&mut bytes) {
        Ok(()) => hex::encode(bytes),
        Err(_) => "unknown".into(),
    }
}
