//! Client side of the agent protocol, used by the broker.

use std::time::Duration;

use async_trait::async_trait;
use cachefleet_core::Credentials;
use cachefleet_core::config::AgentClientConfig;
use cachefleet_redis::AdminClient;
use tracing::debug;

use crate::error::{AgentError, AgentResult};

/// Operations the broker performs against a node's agent.
#[async_trait]
pub trait NodeAgent: Send + Sync {
    /// `GET /`: the node's current cache credentials.
    async fn credentials(&self, host: &str) -> AgentResult<Credentials>;

    /// `DELETE /`: factory reset.
    async fn reset(&self, host: &str) -> AgentResult<()>;

    /// Credentials via `GET /`, then `DBSIZE` against the cache port.
    async fn key_count(&self, host: &str) -> AgentResult<u64>;
}

/// HTTP client for node agents, Basic credentials on every request.
#[derive(Debug, Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    port: u16,
    username: String,
    password: String,
    timeout: Duration,
}

impl AgentClient {
    pub fn new(config: &AgentClientConfig) -> AgentResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|source| AgentError::Transport {
                url: String::new(),
                source,
            })?;
        Ok(Self {
            http,
            port: config.port,
            username: config.username.clone(),
            password: config.password.clone(),
            timeout: config.request_timeout(),
        })
    }

    fn url(&self, host: &str) -> String {
        format!("http://{host}:{}/", self.port)
    }

    async fn send(&self, host: &str, method: reqwest::Method) -> AgentResult<reqwest::Response> {
        let url = self.url(host);
        debug!(%host, %method, "agent request");
        let resp = self
            .http
            .request(method, &url)
            .basic_auth(&self.username, Some(&self.password))
            .send()
            .await
            .map_err(|source| AgentError::Transport { url, source })?;

        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(AgentError::Remote {
            host: host.to_string(),
            status: status.as_u16(),
            body: body.trim().to_string(),
        })
    }
}

#[async_trait]
impl NodeAgent for AgentClient {
    async fn credentials(&self, host: &str) -> AgentResult<Credentials> {
        let resp = self.send(host, reqwest::Method::GET).await?;
        resp.json::<Credentials>().await.map_err(|e| AgentError::Decode {
            host: host.to_string(),
            reason: e.to_string(),
        })
    }

    async fn reset(&self, host: &str) -> AgentResult<()> {
        self.send(host, reqwest::Method::DELETE).await?;
        Ok(())
    }

    async fn key_count(&self, host: &str) -> AgentResult<u64> {
        let credentials = self.credentials(host).await?;
        let address = format!("{host}:{}", credentials.port);
        let mut admin =
            AdminClient::connect(&address, Some(&credentials.password), self.timeout).await?;
        Ok(admin.dbsize().await?)
    }
}
