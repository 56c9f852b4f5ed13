//! In-memory [`NodeAgent`] for tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use cachefleet_core::{Credentials, DEFAULT_CACHE_PORT};

use crate::client::NodeAgent;
use crate::error::{AgentError, AgentResult};

#[derive(Debug, Default)]
struct State {
    passwords: HashMap<String, String>,
    key_counts: HashMap<String, u64>,
    failing: HashSet<String>,
    resets: Vec<String>,
    credential_requests: Vec<String>,
}

/// Records calls and answers from per-host tables. Hosts default to port
/// 6379 and password `pw-<host>`; a reset rotates the password and clears
/// the key count.
#[derive(Debug, Default)]
pub struct FakeAgent {
    state: Mutex<State>,
}

impl FakeAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call for `host` fails with a 500 until [`FakeAgent::recover`].
    pub fn fail(&self, host: &str) {
        self.lock().failing.insert(host.to_string());
    }

    pub fn recover(&self, host: &str) {
        self.lock().failing.remove(host);
    }

    pub fn set_key_count(&self, host: &str, keys: u64) {
        self.lock().key_counts.insert(host.to_string(), keys);
    }

    /// Hosts reset so far, in call order.
    pub fn resets(&self) -> Vec<String> {
        self.lock().resets.clone()
    }

    pub fn credential_requests(&self) -> Vec<String> {
        self.lock().credential_requests.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check(state: &State, host: &str) -> AgentResult<()> {
        if state.failing.contains(host) {
            return Err(AgentError::Remote {
                host: host.to_string(),
                status: 500,
                body: "injected failure".into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl NodeAgent for FakeAgent {
    async fn credentials(&self, host: &str) -> AgentResult<Credentials> {
        let mut state = self.lock();
        state.credential_requests.push(host.to_string());
        Self::check(&state, host)?;
        let password = state
            .passwords
            .get(host)
            .cloned()
            .unwrap_or_else(|| format!("pw-{host}"));
        Ok(Credentials {
            port: DEFAULT_CACHE_PORT,
            password,
        })
    }

    async fn reset(&self, host: &str) -> AgentResult<()> {
        let mut state = self.lock();
        state.resets.push(host.to_string());
        Self::check(&state, host)?;
        let generation = state.resets.iter().filter(|h| *h == host).count();
        state
            .passwords
            .insert(host.to_string(), format!("pw-{host}-{generation}"));
        state.key_counts.remove(host);
        Ok(())
    }

    async fn key_count(&self, host: &str) -> AgentResult<u64> {
        let state = self.lock();
        Self::check(&state, host)?;
        Ok(state.key_counts.get(host).copied().unwrap_or(0))
    }
}
