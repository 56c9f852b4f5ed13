//! TCP port probe — readiness gate after starting a cache process.

use std::time::Duration;

use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::deadline::{DeadlineError, do_within};

/// Fixed dial cadence of the probe.
pub const PROBE_INTERVAL: Duration = Duration::from_millis(10);

/// Polls a TCP endpoint until it accepts a connection.
#[derive(Debug, Clone)]
pub struct PortProbe {
    address: String,
}

impl PortProbe {
    /// Probe `address` (`host:port`).
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Dial every [`PROBE_INTERVAL`] until a connection is accepted or
    /// `timeout` elapses. Accepted connections are closed immediately.
    pub async fn check(&self, timeout: Duration) -> Result<(), DeadlineError> {
        let address = self.address.clone();
        let result = do_within(timeout, move |mut terminate| async move {
            let mut attempts = 0u32;
            while !terminate.is_terminated() {
                attempts += 1;
                tokio::select! {
                    dialed = TcpStream::connect(&address) => match dialed {
                        Ok(stream) => {
                            drop(stream);
                            debug!(%address, attempts, "port accepted connection");
                            return;
                        }
                        Err(e) => trace!(%address, error = %e, "port not ready"),
                    },
                    _ = terminate.terminated() => return,
                }
                tokio::select! {
                    _ = tokio::time::sleep(PROBE_INTERVAL) => {}
                    _ = terminate.terminated() => return,
                }
            }
        })
        .await;

        if let Err(e) = &result {
            debug!(address = %self.address, error = %e, "port probe gave up");
        }
        result
    }
}
