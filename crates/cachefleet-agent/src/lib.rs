//! cachefleet-agent — the per-node endpoint the broker talks to.
//!
//! Each worker node runs one agent next to its single cache server. The
//! agent reports the server's credentials and performs factory resets;
//! [`client::AgentClient`] is the broker's side of the same protocol.

pub mod client;
pub mod error;
pub mod http;
pub mod node;
pub mod server;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use client::{AgentClient, NodeAgent};
pub use error::{AgentError, AgentResult};
pub use http::{BasicAuth, correlate, require_basic_auth};
pub use node::{NodeRedis, ResetState};
pub use server::build_router;
