//! cachefleetd — process plumbing shared by the cachefleet binaries.
//!
//! | Binary | Config env | Role |
//! |---|---|---|
//! | `cachefleet-broker` | `BROKER_CONFIG_PATH` | service broker API, node pool, consistency schedule |
//! | `cachefleet-agent` | `AGENT_CONFIG_PATH` | per-node credentials and factory reset |
//! | `cachefleet-monitor` | `MONITOR_CONFIG_PATH` | keeps shared instances running |
//! | `cachefleet-backup` | `BACKUP_CONFIG_PATH` | one backup run, nonzero exit on any failure |

use std::path::Path;

use anyhow::Context;
use cachefleet_core::config::{Validate, load};
use serde::de::DeserializeOwned;
use tokio::signal::unix::{SignalKind, signal};
use tracing::info;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_LOG_FILTER: &str = "info,cachefleet=debug";
pub const LOG_FORMAT_ENV: &str = "CACHEFLEET_LOG_FORMAT";

fn wants_json(format: Option<&str>) -> bool {
    format.is_some_and(|f| f.eq_ignore_ascii_case("json"))
}

/// Install the global subscriber. `RUST_LOG` overrides the default filter;
/// `CACHEFLEET_LOG_FORMAT=json` switches to JSON lines.
pub fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if wants_json(std::env::var(LOG_FORMAT_ENV).ok().as_deref()) {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Load and validate a role config.
pub fn load_config<T: DeserializeOwned + Validate>(path: &Path) -> anyhow::Result<T> {
    let config = load(path).with_context(|| format!("loading {}", path.display()))?;
    info!(path = %path.display(), "config loaded");
    Ok(config)
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() -> anyhow::Result<()> {
    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("installing SIGINT handler")?,
        _ = terminate.recv() => {}
    }
    info!("shutdown signal received");
    Ok(())
}
