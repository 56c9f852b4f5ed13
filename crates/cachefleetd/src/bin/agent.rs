//! cachefleet-agent — per-node credentials and factory reset endpoint.

use std::path::PathBuf;
use std::sync::Arc;

use cachefleet_agent::{BasicAuth, NodeRedis, build_router};
use cachefleet_core::config::AgentConfig;
use cachefleet_supervisor::CommandUnitController;
use cachefleetd::{init_tracing, load_config, shutdown_signal};
use clap::Parser;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "cachefleet-agent", about = "cachefleet node agent")]
struct Cli {
    /// Agent config file (TOML).
    #[arg(long, env = "AGENT_CONFIG_PATH")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config: AgentConfig = load_config(&cli.config)?;

    let node = NodeRedis::new(
        &config.redis_conf_path,
        &config.unit_name,
        Arc::new(CommandUnitController::new(config.unit.clone())),
        config.start_timeout(),
    );
    let router = build_router(Arc::new(node), BasicAuth::from(&config.auth));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, conf = %config.redis_conf_path.display(), "agent listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = shutdown_signal().await {
                error!(error = %e, "signal handling failed");
            }
        })
        .await?;

    info!("agent stopped");
    Ok(())
}
