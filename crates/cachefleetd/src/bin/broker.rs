//! cachefleet-broker — service broker for shared and dedicated cache instances.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use cachefleet_agent::{AgentClient, BasicAuth};
use cachefleet_broker::{BrokerState, InstanceProvider, SharedProvider, build_router};
use cachefleet_core::config::BrokerConfig;
use cachefleet_pool::{ConsistencyChecker, RemoteNodePool, StateFile};
use cachefleet_supervisor::{CommandUnitController, Layout, LocalSupervisor};
use cachefleetd::{init_tracing, load_config, shutdown_signal};
use clap::Parser;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "cachefleet-broker", about = "cachefleet service broker")]
struct Cli {
    /// Broker config file (TOML).
    #[arg(long, env = "BROKER_CONFIG_PATH")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config: BrokerConfig = load_config(&cli.config)?;

    // ── Dedicated pool ─────────────────────────────────────────

    let agent = Arc::new(AgentClient::new(&config.agent)?);
    let pool = if config.dedicated.nodes.is_empty() {
        info!("no dedicated nodes configured");
        None
    } else {
        let pool = RemoteNodePool::open(
            &config.dedicated.nodes,
            config.dedicated.port,
            StateFile::new(&config.dedicated.state_file),
            agent.clone(),
        )?;
        info!(nodes = config.dedicated.nodes.len(), "node pool opened");
        Some(Arc::new(pool))
    };

    if let (Some(pool), true) = (&pool, config.dedicated.reset_free_nodes_on_start) {
        for (host, e) in pool.reset_available().await {
            warn!(%host, error = %e, "startup reset failed");
        }
    }

    // ── Shared provider ────────────────────────────────────────

    let shared = config.shared.as_ref().map(|shared| {
        let supervisor = LocalSupervisor::new(
            Layout::new(&shared.redis.data_directory, &shared.redis.log_directory),
            &shared.redis.default_config_path,
            shared.redis.start_timeout(),
            Arc::new(CommandUnitController::new(shared.unit.clone())),
        );
        info!(host = %shared.host, max_instances = shared.max_instances, "shared provider configured");
        Arc::new(SharedProvider::new(
            Arc::new(supervisor),
            &shared.host,
            shared.max_instances,
        )) as Arc<dyn InstanceProvider>
    });

    // ── Background tasks ───────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consistency_handle = match (&pool, config.consistency.interval_seconds) {
        (Some(pool), interval) if interval > 0 => {
            let checker = ConsistencyChecker::new(
                pool.clone(),
                agent.clone(),
                Duration::from_secs(interval),
            );
            let shutdown = shutdown_rx.clone();
            Some(tokio::spawn(async move { checker.run(shutdown).await }))
        }
        _ => {
            info!("consistency schedule disabled");
            None
        }
    };

    // ── API server ─────────────────────────────────────────────

    let state = BrokerState::new(config.catalog.clone(), shared, pool);
    let router = build_router(state, BasicAuth::from(&config.auth));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "broker listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = shutdown_signal().await {
                error!(error = %e, "signal handling failed");
            }
            let _ = shutdown_tx.send(true);
        })
        .await?;

    if let Some(handle) = consistency_handle {
        let _ = handle.await;
    }
    info!("broker stopped");
    Ok(())
}
