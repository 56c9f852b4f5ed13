//! cachefleet-monitor — keeps every shared instance on this host running.
//!
//! SIGUSR1 toggles dormancy: a dormant monitor keeps ticking but leaves
//! instances alone.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use cachefleet_core::config::MonitorConfig;
use cachefleet_supervisor::{CommandUnitController, Layout, LocalSupervisor, ProcessMonitor};
use cachefleetd::{init_tracing, load_config, shutdown_signal};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::watch;
use tracing::info;

#[derive(Parser)]
#[command(name = "cachefleet-monitor", about = "cachefleet process monitor")]
struct Cli {
    /// Monitor config file (TOML).
    #[arg(long, env = "MONITOR_CONFIG_PATH")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config: MonitorConfig = load_config(&cli.config)?;

    let supervisor = LocalSupervisor::new(
        Layout::new(&config.redis.data_directory, &config.redis.log_directory),
        &config.redis.default_config_path,
        config.redis.start_timeout(),
        Arc::new(CommandUnitController::new(config.unit.clone())),
    );
    let monitor = Arc::new(ProcessMonitor::new(
        Arc::new(supervisor),
        config.check_interval(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Dormancy toggle.
    let mut usr1 = signal(SignalKind::user_defined1()).context("installing SIGUSR1 handler")?;
    let toggle_monitor = monitor.clone();
    let mut toggle_shutdown = shutdown_rx.clone();
    let toggle_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = usr1.recv() => {
                    toggle_monitor.toggle_dormancy();
                }
                _ = toggle_shutdown.changed() => break,
            }
        }
    });

    let run_monitor = monitor.clone();
    let mut monitor_handle = tokio::spawn(async move { run_monitor.run(shutdown_rx).await });

    // The monitor only returns on its own when instances cannot be listed.
    let early = tokio::select! {
        stop = shutdown_signal() => {
            stop?;
            None
        }
        joined = &mut monitor_handle => Some(joined),
    };
    let _ = shutdown_tx.send(true);
    let joined = match early {
        Some(joined) => joined,
        None => monitor_handle.await,
    };
    let _ = toggle_handle.await;
    joined.context("process monitor task")??;

    info!("process monitor stopped");
    Ok(())
}
