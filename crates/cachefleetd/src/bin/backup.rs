//! cachefleet-backup — snapshot every instance on this host to object storage.
//!
//! Exits nonzero when any instance failed.

use std::path::PathBuf;
use std::sync::Arc;

use cachefleet_backup::{BackupRunner, S3Credentials, S3Store};
use cachefleet_core::config::BackupConfig;
use cachefleetd::{init_tracing, load_config};
use clap::Parser;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "cachefleet-backup", about = "cachefleet backup run")]
struct Cli {
    /// Backup config file (TOML).
    #[arg(long, env = "BACKUP_CONFIG_PATH")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config: BackupConfig = load_config(&cli.config)?;
    if !config.enabled {
        info!("backups disabled, nothing to do");
        return Ok(());
    }

    let store = S3Store::new(
        &config.endpoint_url,
        S3Credentials {
            access_key: config.access_key.clone(),
            secret_key: config.secret_key.clone(),
            region: config.region.clone(),
        },
    )?;
    let report = BackupRunner::new(config, Arc::new(store)).run().await?;

    if !report.is_success() {
        for (instance_id, e) in &report.failed {
            error!(%instance_id, error = %e, "instance not backed up");
        }
        anyhow::bail!(
            "{} of {} backups failed",
            report.failed.len(),
            report.failed.len() + report.succeeded.len()
        );
    }
    Ok(())
}
