//! Init supervisor control — start and stop a named unit.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use cachefleet_core::config::UnitConfig;
use tokio::process::Command;
use tracing::{debug, info};

use crate::error::{SupervisorError, SupervisorResult};

/// Upper bound on a single start/stop command.
const COMMAND_TIMEOUT: Duration = Duration::from_secs(30);

/// Starts and stops cache server units. `config` is the instance's
/// effective config file.
#[async_trait]
pub trait UnitController: Send + Sync {
    async fn start(&self, unit: &str, config: &Path) -> SupervisorResult<()>;
    async fn stop(&self, unit: &str, config: &Path) -> SupervisorResult<()>;
}

/// Runs the configured init supervisor commands.
#[derive(Debug, Clone)]
pub struct CommandUnitController {
    config: UnitConfig,
}

impl CommandUnitController {
    pub fn new(config: UnitConfig) -> Self {
        Self { config }
    }

    async fn run(&self, template: &[String], unit: &str, config: &Path) -> SupervisorResult<()> {
        let args = render(template, unit, config);
        let command_line = args.join(" ");
        let Some((program, rest)) = args.split_first() else {
            return Err(SupervisorError::Unit {
                unit: unit.to_string(),
                command: command_line,
                reason: "empty command".into(),
            });
        };
        let failure = |reason: String| SupervisorError::Unit {
            unit: unit.to_string(),
            command: command_line.clone(),
            reason,
        };

        debug!(%unit, command = %command_line, "running unit command");
        let output = tokio::time::timeout(
            COMMAND_TIMEOUT,
            Command::new(program).args(rest).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| failure(format!("timed out after {COMMAND_TIMEOUT:?}")))?
        .map_err(|e| failure(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(failure(format!("{}: {}", output.status, stderr.trim())));
        }
        Ok(())
    }
}

#[async_trait]
impl UnitController for CommandUnitController {
    async fn start(&self, unit: &str, config: &Path) -> SupervisorResult<()> {
        self.run(&self.config.start_command, unit, config).await?;
        info!(%unit, "unit started");
        Ok(())
    }

    async fn stop(&self, unit: &str, config: &Path) -> SupervisorResult<()> {
        self.run(&self.config.stop_command, unit, config).await?;
        info!(%unit, "unit stopped");
        Ok(())
    }
}

/// Substitute `{unit}` and `{config}` in every argument.
fn render(template: &[String], unit: &str, config: &Path) -> Vec<String> {
    let config = config.to_string_lossy();
    template
        .iter()
        .map(|arg| arg.replace("{unit}", unit).replace("{config}", &config))
        .collect()
}
