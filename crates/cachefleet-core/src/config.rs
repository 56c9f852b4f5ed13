//! TOML configuration records for every cachefleet role.
//!
//! Each binary loads exactly one of [`BrokerConfig`], [`AgentConfig`],
//! [`MonitorConfig`] or [`BackupConfig`] via [`load`]. Durations are
//! expressed in whole seconds.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{DEFAULT_AGENT_PORT, DEFAULT_CACHE_PORT};

/// Errors raised while loading configuration. Always fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Implemented by every top-level config record.
pub trait Validate {
    fn validate(&self) -> ConfigResult<()>;
}

/// Read, parse and validate a TOML config file.
pub fn load<T: DeserializeOwned + Validate>(path: &Path) -> ConfigResult<T> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse(&content, path)
}

/// Parse and validate TOML text. `origin` is only used in error messages.
pub fn parse<T: DeserializeOwned + Validate>(content: &str, origin: &Path) -> ConfigResult<T> {
    let config: T = toml::from_str(content).map_err(|source| ConfigError::Parse {
        path: origin.to_path_buf(),
        source,
    })?;
    config.validate()?;
    Ok(config)
}

fn require(value: &str, name: &str) -> ConfigResult<()> {
    if value.trim().is_empty() {
        return Err(ConfigError::Invalid(format!("{name} must not be empty")));
    }
    Ok(())
}

// ── Shared sections ────────────────────────────────────────────────

/// HTTP Basic credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BasicAuthConfig {
    pub username: String,
    pub password: String,
}

impl BasicAuthConfig {
    fn validate(&self, section: &str) -> ConfigResult<()> {
        require(&self.username, &format!("{section}.username"))?;
        require(&self.password, &format!("{section}.password"))
    }
}

/// How the broker reaches node agents.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentClientConfig {
    #[serde(default = "default_agent_port")]
    pub port: u16,
    pub username: String,
    pub password: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,
}

impl AgentClientConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_seconds)
    }
}

/// Init supervisor commands. `{unit}` and `{config}` are substituted
/// in every argument before the command runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UnitConfig {
    pub start_command: Vec<String>,
    pub stop_command: Vec<String>,
}

impl Default for UnitConfig {
    fn default() -> Self {
        Self {
            start_command: vec!["monit".into(), "start".into(), "{unit}".into()],
            stop_command: vec!["monit".into(), "stop".into(), "{unit}".into()],
        }
    }
}

impl UnitConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.start_command.is_empty() || self.stop_command.is_empty() {
            return Err(ConfigError::Invalid(
                "unit.start_command and unit.stop_command must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// On-disk layout of locally supervised instances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisLayoutConfig {
    /// One directory per instance id lives here.
    pub data_directory: PathBuf,
    /// Per-instance log directories live here.
    pub log_directory: PathBuf,
    /// Config file every instance's effective config is derived from.
    pub default_config_path: PathBuf,
    #[serde(default = "default_start_timeout")]
    pub start_redis_timeout_seconds: u64,
}

impl RedisLayoutConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_redis_timeout_seconds)
    }
}

// ── Broker ─────────────────────────────────────────────────────────

/// Configuration of the service broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_listen")]
    pub listen_addr: String,
    pub auth: BasicAuthConfig,
    #[serde(default)]
    pub catalog: CatalogConfig,
    pub agent: AgentClientConfig,
    #[serde(default)]
    pub dedicated: DedicatedConfig,
    pub shared: Option<SharedConfig>,
    #[serde(default)]
    pub consistency: ConsistencyConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CatalogConfig {
    pub service_id: String,
    pub service_name: String,
    pub description: String,
    pub shared_plan_id: String,
    pub dedicated_plan_id: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            service_id: "cachefleet-service".into(),
            service_name: "p-redis".into(),
            description: "Redis service to provide a key-value store".into(),
            shared_plan_id: "cachefleet-shared-vm".into(),
            dedicated_plan_id: "cachefleet-dedicated-vm".into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DedicatedConfig {
    /// Worker node hosts, in allocation order.
    #[serde(default)]
    pub nodes: Vec<String>,
    #[serde(default = "default_cache_port")]
    pub port: u16,
    #[serde(default)]
    pub state_file: PathBuf,
    #[serde(default)]
    pub reset_free_nodes_on_start: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    #[serde(default = "default_shared_host")]
    pub host: String,
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    pub redis: RedisLayoutConfig,
    #[serde(default)]
    pub unit: UnitConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsistencyConfig {
    /// Zero disables the schedule.
    #[serde(default = "default_consistency_interval")]
    pub interval_seconds: u64,
}

impl Default for ConsistencyConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_consistency_interval(),
        }
    }
}

impl Validate for BrokerConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.auth.validate("auth")?;
        require(&self.agent.username, "agent.username")?;
        require(&self.agent.password, "agent.password")?;
        if self.catalog.shared_plan_id == self.catalog.dedicated_plan_id {
            return Err(ConfigError::Invalid(
                "catalog plan ids must be distinct".into(),
            ));
        }

        let mut seen = HashSet::new();
        for node in &self.dedicated.nodes {
            require(node, "dedicated.nodes[]")?;
            if !seen.insert(node.as_str()) {
                return Err(ConfigError::Invalid(format!(
                    "dedicated node {node} listed twice"
                )));
            }
        }
        if !self.dedicated.nodes.is_empty() && self.dedicated.state_file.as_os_str().is_empty() {
            return Err(ConfigError::Invalid(
                "dedicated.state_file is required when nodes are configured".into(),
            ));
        }

        if let Some(shared) = &self.shared {
            require(&shared.host, "shared.host")?;
            shared.unit.validate()?;
        }
        Ok(())
    }
}

// ── Agent ──────────────────────────────────────────────────────────

/// Configuration of the per-node agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_listen")]
    pub listen_addr: String,
    pub auth: BasicAuthConfig,
    /// The node's cache server config file.
    pub redis_conf_path: PathBuf,
    /// Unit name known to the init supervisor.
    #[serde(default = "default_unit_name")]
    pub unit_name: String,
    #[serde(default)]
    pub unit: UnitConfig,
    #[serde(default = "default_start_timeout")]
    pub start_redis_timeout_seconds: u64,
}

impl AgentConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_secs(self.start_redis_timeout_seconds)
    }
}

impl Validate for AgentConfig {
    fn validate(&self) -> ConfigResult<()> {
        self.auth.validate("auth")?;
        require(&self.unit_name, "unit_name")?;
        self.unit.validate()
    }
}

// ── Process monitor ────────────────────────────────────────────────

/// Configuration of the local process monitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    #[serde(default = "default_check_interval")]
    pub process_check_interval_seconds: u64,
    #[serde(default = "default_shared_host")]
    pub host: String,
    pub redis: RedisLayoutConfig,
    #[serde(default)]
    pub unit: UnitConfig,
}

impl MonitorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.process_check_interval_seconds)
    }
}

impl Validate for MonitorConfig {
    fn validate(&self) -> ConfigResult<()> {
        if self.process_check_interval_seconds == 0 {
            return Err(ConfigError::Invalid(
                "process_check_interval_seconds must be positive".into(),
            ));
        }
        self.unit.validate()
    }
}

// ── Backup ─────────────────────────────────────────────────────────

/// Configuration of the backup tool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub bucket_name: String,
    #[serde(default)]
    pub endpoint_url: String,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default)]
    pub path_prefix: String,
    #[serde(default = "default_bg_save_timeout")]
    pub bg_save_timeout_seconds: u64,
    pub redis_data_directory: PathBuf,
    pub node_id: String,
    #[serde(default = "std::env::temp_dir")]
    pub staging_directory: PathBuf,
    /// Dedicated nodes ask the broker which instance they host.
    #[serde(default)]
    pub broker: Option<BrokerLookupConfig>,
}

/// Where a dedicated node's backup resolves its instance id
/// (`GET <url>/instance?host=<node_ip>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerLookupConfig {
    pub url: String,
    pub username: String,
    pub password: String,
    pub node_ip: String,
}

impl BackupConfig {
    pub fn bg_save_timeout(&self) -> Duration {
        Duration::from_secs(self.bg_save_timeout_seconds)
    }
}

impl Validate for BackupConfig {
    fn validate(&self) -> ConfigResult<()> {
        if !self.enabled {
            return Ok(());
        }
        require(&self.bucket_name, "bucket_name")?;
        require(&self.endpoint_url, "endpoint_url")?;
        require(&self.access_key, "access_key")?;
        require(&self.secret_key, "secret_key")?;
        require(&self.node_id, "node_id")?;
        if let Some(broker) = &self.broker {
            require(&broker.url, "broker.url")?;
            require(&broker.node_ip, "broker.node_ip")?;
        }
        if self.bg_save_timeout_seconds == 0 {
            return Err(ConfigError::Invalid(
                "bg_save_timeout_seconds must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ── Defaults ───────────────────────────────────────────────────────

fn default_agent_port() -> u16 {
    DEFAULT_AGENT_PORT
}

fn default_cache_port() -> u16 {
    DEFAULT_CACHE_PORT
}

fn default_request_timeout() -> u64 {
    10
}

fn default_start_timeout() -> u64 {
    10
}

fn default_bg_save_timeout() -> u64 {
    30
}

fn default_check_interval() -> u64 {
    10
}

fn default_consistency_interval() -> u64 {
    300
}

fn default_max_instances() -> usize {
    10
}

fn default_broker_listen() -> String {
    "0.0.0.0:8080".into()
}

fn default_agent_listen() -> String {
    format!("0.0.0.0:{DEFAULT_AGENT_PORT}")
}

fn default_shared_host() -> String {
    "127.0.0.1".into()
}

fn default_unit_name() -> String {
    "redis".into()
}

fn default_region() -> String {
    "us-east-1".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BROKER: &str = r#"
[auth]
username = "admin"
password = "secret"

[agent]
username = "agent"
password = "agent-secret"

[dedicated]
nodes = ["10.0.0.1", "10.0.0.2"]
state_file = "/var/lib/cachefleet/state.json"
"#;

    #[test]
    fn broker_config_applies_defaults() {
        let config: BrokerConfig = parse(BROKER, Path::new("broker.toml")).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:8080");
        assert_eq!(config.agent.port, 9876);
        assert_eq!(config.agent.request_timeout(), Duration::from_secs(10));
        assert_eq!(config.dedicated.port, 6379);
        assert_eq!(config.consistency.interval_seconds, 300);
        assert!(config.shared.is_none());
    }

    #[test]
    fn broker_config_rejects_duplicate_nodes() {
        let text = BROKER.replace(r#""10.0.0.2""#, r#""10.0.0.1""#);
        let err = parse::<BrokerConfig>(&text, Path::new("broker.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("listed twice")));
    }

    #[test]
    fn broker_config_requires_state_file_for_nodes() {
        let text = BROKER.replace(r#"state_file = "/var/lib/cachefleet/state.json""#, "");
        let err = parse::<BrokerConfig>(&text, Path::new("broker.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn broker_config_missing_auth_is_parse_error() {
        let err = parse::<BrokerConfig>("listen_addr = \"x\"", Path::new("broker.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn disabled_backup_skips_validation() {
        let text = r#"
redis_data_directory = "/var/vcap/store/redis"
node_id = ""
"#;
        let config: BackupConfig = parse(text, Path::new("backup.toml")).unwrap();
        assert!(!config.enabled);
        assert_eq!(config.bg_save_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn enabled_backup_requires_bucket() {
        let text = r#"
enabled = true
endpoint_url = "http://s3.local"
access_key = "a"
secret_key = "s"
redis_data_directory = "/data"
node_id = "node-0"
"#;
        let err = parse::<BackupConfig>(text, Path::new("backup.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("bucket_name")));
    }

    #[test]
    fn monitor_config_rejects_zero_interval() {
        let text = r#"
process_check_interval_seconds = 0
[redis]
data_directory = "/data"
log_directory = "/logs"
default_config_path = "/etc/redis.conf"
"#;
        let err = parse::<MonitorConfig>(text, Path::new("monitor.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn agent_config_uses_default_unit_commands() {
        let text = r#"
redis_conf_path = "/var/vcap/store/redis/redis.conf"
[auth]
username = "agent"
password = "agent-secret"
"#;
        let config: AgentConfig = parse(text, Path::new("agent.toml")).unwrap();
        assert_eq!(config.listen_addr, "0.0.0.0:9876");
        assert_eq!(config.unit_name, "redis");
        assert_eq!(config.unit.start_command[0], "monit");
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = load::<AgentConfig>(&dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
