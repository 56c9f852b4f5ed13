//! Admin client — the handful of commands cachefleet issues against a
//! cache server, over a multiplexed `redis` connection.
//!
//! Every command is bounded by the client's timeout.

use std::time::Duration;

use redis::aio::MultiplexedConnection;
use redis::{Client, ErrorKind, FromRedisValue, IntoConnectionInfo, RedisError};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("invalid address {address}: {source}")]
    Address { address: String, source: RedisError },

    #[error("failed to connect to {address}: {source}")]
    Connect { address: String, source: RedisError },

    #[error("{command} failed: {source}")]
    Command {
        command: &'static str,
        source: RedisError,
    },

    #[error("malformed {command} reply: {reason}")]
    Malformed {
        command: &'static str,
        reason: String,
    },

    #[error("{command} timed out after {timeout:?}")]
    Timeout {
        command: &'static str,
        timeout: Duration,
    },
}

pub type AdminResult<T> = Result<T, AdminError>;

/// The `INFO persistence` fields a backup waits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Persistence {
    pub bgsave_in_progress: bool,
    pub last_bgsave_ok: bool,
    /// Unix time of the last successful save.
    pub last_save_time: i64,
}

impl Persistence {
    /// Parse the `key:value` lines of an `INFO persistence` reply.
    pub fn parse(info: &str) -> AdminResult<Self> {
        let field = |name: &'static str| {
            info.lines()
                .filter_map(|line| line.trim_end().split_once(':'))
                .find(|(key, _)| *key == name)
                .map(|(_, value)| value)
                .ok_or_else(|| malformed(format!("missing {name}")))
        };
        let last_save_time = field("rdb_last_save_time")?;
        Ok(Self {
            bgsave_in_progress: field("rdb_bgsave_in_progress")? == "1",
            last_bgsave_ok: field("rdb_last_bgsave_status")? == "ok",
            last_save_time: last_save_time
                .parse()
                .map_err(|_| malformed(format!("rdb_last_save_time {last_save_time:?}")))?,
        })
    }
}

fn malformed(reason: String) -> AdminError {
    AdminError::Malformed {
        command: "INFO",
        reason,
    }
}

/// A short-lived admin connection to one cache server.
#[derive(Clone, Debug)]
pub struct AdminClient {
    connection: MultiplexedConnection,
    address: String,
    timeout: Duration,
}

impl AdminClient {
    /// Connect to `address` (`host:port`) and authenticate when `password`
    /// is given.
    pub async fn connect(
        address: &str,
        password: Option<&str>,
        timeout: Duration,
    ) -> AdminResult<Self> {
        let invalid = |source| AdminError::Address {
            address: address.to_string(),
            source,
        };
        let mut info = format!("redis://{address}/")
            .into_connection_info()
            .map_err(invalid)?;
        info.redis.password = password.filter(|p| !p.is_empty()).map(str::to_string);
        let client = Client::open(info).map_err(invalid)?;

        let connection = tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| AdminError::Timeout {
                command: "CONNECT",
                timeout,
            })?
            .map_err(|source| AdminError::Connect {
                address: address.to_string(),
                source,
            })?;
        debug!(%address, "admin connection established");
        Ok(Self {
            connection,
            address: address.to_string(),
            timeout,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn query<T: FromRedisValue>(&mut self, command: &'static str, args: &[&str]) -> AdminResult<T> {
        let mut cmd = redis::cmd(command);
        for arg in args {
            cmd.arg(*arg);
        }
        match tokio::time::timeout(self.timeout, cmd.query_async(&mut self.connection)).await {
            Err(_) => Err(AdminError::Timeout {
                command,
                timeout: self.timeout,
            }),
            Ok(result) => result.map_err(|source| AdminError::Command { command, source }),
        }
    }

    pub async fn ping(&mut self) -> AdminResult<()> {
        self.query("PING", &[]).await
    }

    /// Start a background snapshot. A save already in progress counts as
    /// started.
    pub async fn bgsave(&mut self) -> AdminResult<()> {
        match self.query::<()>("BGSAVE", &[]).await {
            Err(AdminError::Command { source, .. }) if save_in_progress(&source) => {
                debug!(address = %self.address, "background save already in progress");
                Ok(())
            }
            other => other,
        }
    }

    /// Unix time of the last successful snapshot. One-second resolution.
    pub async fn lastsave(&mut self) -> AdminResult<i64> {
        self.query("LASTSAVE", &[]).await
    }

    /// Snapshot state from `INFO persistence`.
    pub async fn persistence(&mut self) -> AdminResult<Persistence> {
        let info: String = self.query("INFO", &["persistence"]).await?;
        Persistence::parse(&info)
    }

    /// Number of keys in the selected database.
    pub async fn dbsize(&mut self) -> AdminResult<u64> {
        self.query("DBSIZE", &[]).await
    }
}

fn save_in_progress(e: &RedisError) -> bool {
    e.kind() == ErrorKind::ResponseError && e.to_string().contains("in progress")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockRedis;

    #[tokio::test]
    async fn authenticates_and_counts_keys() {
        let redis = MockRedis::start("secret").await;
        redis.set_keys(1000);

        let mut client = AdminClient::connect(&redis.address(), Some("secret"), Duration::from_secs(1))
            .await
            .unwrap();
        client.ping().await.unwrap();
        assert_eq!(client.dbsize().await.unwrap(), 1000);
    }

    #[tokio::test]
    async fn wrong_password_fails_to_connect() {
        let redis = MockRedis::start("secret").await;
        let err = AdminClient::connect(&redis.address(), Some("wrong"), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::Connect { .. }), "{err}");
    }

    #[tokio::test]
    async fn bgsave_advances_lastsave() {
        let redis = MockRedis::start("").await;
        let mut client = AdminClient::connect(&redis.address(), None, Duration::from_secs(1))
            .await
            .unwrap();

        let before = client.lastsave().await.unwrap();
        client.bgsave().await.unwrap();
        assert!(client.persistence().await.unwrap().bgsave_in_progress);
        tokio::time::sleep(Duration::from_millis(200)).await;
        let after = client.persistence().await.unwrap();
        assert!(!after.bgsave_in_progress);
        assert!(after.last_bgsave_ok);
        assert!(after.last_save_time > before);
        assert_eq!(client.lastsave().await.unwrap(), after.last_save_time);
    }

    #[tokio::test]
    async fn bgsave_during_a_save_counts_as_started() {
        let redis = MockRedis::start("").await;
        redis.stall_bgsave();
        let mut client = AdminClient::connect(&redis.address(), None, Duration::from_secs(1))
            .await
            .unwrap();
        client.bgsave().await.unwrap();
        client.bgsave().await.unwrap();
    }

    #[tokio::test]
    async fn failed_bgsave_is_a_command_error() {
        let redis = MockRedis::start("").await;
        redis.fail_bgsave();
        let mut client = AdminClient::connect(&redis.address(), None, Duration::from_secs(1))
            .await
            .unwrap();
        let err = client.bgsave().await.unwrap_err();
        assert!(matches!(err, AdminError::Command { command: "BGSAVE", .. }), "{err}");
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let err = AdminClient::connect("127.0.0.1:1", None, Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, AdminError::Connect { .. } | AdminError::Timeout { .. }));
    }

    #[test]
    fn parses_info_persistence() {
        let info = "# Persistence\r\nloading:0\r\nrdb_bgsave_in_progress:0\r\n\
                    rdb_last_save_time:1700000001\r\nrdb_last_bgsave_status:err\r\n";
        assert_eq!(
            Persistence::parse(info).unwrap(),
            Persistence {
                bgsave_in_progress: false,
                last_bgsave_ok: false,
                last_save_time: 1_700_000_001,
            }
        );
        assert!(matches!(
            Persistence::parse("# Persistence\r\nloading:0\r\n"),
            Err(AdminError::Malformed { .. })
        ));
    }
}
