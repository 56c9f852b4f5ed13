//! cachefleet-redis — the cache server as seen from the outside.
//!
//! Two ways in: the on-disk `redis.conf` ([`conf::RedisConf`]) and an
//! admin connection over the `redis` crate ([`admin::AdminClient`]). The
//! `testing` feature adds a mock server other crates use in their tests.

pub mod admin;
pub mod conf;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use admin::{AdminClient, AdminError, AdminResult, Persistence};
pub use conf::{ConfError, ConfResult, Directive, RedisConf};
