//! cachefleet-core — shared types and configuration for cachefleet.
//!
//! Every other crate in the workspace depends on this one for the
//! [`Instance`] record, credential types and the TOML configuration
//! records loaded by the role binaries.

pub mod config;
pub mod types;

pub use config::{ConfigError, ConfigResult, Validate};
pub use types::*;
