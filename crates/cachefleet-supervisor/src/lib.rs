//! cachefleet-supervisor — keeps locally hosted cache servers running.
//!
//! Instances live one per directory under a data root ([`layout`]). The
//! [`supervisor::LocalSupervisor`] materializes an instance's config and
//! starts it through the init supervisor ([`unit`]); the
//! [`monitor::ProcessMonitor`] re-ensures every instance on a timer.

pub mod error;
pub mod layout;
pub mod monitor;
pub mod supervisor;
pub mod unit;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{SupervisorError, SupervisorResult};
pub use layout::{InstancePaths, Layout};
pub use monitor::{CheckReport, ProcessMonitor};
pub use supervisor::LocalSupervisor;
pub use unit::{CommandUnitController, UnitController};
