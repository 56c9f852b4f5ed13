//! cachefleet-health — liveness primitives for cachefleet.
//!
//! Everything that decides whether a cache process is up is built from
//! three pieces:
//!
//! ```text
//! do_within(timeout, action)      deadline enforcer, cooperative cancel
//!   ├── PortProbe::check()        10 ms TCP dial loop
//!   └── process::wait_for_exit()  signal-0 poll after SIGKILL
//! ```
//!
//! The enforcer never aborts an action. On timeout it raises the action's
//! [`Terminate`] handle and returns; the action is expected to notice and
//! stop.

pub mod deadline;
pub mod probe;
pub mod process;

pub use deadline::{DeadlineError, Terminate, do_within};
pub use probe::{PROBE_INTERVAL, PortProbe};
pub use process::{ProcessError, ProcessResult};
