//! cachefleet-pool — dedicated instances on a static fleet of worker nodes.
//!
//! ```text
//! RemoteNodePool   first-fit allocation, bindings, atomic JSON persistence
//!   ├── ConsistencyChecker   periodic key-count survey of free nodes
//!   └── DebugSnapshot        read-only JSON projection
//! ```
//!
//! Node agents are reached through [`cachefleet_agent::NodeAgent`].

pub mod consistency;
pub mod debug;
pub mod error;
pub mod pool;
pub mod state;

pub use consistency::{ConsistencyChecker, SurveyReport};
pub use debug::DebugSnapshot;
pub use error::{PoolError, PoolResult};
pub use pool::RemoteNodePool;
pub use state::{StateDocument, StateFile};
