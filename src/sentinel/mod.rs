//! Sentinel-driven topology
//!
//! - [`SentinelWorker`]: RPCs and the event listener for one sentinel
//! - [`Sentinel`]: rotation across sentinels, event handling, client reconfiguration
//! - [`ClientManager`]: what the orchestrator repoints after a failover

pub mod events;
pub mod manager;
pub mod orchestrator;
pub mod worker;

pub use events::{EventKind, SentinelEvent};
pub use manager::{BasicClientManager, ClientManager, ClientManagerFactory};
pub use orchestrator::{HostFilter, Sentinel, SentinelBuilder, SentinelCallbacks};
pub use worker::{SentinelInfo, SentinelWorker};
