// Allow certain clippy lints that are intentional design decisions
#![allow(clippy::type_complexity)] // callback and factory aliases are Arc<dyn Fn ...>

pub mod cli;
pub mod client;
pub mod clock;
pub mod config;
pub mod config_parser;
pub mod endpoint;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod pubsub;
pub mod resolver;
pub mod sentinel;
pub mod stats;
pub mod tls;

#[cfg(test)]
mod mock;

pub use client::{Connector, NodeConnection, RedisClient, ServerRole, TcpConnector};
pub use config::{HaConfig, PubSubConfig, SentinelConfig};
pub use endpoint::Endpoint;
pub use error::{Error, Result};
pub use pubsub::{PubSubCallbacks, ResilientPubSubService, ServiceState, Subscription};
pub use resolver::{BasicResolver, Resolver, SentinelResolver};
pub use sentinel::{BasicClientManager, ClientManager, Sentinel, SentinelInfo};
pub use stats::{AtomicStats, Counter, StatsSink};
