//! Endpoint resolution
//!
//! A [`Resolver`] turns "give me a read-write / read-only connection" into a
//! connected [`RedisClient`]. Host arrays are published as immutable snapshots
//! through [`HostArrays`], so readers never lock and never observe a partially
//! updated list.

pub mod basic;
pub mod sentinel;

use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;

use crate::client::RedisClient;
use crate::endpoint::{DEFAULT_PORT, Endpoint, parse_endpoints};
use crate::error::{Error, Result};

pub use basic::BasicResolver;
pub use sentinel::{LifetimeHostSet, SentinelResolver};

#[async_trait]
pub trait Resolver: Send + Sync {
    fn read_write_hosts_count(&self) -> usize;

    fn read_only_hosts_count(&self) -> usize;

    /// Replace the master list. An empty list is rejected and leaves the
    /// current list in place.
    fn reset_masters(&self, hosts: Vec<Endpoint>) -> Result<()>;

    /// Replace the replica list. Empty is allowed.
    fn reset_slaves(&self, hosts: Vec<Endpoint>) -> Result<()>;

    async fn create_master_client(&self, index: usize) -> Result<RedisClient>;

    async fn create_slave_client(&self, index: usize) -> Result<RedisClient>;

    /// Current master snapshot
    fn masters(&self) -> Arc<Vec<Endpoint>>;

    /// Current replica snapshot
    fn replicas(&self) -> Arc<Vec<Endpoint>>;

    /// `reset_masters` from host strings; nothing changes if any string is malformed
    fn reset_master_hosts(&self, hosts: &[String]) -> Result<()> {
        self.reset_masters(parse_endpoints(hosts, DEFAULT_PORT)?)
    }

    /// `reset_slaves` from host strings; nothing changes if any string is malformed
    fn reset_slave_hosts(&self, hosts: &[String]) -> Result<()> {
        self.reset_slaves(parse_endpoints(hosts, DEFAULT_PORT)?)
    }
}

/// Atomically published master / replica arrays
pub struct HostArrays {
    masters: ArcSwap<Vec<Endpoint>>,
    replicas: ArcSwap<Vec<Endpoint>>,
}

impl HostArrays {
    pub fn new(masters: Vec<Endpoint>, replicas: Vec<Endpoint>) -> Result<Self> {
        if masters.is_empty() {
            return Err(Error::Config("at least one master is required".into()));
        }
        Ok(Self {
            masters: ArcSwap::from_pointee(masters),
            replicas: ArcSwap::from_pointee(replicas),
        })
    }

    #[inline]
    pub fn masters(&self) -> Arc<Vec<Endpoint>> {
        self.masters.load_full()
    }

    #[inline]
    pub fn replicas(&self) -> Arc<Vec<Endpoint>> {
        self.replicas.load_full()
    }

    pub fn set_masters(&self, hosts: Vec<Endpoint>) -> Result<()> {
        if hosts.is_empty() {
            return Err(Error::Config("at least one master is required".into()));
        }
        self.masters.store(Arc::new(hosts));
        Ok(())
    }

    pub fn set_replicas(&self, hosts: Vec<Endpoint>) {
        self.replicas.store(Arc::new(hosts));
    }

    /// `index mod count`, taken from a single snapshot
    pub fn master_at(&self, index: usize) -> Option<Endpoint> {
        pick(&self.masters.load(), index)
    }

    pub fn replica_at(&self, index: usize) -> Option<Endpoint> {
        pick(&self.replicas.load(), index)
    }

    pub fn master_count(&self) -> usize {
        self.masters.load().len()
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.load().len()
    }
}

fn pick(hosts: &[Endpoint], index: usize) -> Option<Endpoint> {
    if hosts.is_empty() {
        None
    } else {
        Some(hosts[index % hosts.len()].clone())
    }
}
