//! Client manager contract
//!
//! Pooling is left to the application. The orchestrator only needs to hand a
//! manager its resolver once and to repoint it after every failover.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::RwLock;

use crate::client::RedisClient;
use crate::endpoint::Endpoint;
use crate::error::Result;
use crate::resolver::Resolver;

pub trait ClientManager: Send + Sync {
    fn set_resolver(&self, resolver: Arc<dyn Resolver>);

    fn resolver(&self) -> Arc<dyn Resolver>;

    /// Point the manager at a new topology
    fn failover_to(&self, masters: Vec<Endpoint>, replicas: Vec<Endpoint>) -> Result<()>;
}

/// Builds the client manager from the first topology snapshot
pub type ClientManagerFactory =
    Arc<dyn Fn(Vec<Endpoint>, Vec<Endpoint>) -> Result<Arc<dyn ClientManager>> + Send + Sync>;

/// Non-pooled manager: every call opens a new connection through the resolver
pub struct BasicClientManager {
    resolver: RwLock<Arc<dyn Resolver>>,
    next_master: AtomicUsize,
    next_replica: AtomicUsize,
}

impl BasicClientManager {
    pub fn new(resolver: Arc<dyn Resolver>) -> Self {
        Self {
            resolver: RwLock::new(resolver),
            next_master: AtomicUsize::new(0),
            next_replica: AtomicUsize::new(0),
        }
    }

    /// Read-write connection, round-robin over the masters
    pub async fn get_client(&self) -> Result<RedisClient> {
        let index = self.next_master.fetch_add(1, Ordering::Relaxed);
        let resolver = self.resolver();
        resolver.create_master_client(index).await
    }

    /// Read-only connection, round-robin over the replicas
    pub async fn get_read_only_client(&self) -> Result<RedisClient> {
        let index = self.next_replica.fetch_add(1, Ordering::Relaxed);
        let resolver = self.resolver();
        resolver.create_slave_client(index).await
    }
}

impl ClientManager for BasicClientManager {
    fn set_resolver(&self, resolver: Arc<dyn Resolver>) {
        *self.resolver.write() = resolver;
    }

    fn resolver(&self) -> Arc<dyn Resolver> {
        self.resolver.read().clone()
    }

    fn failover_to(&self, masters: Vec<Endpoint>, replicas: Vec<Endpoint>) -> Result<()> {
        let resolver = self.resolver();
        resolver.reset_masters(masters)?;
        resolver.reset_slaves(replicas)?;
        self.next_master.store(0, Ordering::Relaxed);
        self.next_replica.store(0, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::mock::MockNetwork;
    use crate::resolver::BasicResolver;

    fn ep(s: &str) -> Endpoint {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn test_failover_repoints_clients() {
        let net = MockNetwork::new();
        net.add_master("10.0.0.1:6379");
        net.add_master("10.0.0.3:6379");
        net.add_replica("10.0.0.2:6379");

        let resolver =
            BasicResolver::new(vec![ep("10.0.0.1:6379")], vec![ep("10.0.0.2:6379")], net.connector())
                .unwrap();
        let manager = BasicClientManager::new(Arc::new(resolver));

        let client = manager.get_client().await.unwrap();
        assert_eq!(client.endpoint().host_string(), "10.0.0.1:6379");
        let ro = manager.get_read_only_client().await.unwrap();
        assert_eq!(ro.endpoint().host_string(), "10.0.0.2:6379");

        manager
            .failover_to(vec![ep("10.0.0.3:6379")], vec![])
            .unwrap();
        let client = manager.get_client().await.unwrap();
        assert_eq!(client.endpoint().host_string(), "10.0.0.3:6379");
        // no replicas left, reads go to the master
        let ro = manager.get_read_only_client().await.unwrap();
        assert_eq!(ro.endpoint().host_string(), "10.0.0.3:6379");
    }

    #[tokio::test]
    async fn test_failover_to_nothing_is_rejected() {
        let net = MockNetwork::new();
        let resolver = BasicResolver::new(vec![ep("10.0.0.1:6379")], vec![], net.connector()).unwrap();
        let manager = BasicClientManager::new(Arc::new(resolver));

        assert!(matches!(manager.failover_to(vec![], vec![]), Err(Error::Config(_))));
        assert_eq!(manager.resolver().masters()[0].host_string(), "10.0.0.1:6379");
    }
}
