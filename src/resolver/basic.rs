use std::sync::Arc;

use async_trait::async_trait;

use super::{HostArrays, Resolver};
use crate::client::{Connector, RedisClient};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::stats::{Counter, NullStats, StatsSink};

/// Static round-robin resolver. Performs no role validation.
pub struct BasicResolver {
    hosts: HostArrays,
    connector: Arc<dyn Connector>,
    stats: Arc<dyn StatsSink>,
}

impl BasicResolver {
    pub fn new(
        masters: Vec<Endpoint>,
        replicas: Vec<Endpoint>,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        Ok(Self {
            hosts: HostArrays::new(masters, replicas)?,
            connector,
            stats: Arc::new(NullStats),
        })
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = stats;
        self
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<RedisClient> {
        let client = RedisClient::connect(self.connector.as_ref(), endpoint).await?;
        self.stats.increment(Counter::ClientsCreated);
        Ok(client)
    }
}

#[async_trait]
impl Resolver for BasicResolver {
    fn read_write_hosts_count(&self) -> usize {
        self.hosts.master_count()
    }

    fn read_only_hosts_count(&self) -> usize {
        self.hosts.replica_count()
    }

    fn reset_masters(&self, hosts: Vec<Endpoint>) -> Result<()> {
        self.hosts.set_masters(hosts)
    }

    fn reset_slaves(&self, hosts: Vec<Endpoint>) -> Result<()> {
        self.hosts.set_replicas(hosts);
        Ok(())
    }

    async fn create_master_client(&self, index: usize) -> Result<RedisClient> {
        let endpoint = self
            .hosts
            .master_at(index)
            .ok_or_else(|| Error::Config("no masters configured".into()))?;
        self.connect(&endpoint).await
    }

    async fn create_slave_client(&self, index: usize) -> Result<RedisClient> {
        match self.hosts.replica_at(index) {
            Some(endpoint) => self.connect(&endpoint).await,
            None => self.create_master_client(index).await,
        }
    }

    fn masters(&self) -> Arc<Vec<Endpoint>> {
        self.hosts.masters()
    }

    fn replicas(&self) -> Arc<Vec<Endpoint>> {
        self.hosts.replicas()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockNetwork;
    use crate::stats::AtomicStats;

    fn eps(hosts: &[&str]) -> Vec<Endpoint> {
        hosts.iter().map(|h| h.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_slave_falls_back_to_master() {
        let net = MockNetwork::new();
        let master = net.add_master("10.0.0.1:6379");
        let stats = Arc::new(AtomicStats::new());

        let resolver = BasicResolver::new(eps(&["10.0.0.1:6379"]), vec![], net.connector())
            .unwrap()
            .with_stats(stats.clone());

        let client = resolver.create_slave_client(7).await.unwrap();
        assert_eq!(client.endpoint().host_string(), "10.0.0.1:6379");
        assert_eq!(master.connect_count(), 1);
        assert_eq!(stats.get(Counter::ClientsCreated), 1);
    }

    #[tokio::test]
    async fn test_round_robin_replicas() {
        let net = MockNetwork::new();
        net.add_master("m:6379");
        net.add_replica("r1:6379");
        net.add_replica("r2:6379");

        let resolver = BasicResolver::new(
            eps(&["m:6379"]),
            eps(&["r1:6379", "r2:6379"]),
            net.connector(),
        )
        .unwrap();

        assert_eq!(resolver.read_only_hosts_count(), 2);
        let c = resolver.create_slave_client(1).await.unwrap();
        assert_eq!(c.endpoint().host(), "r2");
        let c = resolver.create_slave_client(2).await.unwrap();
        assert_eq!(c.endpoint().host(), "r1");
    }

    #[tokio::test]
    async fn test_reset_masters_rejects_empty_and_malformed() {
        let net = MockNetwork::new();
        let resolver =
            BasicResolver::new(eps(&["m1:6379"]), vec![], net.connector()).unwrap();

        assert!(resolver.reset_masters(vec![]).is_err());
        assert!(
            resolver
                .reset_master_hosts(&["m2:6379".into(), "bad:port".into()])
                .is_err()
        );
        assert_eq!(resolver.masters().len(), 1);
        assert_eq!(resolver.masters()[0].host(), "m1");

        resolver.reset_master_hosts(&["m2:6380".into()]).unwrap();
        assert_eq!(resolver.masters()[0].host_string(), "m2:6380");
    }
}
