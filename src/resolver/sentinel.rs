//! Sentinel-backed resolver
//!
//! Asks the live topology for the current master on every master connection
//! and validates the node's role before handing the client out. A master that
//! keeps reporting the wrong role escalates to a forced failover, then to
//! polling, and finally to probing every host ever seen.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::{Instant, sleep};

use super::{HostArrays, Resolver};
use crate::client::{Connector, RedisClient, ServerRole};
use crate::clock::{current_time_ms, elapsed_ms};
use crate::config::SentinelConfig;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::stats::{Counter, NullStats, StatsSink};

/// Live topology lookups, answered by the sentinel orchestrator
#[async_trait]
pub trait TopologySource: Send + Sync {
    async fn master_host(&self) -> Result<Endpoint>;

    async fn slave_hosts(&self) -> Result<Vec<Endpoint>>;

    async fn force_master_failover(&self) -> Result<()>;
}

/// Timings and switches for master role validation
#[derive(Debug, Clone)]
pub struct MasterValidation {
    pub wait_before_forcing_master_failover: Duration,
    pub wait_between_failed_hosts: Duration,
    pub max_wait_between_failed_hosts: Duration,
    pub verify_master_connections: bool,
    pub host_lookup_timeout: Duration,
}

impl From<&SentinelConfig> for MasterValidation {
    fn from(config: &SentinelConfig) -> Self {
        Self {
            wait_before_forcing_master_failover: config.wait_before_forcing_master_failover,
            wait_between_failed_hosts: config.wait_between_failed_hosts,
            max_wait_between_failed_hosts: config.max_wait_between_failed_hosts,
            verify_master_connections: config.verify_master_connections,
            host_lookup_timeout: config.host_lookup_timeout,
        }
    }
}

impl Default for MasterValidation {
    fn default() -> Self {
        Self::from(&SentinelConfig::default())
    }
}

/// Every endpoint ever seen as master or replica, in first-seen order.
/// Only used for full reconciliation; never pruned.
#[derive(Debug, Default)]
pub struct LifetimeHostSet {
    hosts: Mutex<Vec<Endpoint>>,
}

impl LifetimeHostSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn extend(&self, endpoints: &[Endpoint]) {
        let mut hosts = self.hosts.lock();
        for endpoint in endpoints {
            let key = endpoint.host_string();
            if !hosts.iter().any(|h| h.host_string() == key) {
                hosts.push(endpoint.clone());
            }
        }
    }

    pub fn snapshot(&self) -> Vec<Endpoint> {
        self.hosts.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.hosts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.hosts.lock().is_empty()
    }
}

struct ValidationState {
    last_invalid_host: Option<String>,
    last_valid_ms: u64,
}

pub struct SentinelResolver {
    hosts: HostArrays,
    all_hosts: LifetimeHostSet,
    source: Arc<dyn TopologySource>,
    connector: Arc<dyn Connector>,
    stats: Arc<dyn StatsSink>,
    policy: MasterValidation,
    validation: Mutex<ValidationState>,
}

impl SentinelResolver {
    pub fn new(
        source: Arc<dyn TopologySource>,
        masters: Vec<Endpoint>,
        replicas: Vec<Endpoint>,
        connector: Arc<dyn Connector>,
        policy: MasterValidation,
    ) -> Result<Self> {
        let all_hosts = LifetimeHostSet::new();
        all_hosts.extend(&masters);
        all_hosts.extend(&replicas);

        Ok(Self {
            hosts: HostArrays::new(masters, replicas)?,
            all_hosts,
            source,
            connector,
            stats: Arc::new(NullStats),
            policy,
            validation: Mutex::new(ValidationState {
                last_invalid_host: None,
                last_valid_ms: current_time_ms(),
            }),
        })
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = stats;
        self
    }

    pub fn all_hosts(&self) -> &LifetimeHostSet {
        &self.all_hosts
    }

    async fn connect(&self, endpoint: &Endpoint) -> Result<RedisClient> {
        let client = RedisClient::connect(self.connector.as_ref(), endpoint).await?;
        self.stats.increment(Counter::ClientsCreated);
        Ok(client)
    }

    /// Connect and confirm the node currently reports itself as master
    async fn connect_master(&self, endpoint: &Endpoint) -> Result<RedisClient> {
        let mut client = self.connect(endpoint).await?;
        match client.role().await? {
            ServerRole::Master => Ok(client),
            role => Err(Error::InvalidMaster {
                host: endpoint.host_string(),
                role: role.to_string(),
            }),
        }
    }

    async fn live_master(&self, index: usize) -> Result<Endpoint> {
        match self.source.master_host().await {
            Ok(endpoint) => Ok(endpoint),
            Err(e) => {
                log::warn!("Sentinel master lookup failed, using cached masters: {}", e);
                self.hosts
                    .master_at(index)
                    .ok_or_else(|| Error::Config("no masters configured".into()))
            }
        }
    }

    fn mark_valid(&self) {
        let mut state = self.validation.lock();
        state.last_invalid_host = None;
        state.last_valid_ms = current_time_ms();
    }

    /// Record a role mismatch; returns true when it is time to force a failover
    fn should_force_failover(&self, host: &str) -> bool {
        let mut state = self.validation.lock();
        let repeated = state.last_invalid_host.as_deref() == Some(host);
        let overdue = elapsed_ms(state.last_valid_ms)
            > self.policy.wait_before_forcing_master_failover.as_millis() as u64;

        if repeated && overdue {
            state.last_invalid_host = None;
            state.last_valid_ms = current_time_ms();
            true
        } else {
            state.last_invalid_host = Some(host.to_string());
            false
        }
    }

    async fn recover_master(&self, endpoint: Endpoint, role: String) -> Result<RedisClient> {
        log::warn!(
            "Master {} still reports role '{}', forcing sentinel failover",
            endpoint,
            role
        );
        self.stats.increment(Counter::ForcedMasterFailovers);
        if let Err(e) = self.source.force_master_failover().await {
            log::warn!("Forced failover request failed: {}", e);
        }
        sleep(self.policy.wait_between_failed_hosts).await;

        let endpoint = self.source.master_host().await.unwrap_or(endpoint);
        let role = match self.connect_master(&endpoint).await {
            Ok(client) => {
                self.mark_valid();
                return Ok(client);
            }
            Err(Error::InvalidMaster { role, .. }) => role,
            Err(e) => e.to_string(),
        };

        if !self.policy.verify_master_connections {
            return Err(Error::InvalidMaster {
                host: endpoint.host_string(),
                role,
            });
        }

        match self.wait_for_master().await {
            Ok(client) => {
                self.mark_valid();
                Ok(client)
            }
            Err(e) => {
                log::warn!("{}, probing all known hosts", e);
                let client = self.reconcile().await?;
                self.mark_valid();
                Ok(client)
            }
        }
    }

    /// Poll the sentinels until a master answers or the max wait elapses
    async fn wait_for_master(&self) -> Result<RedisClient> {
        let max_wait = self.policy.max_wait_between_failed_hosts;
        let deadline = Instant::now() + max_wait;
        let mut attempt: u32 = 0;

        loop {
            if let Ok(endpoint) = self.source.master_host().await {
                match self.connect_master(&endpoint).await {
                    Ok(client) => return Ok(client),
                    Err(e) => log::debug!("Master candidate {} rejected: {}", endpoint, e),
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(Error::MasterWaitElapsed(max_wait));
            }
            attempt = attempt.saturating_add(1);
            let backoff = self.policy.wait_between_failed_hosts.saturating_mul(attempt);
            sleep(backoff.min(deadline - now)).await;
        }
    }

    /// Probe every host ever seen and rebuild the master / replica arrays
    async fn reconcile(&self) -> Result<RedisClient> {
        let candidates = self.all_hosts.snapshot();
        let mut masters = Vec::new();
        let mut replicas = Vec::new();

        for endpoint in &candidates {
            let probe = endpoint.clone().with_timeouts(self.policy.host_lookup_timeout);
            let role = match RedisClient::connect(self.connector.as_ref(), &probe).await {
                Ok(mut client) => client.role().await,
                Err(e) => Err(e),
            };
            match role {
                Ok(ServerRole::Master) => masters.push(endpoint.clone()),
                Ok(ServerRole::Slave) => replicas.push(endpoint.clone()),
                Ok(other) => log::debug!("Skipping {} with role {}", endpoint, other),
                Err(e) => log::debug!("Could not probe {}: {}", endpoint, e),
            }
        }

        if masters.is_empty() {
            self.stats.increment(Counter::NoMastersFound);
            let tried = candidates
                .iter()
                .map(Endpoint::host_string)
                .collect::<Vec<_>>()
                .join(", ");
            log::error!("No master found in: {}", tried);
            return Err(Error::NoMasterFound(tried));
        }

        log::info!(
            "Reconciled hosts, masters: {:?}, replicas: {:?}",
            masters.iter().map(Endpoint::host_string).collect::<Vec<_>>(),
            replicas.iter().map(Endpoint::host_string).collect::<Vec<_>>()
        );
        let primary = masters[0].clone();
        self.hosts.set_masters(masters)?;
        self.hosts.set_replicas(replicas);
        self.connect(&primary).await
    }
}

#[async_trait]
impl Resolver for SentinelResolver {
    fn read_write_hosts_count(&self) -> usize {
        self.hosts.master_count()
    }

    fn read_only_hosts_count(&self) -> usize {
        self.hosts.replica_count()
    }

    fn reset_masters(&self, hosts: Vec<Endpoint>) -> Result<()> {
        self.all_hosts.extend(&hosts);
        self.hosts.set_masters(hosts)
    }

    fn reset_slaves(&self, hosts: Vec<Endpoint>) -> Result<()> {
        self.all_hosts.extend(&hosts);
        self.hosts.set_replicas(hosts);
        Ok(())
    }

    async fn create_master_client(&self, index: usize) -> Result<RedisClient> {
        let endpoint = self.live_master(index).await?;
        let mut client = self.connect(&endpoint).await?;

        let role = client.role().await?;
        if role == ServerRole::Master {
            self.mark_valid();
            return Ok(client);
        }
        drop(client);

        let host = endpoint.host_string();
        if self.should_force_failover(&host) {
            return self.recover_master(endpoint, role.to_string()).await;
        }

        self.stats.increment(Counter::InvalidMasters);
        log::warn!("Master {} reported role '{}'", host, role);
        Err(Error::InvalidMaster {
            host,
            role: role.to_string(),
        })
    }

    async fn create_slave_client(&self, index: usize) -> Result<RedisClient> {
        let live = match self.source.slave_hosts().await {
            Ok(hosts) => hosts,
            Err(e) => {
                log::debug!("Sentinel replica lookup failed, using cached replicas: {}", e);
                Vec::new()
            }
        };

        let endpoint = if live.is_empty() {
            self.hosts.replica_at(index)
        } else {
            Some(live[index % live.len()].clone())
        };

        match endpoint {
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
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeTopology {
        master: Mutex<Option<Endpoint>>,
        slaves: Mutex<Vec<Endpoint>>,
        failovers: AtomicUsize,
    }

    impl FakeTopology {
        fn new(master: Option<&str>) -> Arc<Self> {
            Arc::new(Self {
                master: Mutex::new(master.map(|m| m.parse().unwrap())),
                slaves: Mutex::new(Vec::new()),
                failovers: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl TopologySource for FakeTopology {
        async fn master_host(&self) -> Result<Endpoint> {
            self.master
                .lock()
                .clone()
                .ok_or_else(|| Error::Timeout("asking sentinel"))
        }

        async fn slave_hosts(&self) -> Result<Vec<Endpoint>> {
            Ok(self.slaves.lock().clone())
        }

        async fn force_master_failover(&self) -> Result<()> {
            self.failovers.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn policy(forcing_ms: u64, verify: bool) -> MasterValidation {
        MasterValidation {
            wait_before_forcing_master_failover: Duration::from_millis(forcing_ms),
            wait_between_failed_hosts: Duration::from_millis(5),
            max_wait_between_failed_hosts: Duration::from_millis(50),
            verify_master_connections: verify,
            host_lookup_timeout: Duration::from_millis(200),
        }
    }

    fn eps(hosts: &[&str]) -> Vec<Endpoint> {
        hosts.iter().map(|h| h.parse().unwrap()).collect()
    }

    #[tokio::test]
    async fn test_prefers_live_master() {
        let net = MockNetwork::new();
        net.add_master("10.0.0.9:6379");
        let topology = FakeTopology::new(Some("10.0.0.9:6379"));

        let resolver = SentinelResolver::new(
            topology,
            eps(&["10.0.0.1:6379"]),
            vec![],
            net.connector(),
            policy(60_000, true),
        )
        .unwrap();

        let client = resolver.create_master_client(0).await.unwrap();
        assert_eq!(client.endpoint().host_string(), "10.0.0.9:6379");
    }

    #[tokio::test]
    async fn test_falls_back_to_cached_master() {
        let net = MockNetwork::new();
        net.add_master("10.0.0.1:6379");
        let resolver = SentinelResolver::new(
            FakeTopology::new(None),
            eps(&["10.0.0.1:6379"]),
            vec![],
            net.connector(),
            policy(60_000, true),
        )
        .unwrap();

        let client = resolver.create_master_client(0).await.unwrap();
        assert_eq!(client.endpoint().host_string(), "10.0.0.1:6379");
    }

    #[tokio::test]
    async fn test_repeated_invalid_master_forces_one_failover() {
        let net = MockNetwork::new();
        net.add_replica("10.0.0.1:6379");
        let topology = FakeTopology::new(Some("10.0.0.1:6379"));
        let stats = Arc::new(AtomicStats::new());

        let resolver = SentinelResolver::new(
            topology.clone(),
            eps(&["10.0.0.1:6379"]),
            vec![],
            net.connector(),
            policy(50, false),
        )
        .unwrap()
        .with_stats(stats.clone());

        tokio::time::sleep(Duration::from_millis(80)).await;

        for _ in 0..4 {
            let err = resolver.create_master_client(0).await.unwrap_err();
            assert!(matches!(err, Error::InvalidMaster { .. }));
        }

        assert_eq!(topology.failovers.load(Ordering::SeqCst), 1);
        assert_eq!(stats.get(Counter::ForcedMasterFailovers), 1);
        assert_eq!(stats.get(Counter::InvalidMasters), 3);
    }

    #[tokio::test]
    async fn test_no_failover_inside_grace_window() {
        let net = MockNetwork::new();
        net.add_replica("10.0.0.1:6379");
        let topology = FakeTopology::new(Some("10.0.0.1:6379"));

        let resolver = SentinelResolver::new(
            topology.clone(),
            eps(&["10.0.0.1:6379"]),
            vec![],
            net.connector(),
            policy(60_000, false),
        )
        .unwrap();

        for _ in 0..3 {
            assert!(resolver.create_master_client(0).await.is_err());
        }
        assert_eq!(topology.failovers.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_reconciles_from_lifetime_hosts() {
        let net = MockNetwork::new();
        net.add_replica("10.0.0.1:6379");
        net.add_master("10.0.0.2:6379");
        net.add_replica("10.0.0.3:6379");
        let topology = FakeTopology::new(Some("10.0.0.1:6379"));

        let resolver = SentinelResolver::new(
            topology.clone(),
            eps(&["10.0.0.1:6379"]),
            eps(&["10.0.0.2:6379", "10.0.0.3:6379"]),
            net.connector(),
            policy(0, true),
        )
        .unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(resolver.create_master_client(0).await.is_err());
        let client = resolver.create_master_client(0).await.unwrap();

        assert_eq!(client.endpoint().host_string(), "10.0.0.2:6379");
        assert_eq!(resolver.masters()[0].host_string(), "10.0.0.2:6379");
        assert_eq!(resolver.replicas().len(), 2);
        assert_eq!(topology.failovers.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reconcile_without_master_fails() {
        let net = MockNetwork::new();
        net.add_replica("10.0.0.1:6379");
        let stats = Arc::new(AtomicStats::new());

        let resolver = SentinelResolver::new(
            FakeTopology::new(Some("10.0.0.1:6379")),
            eps(&["10.0.0.1:6379"]),
            vec![],
            net.connector(),
            policy(0, true),
        )
        .unwrap()
        .with_stats(stats.clone());

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(resolver.create_master_client(0).await.is_err());
        let err = resolver.create_master_client(0).await.unwrap_err();
        assert!(matches!(err, Error::NoMasterFound(_)));
        assert_eq!(stats.get(Counter::NoMastersFound), 1);
    }

    #[tokio::test]
    async fn test_slave_lookup_order() {
        let net = MockNetwork::new();
        net.add_master("m:6379");
        net.add_replica("live:6379");
        net.add_replica("cached:6379");
        let topology = FakeTopology::new(Some("m:6379"));

        let resolver = SentinelResolver::new(
            topology.clone(),
            eps(&["m:6379"]),
            eps(&["cached:6379"]),
            net.connector(),
            policy(60_000, true),
        )
        .unwrap();

        let c = resolver.create_slave_client(0).await.unwrap();
        assert_eq!(c.endpoint().host(), "cached");

        *topology.slaves.lock() = eps(&["live:6379"]);
        let c = resolver.create_slave_client(0).await.unwrap();
        assert_eq!(c.endpoint().host(), "live");

        *topology.slaves.lock() = vec![];
        resolver.reset_slaves(vec![]).unwrap();
        let c = resolver.create_slave_client(0).await.unwrap();
        assert_eq!(c.endpoint().host(), "m");
    }

    #[test]
    fn test_lifetime_set_dedups_in_order() {
        let set = LifetimeHostSet::new();
        set.extend(&eps(&["a:1", "b:2"]));
        set.extend(&eps(&["b:2", "c:3", "a:1"]));
        let hosts: Vec<String> = set.snapshot().iter().map(|e| e.host_string()).collect();
        assert_eq!(hosts, vec!["a:1", "b:2", "c:3"]);
    }
}
