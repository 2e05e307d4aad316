//! Configuration for the HA layer
//!
//! Settings are grouped by the component that consumes them. [`HaConfig`]
//! bundles them for the `sentinel-client.conf` file format handled by
//! [`crate::config_parser`].

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::endpoint::{DEFAULT_SENTINEL_PORT, Endpoint, parse_endpoints};
use crate::error::{Error, Result};
use crate::pubsub::{PubSubServiceBuilder, ResilientPubSubService};
use crate::resolver::Resolver;

/// Sentinel orchestration and master validation settings
#[derive(Debug, Clone)]
pub struct SentinelConfig {
    /// Sentinel endpoints (`host[:port]`, default port 26379)
    pub sentinel_hosts: Vec<String>,
    /// Monitored master group name
    pub master_name: String,
    /// Ask sentinels for their peers and add them to the rotation
    pub scan_for_other_sentinels: bool,
    /// Minimum time between peer rescans
    pub refresh_sentinel_hosts_after: Duration,
    /// Reconfigure clients on `+sdown`
    pub reset_when_subjectively_down: bool,
    /// Reconfigure clients on `+odown`
    pub reset_when_objectively_down: bool,
    pub wait_between_failed_hosts: Duration,
    pub max_wait_between_failed_hosts: Duration,
    pub wait_before_forcing_master_failover: Duration,
    /// Poll and reconcile when the master keeps reporting the wrong role
    pub verify_master_connections: bool,
    /// Connect/send/receive timeout for sentinel RPCs
    pub sentinel_worker_timeout: Duration,
    /// Timeout for role probes during host reconciliation
    pub host_lookup_timeout: Duration,
    /// Translation of addresses reported by sentinels (`reported -> visible`)
    pub ip_address_map: HashMap<String, String>,
}

impl Default for SentinelConfig {
    fn default() -> Self {
        Self {
            sentinel_hosts: Vec::new(),
            master_name: "mymaster".to_string(),
            scan_for_other_sentinels: true,
            refresh_sentinel_hosts_after: Duration::from_secs(10 * 60),
            reset_when_subjectively_down: true,
            reset_when_objectively_down: true,
            wait_between_failed_hosts: Duration::from_millis(250),
            max_wait_between_failed_hosts: Duration::from_secs(60),
            wait_before_forcing_master_failover: Duration::from_secs(60),
            verify_master_connections: true,
            sentinel_worker_timeout: Duration::from_millis(100),
            host_lookup_timeout: Duration::from_millis(200),
            ip_address_map: HashMap::new(),
        }
    }
}

impl SentinelConfig {
    pub fn new<S: Into<String>>(sentinel_hosts: impl IntoIterator<Item = S>) -> Self {
        Self {
            sentinel_hosts: sentinel_hosts.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_master_name(mut self, name: impl Into<String>) -> Self {
        self.master_name = name.into();
        self
    }

    /// Parsed sentinel endpoints; an empty list is a configuration error
    pub fn sentinel_endpoints(&self) -> Result<Vec<Endpoint>> {
        if self.sentinel_hosts.is_empty() {
            return Err(Error::Config("sentinel hosts must not be empty".into()));
        }
        parse_endpoints(&self.sentinel_hosts, DEFAULT_SENTINEL_PORT)
    }

    /// Apply the IP translation table to a reported address
    pub fn map_ip<'a>(&'a self, ip: &'a str) -> &'a str {
        self.ip_address_map
            .get(ip)
            .map(String::as_str)
            .unwrap_or(ip)
    }
}

/// Managed pub/sub service settings
#[derive(Debug, Clone)]
pub struct PubSubConfig {
    /// Publish `CTRL:PULSE` this often; `None` disables publishing pulses
    pub heartbeat_interval: Option<Duration>,
    /// Restart when no pulse has been received for this long; `None` disables the check
    pub heartbeat_timeout: Option<Duration>,
    /// Restart after a failed session unless stopped or disposed
    pub auto_restart: bool,
    /// Pause before an automatic restart
    pub wait_before_next_restart: Option<Duration>,
    /// How long `dispose` waits for a graceful exit before cancelling
    pub dispose_grace: Duration,
}

impl Default for PubSubConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: None,
            heartbeat_timeout: None,
            auto_restart: true,
            wait_before_next_restart: None,
            dispose_grace: Duration::from_millis(500),
        }
    }
}

/// Client TLS settings
#[derive(Debug, Clone, Default)]
pub struct TlsSettings {
    /// Use TLS for every connection, not only `rediss://` endpoints
    pub enabled: bool,
    pub ca_cert_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl TlsSettings {
    /// Whether a TLS client config needs to be built at all
    pub fn is_configured(&self) -> bool {
        self.enabled || self.ca_cert_file.is_some() || self.cert_file.is_some()
    }
}

/// Logging settings
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// debug, verbose, notice, warning, nothing
    pub loglevel: String,
    /// Empty logs to stderr
    pub logfile: String,
    /// Redact AUTH arguments and passwords in log lines
    pub hide_user_data_from_log: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            loglevel: "notice".to_string(),
            logfile: String::new(),
            hide_user_data_from_log: true,
        }
    }
}

/// Everything a `sentinel-client.conf` file can set
#[derive(Debug, Clone, Default)]
pub struct HaConfig {
    pub sentinel: SentinelConfig,
    /// Defaults for application pub/sub services, see [`HaConfig::pubsub_service`]
    pub pubsub: PubSubConfig,
    pub tls: TlsSettings,
    pub log: LogConfig,
}

impl HaConfig {
    /// Pub/sub service builder preloaded with the `heartbeat-*` and restart settings
    pub fn pubsub_service(
        &self,
        resolver: Arc<dyn Resolver>,
        channels: Vec<String>,
    ) -> PubSubServiceBuilder {
        ResilientPubSubService::builder(resolver, channels).config(self.pubsub.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SentinelConfig::default();
        assert_eq!(config.master_name, "mymaster");
        assert!(config.scan_for_other_sentinels);
        assert_eq!(config.wait_between_failed_hosts, Duration::from_millis(250));
        assert_eq!(config.sentinel_worker_timeout, Duration::from_millis(100));
        assert!(config.verify_master_connections);

        let pubsub = PubSubConfig::default();
        assert!(pubsub.heartbeat_interval.is_none());
        assert!(pubsub.auto_restart);
    }

    #[test]
    fn test_pubsub_service_uses_file_settings() {
        let config = HaConfig {
            pubsub: PubSubConfig {
                heartbeat_timeout: Some(Duration::from_millis(200)),
                auto_restart: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let net = crate::mock::MockNetwork::new();
        let master: Endpoint = "10.0.0.1:6379".parse().unwrap();
        let resolver =
            crate::resolver::BasicResolver::new(vec![master], vec![], net.connector()).unwrap();

        let svc = config
            .pubsub_service(Arc::new(resolver), vec!["events".into()])
            .build();
        assert_eq!(svc.config().heartbeat_timeout, Some(Duration::from_millis(200)));
        assert!(!svc.config().auto_restart);
        assert_eq!(svc.channels(), ["events".to_string()]);
    }

    #[test]
    fn test_sentinel_endpoints() {
        assert!(matches!(
            SentinelConfig::default().sentinel_endpoints(),
            Err(Error::Config(_))
        ));

        let config = SentinelConfig::new(["10.0.0.1", "10.0.0.2:26380"]);
        let eps = config.sentinel_endpoints().unwrap();
        assert_eq!(eps[0].port(), 26379);
        assert_eq!(eps[1].port(), 26380);
    }

    #[test]
    fn test_map_ip() {
        let mut config = SentinelConfig::default();
        config
            .ip_address_map
            .insert("172.17.0.2".into(), "10.0.0.2".into());
        assert_eq!(config.map_ip("172.17.0.2"), "10.0.0.2");
        assert_eq!(config.map_ip("172.17.0.3"), "172.17.0.3");
    }
}
