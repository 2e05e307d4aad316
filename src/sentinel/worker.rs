//! One connection to one sentinel
//!
//! RPCs share a single connection and run one at a time. A call that fails on
//! the transport drops the connection so the next call reconnects. The event
//! listener is a separate [`ResilientPubSubService`] subscribed to `*`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::client::{Connector, RedisClient};
use crate::config::{PubSubConfig, SentinelConfig};
use crate::endpoint::{DEFAULT_PORT, DEFAULT_SENTINEL_PORT, Endpoint};
use crate::error::{Error, Result};
use crate::protocol::RespValue;
use crate::pubsub::{PubSubCallbacks, ResilientPubSubService, ServiceState};
use crate::resolver::BasicResolver;

/// Flags that mark a reported node as unusable
const DOWN_FLAGS: [&str; 3] = ["s_down", "o_down", "disconnected"];

/// Topology snapshot reported by a sentinel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelInfo {
    pub master_name: String,
    pub masters: Vec<Endpoint>,
    pub replicas: Vec<Endpoint>,
}

impl fmt::Display for SentinelInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |hosts: &[Endpoint]| {
            hosts
                .iter()
                .map(Endpoint::host_string)
                .collect::<Vec<_>>()
                .join(",")
        };
        write!(
            f,
            "{} primary: {}, replicas: {}",
            self.master_name,
            join(&self.masters),
            join(&self.replicas)
        )
    }
}

pub struct SentinelWorker {
    endpoint: Endpoint,
    config: Arc<SentinelConfig>,
    connector: Arc<dyn Connector>,
    client: tokio::sync::Mutex<Option<RedisClient>>,
    listener: parking_lot::Mutex<Option<Arc<ResilientPubSubService>>>,
}

impl SentinelWorker {
    pub fn new(endpoint: Endpoint, config: Arc<SentinelConfig>, connector: Arc<dyn Connector>) -> Self {
        Self {
            endpoint: endpoint.with_timeouts(config.sentinel_worker_timeout),
            config,
            connector,
            client: tokio::sync::Mutex::new(None),
            listener: parking_lot::Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn call(&self, args: &[&str]) -> Result<RespValue> {
        let mut slot = self.client.lock().await;
        let mut client = match slot.take() {
            Some(client) => client,
            None => RedisClient::connect(self.connector.as_ref(), &self.endpoint).await?,
        };

        match client.command(args).await {
            Ok(reply) => {
                *slot = Some(client);
                Ok(reply)
            }
            // the connection itself is fine
            Err(e @ Error::Server(_)) => {
                *slot = Some(client);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn ping(&self) -> Result<()> {
        self.call(&["PING"]).await.map(|_| ())
    }

    pub async fn get_master_host(&self) -> Result<Endpoint> {
        let name = self.config.master_name.as_str();
        let reply = self
            .call(&["SENTINEL", "get-master-addr-by-name", name])
            .await?;
        if reply.is_null() {
            return Err(Error::NoMasterFound(format!(
                "sentinel {} does not know '{}'",
                self.endpoint, name
            )));
        }

        let unexpected = || Error::UnexpectedReply {
            command: "SENTINEL get-master-addr-by-name".into(),
            reply: reply.describe(),
        };
        let Some([ip, port]) = reply.as_array() else {
            return Err(unexpected());
        };
        let (Some(ip), Some(port)) = (ip.as_str(), port.as_str()) else {
            return Err(unexpected());
        };
        let port: u16 = port.parse().map_err(|_| unexpected())?;
        Ok(Endpoint::new(self.config.map_ip(&ip), port))
    }

    pub async fn get_slave_hosts(&self) -> Result<Vec<Endpoint>> {
        let name = self.config.master_name.as_str();
        let reply = match self.call(&["SENTINEL", "replicas", name]).await {
            Ok(reply) => reply,
            // sentinels before 5.0 only know SLAVES
            Err(Error::Server(_)) => self.call(&["SENTINEL", "slaves", name]).await?,
            Err(e) => return Err(e),
        };
        self.healthy_nodes(&reply, DEFAULT_PORT)
    }

    /// Peer sentinels monitoring the same master
    pub async fn get_sentinel_hosts(&self) -> Result<Vec<Endpoint>> {
        let reply = self
            .call(&["SENTINEL", "sentinels", &self.config.master_name])
            .await?;
        self.healthy_nodes(&reply, DEFAULT_SENTINEL_PORT)
    }

    pub async fn force_master_failover(&self) -> Result<()> {
        log::warn!(
            "Forcing failover of '{}' through sentinel {}",
            self.config.master_name,
            self.endpoint
        );
        self.call(&["SENTINEL", "failover", &self.config.master_name])
            .await
            .map(|_| ())
    }

    pub async fn get_sentinel_info(&self) -> Result<SentinelInfo> {
        let master = self.get_master_host().await?;
        let replicas = self.get_slave_hosts().await?;
        Ok(SentinelInfo {
            master_name: self.config.master_name.clone(),
            masters: vec![master],
            replicas,
        })
    }

    fn healthy_nodes(&self, reply: &RespValue, default_port: u16) -> Result<Vec<Endpoint>> {
        let records = parse_records(reply)?;
        let mut nodes = Vec::with_capacity(records.len());
        for record in records {
            let flags = record.get("flags").map(String::as_str).unwrap_or("");
            if flags.split(',').any(|flag| DOWN_FLAGS.contains(&flag)) {
                continue;
            }
            let Some(ip) = record.get("ip") else { continue };
            let port = record
                .get("port")
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            nodes.push(Endpoint::new(self.config.map_ip(ip), port));
        }
        Ok(nodes)
    }

    /// Subscribe to every event channel on this sentinel. Idempotent.
    pub async fn begin_listening_for_configuration_changes(
        &self,
        callbacks: PubSubCallbacks,
    ) -> Result<()> {
        let service = {
            let mut slot = self.listener.lock();
            match slot.as_ref() {
                Some(service) => service.clone(),
                None => {
                    let resolver =
                        BasicResolver::new(vec![self.endpoint.clone()], vec![], self.connector.clone())?;
                    let config = PubSubConfig {
                        heartbeat_interval: None,
                        heartbeat_timeout: None,
                        wait_before_next_restart: Some(self.config.wait_between_failed_hosts),
                        ..Default::default()
                    };
                    let service = Arc::new(
                        ResilientPubSubService::builder(Arc::new(resolver), vec!["*".to_string()])
                            .patterns()
                            .sentinel_subscription()
                            .config(config)
                            .callbacks(callbacks)
                            .build(),
                    );
                    *slot = Some(service.clone());
                    service
                }
            }
        };
        service.start().await
    }

    pub fn is_listening(&self) -> bool {
        self.listener
            .lock()
            .as_ref()
            .is_some_and(|s| s.state() == ServiceState::Started)
    }

    pub async fn dispose(&self) {
        let listener = self.listener.lock().take();
        if let Some(listener) = listener {
            listener.dispose().await;
        }
        if let Some(client) = self.client.lock().await.take() {
            client.close().await;
        }
    }
}

/// `SENTINEL replicas|sentinels` reply: an array of flat field/value arrays
fn parse_records(reply: &RespValue) -> Result<Vec<HashMap<String, String>>> {
    if reply.is_null() {
        return Ok(Vec::new());
    }
    let unexpected = || Error::UnexpectedReply {
        command: "SENTINEL".into(),
        reply: reply.describe(),
    };
    let items = reply.as_array().ok_or_else(unexpected)?;

    items
        .iter()
        .map(|item| {
            let fields = item.as_array().ok_or_else(unexpected)?;
            let mut record = HashMap::with_capacity(fields.len() / 2);
            for pair in fields.chunks(2) {
                if let [key, value] = pair
                    && let (Some(key), Some(value)) = (key.as_str(), value.as_str())
                {
                    record.insert(key, value);
                }
            }
            Ok(record)
        })
        .collect()
}
