//! Sentinel orchestration
//!
//! [`Sentinel`] rotates over the configured sentinels until one answers, keeps
//! a worker on it for RPCs and events, and repoints the client manager every
//! time the topology changes. The [`SentinelResolver`] it builds asks back
//! through a weak handle, so dropping the orchestrator never leaks a cycle.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::time::sleep;

use super::events::{EventKind, SentinelEvent};
use super::manager::{BasicClientManager, ClientManager, ClientManagerFactory};
use super::worker::{SentinelInfo, SentinelWorker};
use crate::client::Connector;
use crate::clock::{current_time_ms, elapsed_ms};
use crate::config::SentinelConfig;
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::pubsub::{ErrorCallback, MessageCallback, PubSubCallbacks, guarded};
use crate::resolver::sentinel::{MasterValidation, TopologySource};
use crate::resolver::{BasicResolver, SentinelResolver};
use crate::stats::{Counter, NullStats, StatsSink};

pub type FailoverCallback = Arc<dyn Fn(&SentinelInfo) + Send + Sync>;

/// Rewrites every endpoint reported by a sentinel (credentials, TLS, ...)
pub type HostFilter = Arc<dyn Fn(Endpoint) -> Endpoint + Send + Sync>;

#[derive(Clone, Default)]
pub struct SentinelCallbacks {
    pub on_failover: Option<FailoverCallback>,
    pub on_worker_error: Option<ErrorCallback>,
    /// Every event received from the active sentinel, `(channel, message)`
    pub on_sentinel_message_received: Option<MessageCallback>,
}

impl SentinelCallbacks {
    pub fn on_failover(mut self, f: impl Fn(&SentinelInfo) + Send + Sync + 'static) -> Self {
        self.on_failover = Some(Arc::new(f));
        self
    }

    pub fn on_worker_error(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_worker_error = Some(Arc::new(f));
        self
    }

    pub fn on_sentinel_message_received(
        mut self,
        f: impl Fn(&str, &str) + Send + Sync + 'static,
    ) -> Self {
        self.on_sentinel_message_received = Some(Arc::new(f));
        self
    }
}

pub struct SentinelBuilder {
    config: SentinelConfig,
    connector: Arc<dyn Connector>,
    stats: Arc<dyn StatsSink>,
    callbacks: SentinelCallbacks,
    host_filter: Option<HostFilter>,
    factory: Option<ClientManagerFactory>,
}

impl SentinelBuilder {
    pub fn stats(mut self, stats: Arc<dyn StatsSink>) -> Self {
        self.stats = stats;
        self
    }

    pub fn callbacks(mut self, callbacks: SentinelCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn host_filter(mut self, filter: impl Fn(Endpoint) -> Endpoint + Send + Sync + 'static) -> Self {
        self.host_filter = Some(Arc::new(filter));
        self
    }

    pub fn client_manager_factory(mut self, factory: ClientManagerFactory) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Fails when no sentinel is configured or a host string is malformed
    pub fn build(self) -> Result<Sentinel> {
        let endpoints = self.config.sentinel_endpoints()?;
        let factory = match self.factory {
            Some(factory) => factory,
            None => default_factory(self.connector.clone(), self.stats.clone()),
        };

        Ok(Sentinel {
            inner: Arc::new(SentinelInner {
                config: Arc::new(self.config),
                endpoints: RwLock::new(endpoints),
                connector: self.connector,
                stats: self.stats,
                callbacks: self.callbacks,
                host_filter: self.host_filter,
                factory,
                worker: tokio::sync::Mutex::new(None),
                next_index: AtomicUsize::new(0),
                last_rescan_ms: AtomicU64::new(current_time_ms()),
                manager: Mutex::new(None),
                reset_lock: tokio::sync::Mutex::new(()),
                disposed: AtomicBool::new(false),
            }),
        })
    }
}

fn default_factory(connector: Arc<dyn Connector>, stats: Arc<dyn StatsSink>) -> ClientManagerFactory {
    Arc::new(
        move |masters: Vec<Endpoint>, replicas: Vec<Endpoint>| -> Result<Arc<dyn ClientManager>> {
            let resolver =
                BasicResolver::new(masters, replicas, connector.clone())?.with_stats(stats.clone());
            Ok(Arc::new(BasicClientManager::new(Arc::new(resolver))))
        },
    )
}

pub struct Sentinel {
    inner: Arc<SentinelInner>,
}

struct SentinelInner {
    config: Arc<SentinelConfig>,
    endpoints: RwLock<Vec<Endpoint>>,
    connector: Arc<dyn Connector>,
    stats: Arc<dyn StatsSink>,
    callbacks: SentinelCallbacks,
    host_filter: Option<HostFilter>,
    factory: ClientManagerFactory,
    worker: tokio::sync::Mutex<Option<Arc<SentinelWorker>>>,
    /// Rotation cursor into `endpoints`
    next_index: AtomicUsize,
    last_rescan_ms: AtomicU64,
    manager: Mutex<Option<Arc<dyn ClientManager>>>,
    /// One topology reconfiguration at a time
    reset_lock: tokio::sync::Mutex<()>,
    disposed: AtomicBool,
}

impl Sentinel {
    pub fn builder(config: SentinelConfig, connector: Arc<dyn Connector>) -> SentinelBuilder {
        SentinelBuilder {
            config,
            connector,
            stats: Arc::new(NullStats),
            callbacks: SentinelCallbacks::default(),
            host_filter: None,
            factory: None,
        }
    }

    /// Connect to a sentinel, start listening for events, and build the client manager
    pub async fn start(&self) -> Result<Arc<dyn ClientManager>> {
        let inner = &self.inner;
        inner.get_valid_worker().await?;
        if inner.config.scan_for_other_sentinels
            && let Err(e) = inner.refresh_sentinel_hosts().await
        {
            log::warn!("Could not scan for other sentinels: {}", e);
        }
        inner.reset_clients().await
    }

    pub async fn get_valid_worker(&self) -> Result<Arc<SentinelWorker>> {
        self.inner.get_valid_worker().await
    }

    pub async fn reset_clients(&self) -> Result<Arc<dyn ClientManager>> {
        self.inner.reset_clients().await
    }

    pub async fn get_master(&self) -> Result<Endpoint> {
        self.inner.get_master().await
    }

    pub async fn get_slaves(&self) -> Result<Vec<Endpoint>> {
        self.inner.get_slaves().await
    }

    pub async fn force_master_failover(&self) -> Result<()> {
        self.inner.force_master_failover().await
    }

    pub async fn get_sentinel_info(&self) -> Result<SentinelInfo> {
        self.inner.get_sentinel_info().await
    }

    /// Ask the active sentinel for its peers and add the new ones to the rotation
    pub async fn refresh_sentinel_hosts(&self) -> Result<()> {
        self.inner.refresh_sentinel_hosts().await
    }

    pub fn client_manager(&self) -> Option<Arc<dyn ClientManager>> {
        self.inner.manager.lock().clone()
    }

    pub fn sentinel_endpoints(&self) -> Vec<Endpoint> {
        self.inner.endpoints.read().clone()
    }

    pub fn master_name(&self) -> &str {
        &self.inner.config.master_name
    }

    /// Sentinel currently used for RPCs and events
    pub async fn active_sentinel(&self) -> Option<Endpoint> {
        self.inner
            .worker
            .lock()
            .await
            .as_ref()
            .map(|w| w.endpoint().clone())
    }

    pub async fn dispose(&self) {
        let inner = &self.inner;
        if inner.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        let worker = inner.worker.lock().await.take();
        if let Some(worker) = worker {
            worker.dispose().await;
        }
        log::info!("Sentinel orchestration for '{}' disposed", inner.config.master_name);
    }
}

impl SentinelInner {
    async fn get_valid_worker(self: &Arc<Self>) -> Result<Arc<SentinelWorker>> {
        let mut slot = self.worker.lock().await;
        if let Some(worker) = slot.as_ref() {
            return Ok(worker.clone());
        }
        if self.disposed.load(Ordering::SeqCst) {
            return Err(Error::Disposed);
        }

        let endpoints = self.endpoints.read().clone();
        let limit = endpoints.len().max(5);
        let mut failures = 0;
        let mut last_error = None;

        while failures < limit {
            let index = self.next_index.load(Ordering::SeqCst) % endpoints.len();
            let endpoint = &endpoints[index];

            match self.connect_worker(endpoint).await {
                Ok(worker) => {
                    if failures > 0 {
                        self.stats.increment(Counter::RetrySuccess);
                    }
                    log::info!(
                        "Using sentinel {} for '{}'",
                        endpoint,
                        self.config.master_name
                    );
                    *slot = Some(worker.clone());
                    return Ok(worker);
                }
                Err(e) => {
                    failures += 1;
                    self.next_index.fetch_add(1, Ordering::SeqCst);
                    self.stats.increment(Counter::FailedSentinelWorkers);
                    self.stats.increment(Counter::RetryCount);
                    log::warn!("Sentinel {} is not usable: {}", endpoint, e);
                    self.worker_error(&e);
                    last_error = Some(Box::new(e));
                }
            }
        }

        self.stats.increment(Counter::RetryTimedOut);
        log::error!(
            "No sentinel for '{}' answered after {} attempts",
            self.config.master_name,
            failures
        );
        sleep(self.config.wait_between_failed_hosts).await;
        Err(Error::NoSentinelsAvailable {
            attempts: failures,
            last: last_error,
        })
    }

    async fn connect_worker(self: &Arc<Self>, endpoint: &Endpoint) -> Result<Arc<SentinelWorker>> {
        let worker = Arc::new(SentinelWorker::new(
            endpoint.clone(),
            self.config.clone(),
            self.connector.clone(),
        ));
        worker.ping().await?;
        if let Err(e) = worker
            .begin_listening_for_configuration_changes(self.listener_callbacks(&worker))
            .await
        {
            worker.dispose().await;
            return Err(e);
        }
        Ok(worker)
    }

    fn listener_callbacks(self: &Arc<Self>, worker: &Arc<SentinelWorker>) -> PubSubCallbacks {
        let on_message = Arc::downgrade(self);
        let on_error = Arc::downgrade(self);
        let listener = Arc::downgrade(worker);
        PubSubCallbacks::default()
            .on_message(move |channel, message| {
                if let Some(inner) = on_message.upgrade() {
                    inner.handle_event(channel, message);
                }
            })
            .on_error(move |e| {
                let (Some(inner), Some(worker)) = (on_error.upgrade(), listener.upgrade()) else {
                    return;
                };
                log::warn!(
                    "Event subscription to sentinel {} failed: {}",
                    worker.endpoint(),
                    e
                );
                inner.worker_error(e);
                tokio::spawn(async move { inner.replace_listener(worker).await });
            })
    }

    /// Rotate away from a sentinel whose event stream broke, then reconfigure
    /// clients if the master moved while no sentinel was listened to
    async fn replace_listener(self: &Arc<Self>, worker: Arc<SentinelWorker>) {
        if self.disposed.load(Ordering::SeqCst) || !self.drop_worker(&worker).await {
            return;
        }
        if let Err(e) = self.get_valid_worker().await {
            log::warn!(
                "No sentinel for '{}' to listen on: {}",
                self.config.master_name,
                e
            );
            return;
        }

        let Some(manager) = self.manager.lock().clone() else {
            return;
        };
        match self.get_master().await {
            Ok(master) if !manager.resolver().masters().contains(&master) => {
                log::info!("Master moved to {} while events were lost", master);
                if let Err(e) = self.reset_clients().await {
                    log::warn!("Client reconfiguration after sentinel loss failed: {}", e);
                }
            }
            Ok(_) => {}
            Err(e) => log::warn!("Master lookup after sentinel loss failed: {}", e),
        }
    }

    fn worker_error(&self, e: &Error) {
        if let Some(cb) = &self.callbacks.on_worker_error {
            guarded("on_worker_error", || cb(e));
        }
    }

    fn handle_event(self: &Arc<Self>, channel: &str, message: &str) {
        if let Some(cb) = &self.callbacks.on_sentinel_message_received {
            guarded("on_sentinel_message_received", || cb(channel, message));
        }

        let event = SentinelEvent::parse(channel, message);
        if !event.mentions_master(&self.config.master_name) {
            return;
        }
        match event.kind {
            EventKind::SubjectivelyDown => self.stats.increment(Counter::SubjectiveServersDown),
            EventKind::ObjectivelyDown => self.stats.increment(Counter::ObjectiveServersDown),
            _ => {}
        }
        if let Some((ip, port)) = event.switch_master_target() {
            log::info!(
                "Sentinel switched '{}' to {}:{}",
                self.config.master_name,
                ip,
                port
            );
        }

        if event.triggers_reset(
            self.config.reset_when_subjectively_down,
            self.config.reset_when_objectively_down,
        ) {
            log::info!("Sentinel event {} {}, reconfiguring clients", channel, message);
            let inner = self.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.reset_clients().await {
                    log::warn!("Client reconfiguration after {} failed: {}", event.channel, e);
                }
            });
        }
    }

    /// Run `op` on the active worker; a failure discards the worker so the next call rotates
    async fn with_worker<T, F, Fut>(self: &Arc<Self>, op: F) -> Result<T>
    where
        F: FnOnce(Arc<SentinelWorker>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let worker = self.get_valid_worker().await?;
        match op(worker.clone()).await {
            Ok(value) => Ok(value),
            Err(e) => {
                self.discard_worker(&worker, &e).await;
                Err(e)
            }
        }
    }

    async fn discard_worker(&self, worker: &Arc<SentinelWorker>, e: &Error) {
        log::warn!("Sentinel {} failed, rotating: {}", worker.endpoint(), e);
        self.worker_error(e);
        self.drop_worker(worker).await;
    }

    /// Clear `worker` from the active slot and advance the rotation.
    /// Returns false when another failure already replaced it.
    async fn drop_worker(&self, worker: &Arc<SentinelWorker>) -> bool {
        let was_active = {
            let mut slot = self.worker.lock().await;
            let active = slot.as_ref().is_some_and(|w| Arc::ptr_eq(w, worker));
            if active {
                slot.take();
                self.next_index.fetch_add(1, Ordering::SeqCst);
            }
            active
        };
        if was_active {
            self.stats.increment(Counter::FailedSentinelWorkers);
            worker.dispose().await;
        }
        was_active
    }

    fn filter(&self, endpoint: Endpoint) -> Endpoint {
        match &self.host_filter {
            Some(filter) => filter(endpoint),
            None => endpoint,
        }
    }

    async fn get_master(self: &Arc<Self>) -> Result<Endpoint> {
        let master = self
            .with_worker(|w| async move { w.get_master_host().await })
            .await?;

        if self.config.scan_for_other_sentinels
            && elapsed_ms(self.last_rescan_ms.load(Ordering::SeqCst))
                >= self.config.refresh_sentinel_hosts_after.as_millis() as u64
            && let Err(e) = self.refresh_sentinel_hosts().await
        {
            log::warn!("Could not scan for other sentinels: {}", e);
        }
        Ok(self.filter(master))
    }

    async fn get_slaves(self: &Arc<Self>) -> Result<Vec<Endpoint>> {
        let replicas = self
            .with_worker(|w| async move { w.get_slave_hosts().await })
            .await?;
        Ok(replicas.into_iter().map(|e| self.filter(e)).collect())
    }

    async fn force_master_failover(self: &Arc<Self>) -> Result<()> {
        self.with_worker(|w| async move { w.force_master_failover().await })
            .await
    }

    async fn get_sentinel_info(self: &Arc<Self>) -> Result<SentinelInfo> {
        let info = self
            .with_worker(|w| async move { w.get_sentinel_info().await })
            .await?;
        Ok(SentinelInfo {
            master_name: info.master_name,
            masters: info.masters.into_iter().map(|e| self.filter(e)).collect(),
            replicas: info.replicas.into_iter().map(|e| self.filter(e)).collect(),
        })
    }

    async fn refresh_sentinel_hosts(self: &Arc<Self>) -> Result<()> {
        self.last_rescan_ms.store(current_time_ms(), Ordering::SeqCst);
        let peers = self
            .with_worker(|w| async move { w.get_sentinel_hosts().await })
            .await?;

        let mut endpoints = self.endpoints.write();
        for peer in peers {
            let key = peer.host_string();
            if !endpoints.iter().any(|e| e.host_string() == key) {
                log::info!("Discovered sentinel {}", key);
                endpoints.push(peer);
            }
        }
        Ok(())
    }

    async fn reset_clients(self: &Arc<Self>) -> Result<Arc<dyn ClientManager>> {
        let _guard = self.reset_lock.lock().await;
        let info = self.get_sentinel_info().await?;

        let existing = self.manager.lock().clone();
        let Some(manager) = existing else {
            let manager = (self.factory)(info.masters.clone(), info.replicas.clone())?;
            let source: Arc<dyn TopologySource> = Arc::new(LiveTopology(Arc::downgrade(self)));
            let resolver = SentinelResolver::new(
                source,
                info.masters.clone(),
                info.replicas.clone(),
                self.connector.clone(),
                MasterValidation::from(self.config.as_ref()),
            )?
            .with_stats(self.stats.clone());
            manager.set_resolver(Arc::new(resolver));
            *self.manager.lock() = Some(manager.clone());
            log::info!("Clients configured: {}", info);
            return Ok(manager);
        };

        manager.failover_to(info.masters.clone(), info.replicas.clone())?;
        self.stats.increment(Counter::Failovers);
        log::warn!("Failover: {}", info);
        if let Some(cb) = &self.callbacks.on_failover {
            guarded("on_failover", || cb(&info));
        }
        Ok(manager)
    }
}

/// Resolver-facing view of the orchestrator
struct LiveTopology(Weak<SentinelInner>);

impl LiveTopology {
    fn inner(&self) -> Result<Arc<SentinelInner>> {
        self.0.upgrade().ok_or(Error::Disposed)
    }
}

#[async_trait]
impl TopologySource for LiveTopology {
    async fn master_host(&self) -> Result<Endpoint> {
        self.inner()?.get_master().await
    }

    async fn slave_hosts(&self) -> Result<Vec<Endpoint>> {
        self.inner()?.get_slaves().await
    }

    async fn force_master_failover(&self) -> Result<()> {
        self.inner()?.force_master_failover().await
    }
}
