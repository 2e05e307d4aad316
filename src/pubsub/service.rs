//! Managed background subscriber
//!
//! [`ResilientPubSubService`] keeps one subscription alive on a background
//! task. Lifecycle changes go through a CAS state machine:
//!
//! ```text
//! Stopped -> Starting -> Started -> Stopping -> Stopped
//!                 any -> Disposed (terminal)
//! ```
//!
//! Stop / restart / reset requests are delivered in-band: the requesting
//! instance records its pending operation and publishes `CTRL` on its own
//! channels. When publishing is impossible (monitor nodes reject PUBLISH, or
//! the publish fails) the session is cancelled instead, which drops the
//! connection.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, sleep};

use super::control::{ControlFrame, ControlMessage, Operation, PendingOperation, decode_control};
use super::state::{ServiceState, StateCell};
use super::subscription::{Subscription, SubscriptionEvent};
use super::{
    BytesMessageCallback, Callback, ErrorCallback, MessageCallback, NameCallback, guarded,
};
use crate::clock::{current_time_ms, elapsed_ms, jittered_backoff};
use crate::config::PubSubConfig;
use crate::client::RedisClient;
use crate::error::{Error, Result};
use crate::resolver::Resolver;

/// Lifecycle and message hooks. Every hook is optional; panics inside a hook
/// are caught and logged.
#[derive(Clone, Default)]
pub struct PubSubCallbacks {
    pub on_init: Option<Callback>,
    pub on_start: Option<Callback>,
    pub on_stop: Option<Callback>,
    pub on_dispose: Option<Callback>,
    pub on_message: Option<MessageCallback>,
    pub on_message_bytes: Option<BytesMessageCallback>,
    pub on_unsubscribe: Option<NameCallback>,
    /// Receives the name of the control operation being performed
    pub on_control_command: Option<NameCallback>,
    pub on_error: Option<ErrorCallback>,
    pub on_heartbeat_sent: Option<Callback>,
    pub on_heartbeat_received: Option<Callback>,
}

impl PubSubCallbacks {
    pub fn on_init(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_init = Some(Arc::new(f));
        self
    }

    pub fn on_start(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_start = Some(Arc::new(f));
        self
    }

    pub fn on_stop(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_stop = Some(Arc::new(f));
        self
    }

    pub fn on_dispose(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_dispose = Some(Arc::new(f));
        self
    }

    pub fn on_message(mut self, f: impl Fn(&str, &str) + Send + Sync + 'static) -> Self {
        self.on_message = Some(Arc::new(f));
        self
    }

    pub fn on_message_bytes(mut self, f: impl Fn(&str, &[u8]) + Send + Sync + 'static) -> Self {
        self.on_message_bytes = Some(Arc::new(f));
        self
    }

    pub fn on_unsubscribe(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_unsubscribe = Some(Arc::new(f));
        self
    }

    pub fn on_control_command(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_control_command = Some(Arc::new(f));
        self
    }

    pub fn on_error(mut self, f: impl Fn(&Error) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    pub fn on_heartbeat_sent(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_heartbeat_sent = Some(Arc::new(f));
        self
    }

    pub fn on_heartbeat_received(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_heartbeat_received = Some(Arc::new(f));
        self
    }
}

fn fire(name: &str, cb: &Option<Callback>) {
    if let Some(cb) = cb {
        guarded(name, || cb());
    }
}

pub struct PubSubServiceBuilder {
    resolver: Arc<dyn Resolver>,
    channels: Vec<String>,
    by_pattern: bool,
    is_sentinel_subscription: bool,
    config: PubSubConfig,
    callbacks: PubSubCallbacks,
}

impl PubSubServiceBuilder {
    /// Treat the channel list as PSUBSCRIBE patterns
    pub fn patterns(mut self) -> Self {
        self.by_pattern = true;
        self
    }

    /// Subscription to a sentinel's event stream: no TIME snapshot, no
    /// heartbeat, stop requests cancel the session directly
    pub fn sentinel_subscription(mut self) -> Self {
        self.is_sentinel_subscription = true;
        self
    }

    pub fn config(mut self, config: PubSubConfig) -> Self {
        self.config = config;
        self
    }

    pub fn callbacks(mut self, callbacks: PubSubCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    pub fn build(self) -> ResilientPubSubService {
        ResilientPubSubService {
            inner: Arc::new(ServiceInner {
                resolver: self.resolver,
                channels: self.channels,
                by_pattern: self.by_pattern,
                is_sentinel_subscription: self.is_sentinel_subscription,
                config: self.config,
                callbacks: self.callbacks,
                state: StateCell::default(),
                pending: PendingOperation::default(),
                stop_requested: AtomicBool::new(false),
                times_started: AtomicU64::new(0),
                errors: AtomicU64::new(0),
                continuous_errors: AtomicU64::new(0),
                last_error: Mutex::new(None),
                last_pulse_ms: AtomicU64::new(current_time_ms()),
                server_time_offset_ms: AtomicI64::new(0),
                cancel: watch::channel(0).0,
                publisher: tokio::sync::Mutex::new(None),
                task: Mutex::new(None),
                heartbeat: Mutex::new(None),
            }),
        }
    }
}

pub struct ResilientPubSubService {
    inner: Arc<ServiceInner>,
}

struct ServiceInner {
    resolver: Arc<dyn Resolver>,
    channels: Vec<String>,
    by_pattern: bool,
    is_sentinel_subscription: bool,
    config: PubSubConfig,
    callbacks: PubSubCallbacks,
    state: StateCell,
    pending: PendingOperation,
    /// Set by stop/dispose; suppresses auto-restart
    stop_requested: AtomicBool,
    times_started: AtomicU64,
    errors: AtomicU64,
    continuous_errors: AtomicU64,
    last_error: Mutex<Option<String>>,
    last_pulse_ms: AtomicU64,
    server_time_offset_ms: AtomicI64,
    /// Bumped to drop the current session's connection
    cancel: watch::Sender<u64>,
    /// Connection used for CTRL and pulses, replaced each session
    publisher: tokio::sync::Mutex<Option<RedisClient>>,
    task: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<JoinHandle<()>>>,
}

impl ResilientPubSubService {
    pub fn builder(resolver: Arc<dyn Resolver>, channels: Vec<String>) -> PubSubServiceBuilder {
        PubSubServiceBuilder {
            resolver,
            channels,
            by_pattern: false,
            is_sentinel_subscription: false,
            config: PubSubConfig::default(),
            callbacks: PubSubCallbacks::default(),
        }
    }

    /// Start listening. No-op when already starting or started.
    pub async fn start(&self) -> Result<()> {
        self.inner.start().await
    }

    pub async fn stop(&self) -> Result<()> {
        if self.inner.state.get() == ServiceState::Disposed {
            return Err(Error::Disposed);
        }
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        self.inner.request(Operation::Stop).await
    }

    pub async fn restart(&self) -> Result<()> {
        self.inner.request(Operation::Restart).await
    }

    /// Drop the subscription and resubscribe on a fresh connection
    pub async fn reset(&self) -> Result<()> {
        self.inner.request(Operation::Reset).await
    }

    pub async fn dispose(&self) {
        let inner = &self.inner;
        if inner.state.get() == ServiceState::Disposed {
            return;
        }
        inner.stop_requested.store(true, Ordering::SeqCst);
        if let Err(e) = inner.request(Operation::Stop).await {
            log::debug!("Stop during dispose failed: {}", e);
        }

        let grace = inner.config.dispose_grace;
        if !inner.wait_for_exit(grace).await {
            log::warn!(
                "Subscription to {:?} still running after {:?}, closing connection",
                inner.channels,
                grace
            );
            inner.cancel_session();
            inner.wait_for_exit(Duration::from_millis(100)).await;
        }

        inner.abort_tasks();
        inner.close_publisher().await;
        if inner.state.force(ServiceState::Disposed).is_some() {
            fire("on_dispose", &inner.callbacks.on_dispose);
        }
    }

    pub fn state(&self) -> ServiceState {
        self.inner.state.get()
    }

    /// Current state name
    pub fn status(&self) -> &'static str {
        self.inner.state.get().name()
    }

    pub fn is_background_alive(&self) -> bool {
        self.inner.is_background_alive()
    }

    pub fn times_started(&self) -> u64 {
        self.inner.times_started.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> u64 {
        self.inner.errors.load(Ordering::SeqCst)
    }

    pub fn continuous_errors(&self) -> u64 {
        self.inner.continuous_errors.load(Ordering::SeqCst)
    }

    pub fn channels(&self) -> &[String] {
        &self.inner.channels
    }

    pub fn config(&self) -> &PubSubConfig {
        &self.inner.config
    }

    /// Timestamp (ms) of the last received pulse or session start
    pub fn last_heartbeat_ms(&self) -> u64 {
        self.inner.last_pulse_ms.load(Ordering::SeqCst)
    }

    /// Server wall clock estimated from the offset captured at start
    pub fn current_server_time_ms(&self) -> u64 {
        let offset = self.inner.server_time_offset_ms.load(Ordering::SeqCst);
        (current_time_ms() as i64).saturating_add(offset).max(0) as u64
    }

    pub fn stats_description(&self) -> String {
        let inner = &self.inner;
        format!(
            "===============\n\
             Current Status: {}\n\
             Listening On: {}\n\
             Times Started: {}\n\
             Num of Errors: {}\n\
             Num of Continuous Errors: {}\n\
             Last ErrorMsg: {}\n\
             ===============",
            self.status(),
            inner.channels.join(", "),
            self.times_started(),
            self.errors(),
            self.continuous_errors(),
            inner.last_error.lock().as_deref().unwrap_or("")
        )
    }
}

impl Drop for ResilientPubSubService {
    fn drop(&mut self) {
        if self.inner.state.get() != ServiceState::Disposed {
            self.inner.stop_requested.store(true, Ordering::SeqCst);
            self.inner.cancel_session();
            self.inner.abort_tasks();
            self.inner.state.force(ServiceState::Disposed);
        }
    }
}

impl ServiceInner {
    async fn start(self: &Arc<Self>) -> Result<()> {
        match self.state.get() {
            ServiceState::Disposed => return Err(Error::Disposed),
            ServiceState::Starting | ServiceState::Started => return Ok(()),
            _ => {}
        }

        if !self.prepare_start(true).await {
            return match self.state.get() {
                ServiceState::Disposed => Err(Error::Disposed),
                _ => Ok(()),
            };
        }

        {
            let mut task = self.task.lock();
            let inner = self.clone();
            *task = Some(tokio::spawn(async move { inner.run().await }));
        }
        self.ensure_heartbeat();
        Ok(())
    }

    /// Win `Stopped -> Starting` and run the pre-session steps.
    /// Returns false when another caller owns the start, or when an automatic
    /// restart raced a `stop()`.
    async fn prepare_start(self: &Arc<Self>, requested: bool) -> bool {
        if !self
            .state
            .transition(ServiceState::Stopped, ServiceState::Starting)
        {
            return false;
        }
        if requested {
            self.stop_requested.store(false, Ordering::SeqCst);
        } else if self.stop_requested.load(Ordering::SeqCst) {
            self.state
                .transition(ServiceState::Starting, ServiceState::Stopped);
            log::debug!("Stop requested, not restarting {:?}", self.channels);
            return false;
        }
        fire("on_init", &self.callbacks.on_init);

        if !self.is_sentinel_subscription
            && let Err(e) = self.snapshot_server_time().await
        {
            log::warn!("Could not read server time for {:?}: {}", self.channels, e);
        }

        let attempt = self.continuous_errors.load(Ordering::SeqCst).min(u32::MAX as u64) as u32;
        let backoff = jittered_backoff(attempt);
        if !backoff.is_zero() {
            log::debug!(
                "Waiting {:?} before subscribing to {:?} ({} continuous errors)",
                backoff,
                self.channels,
                attempt
            );
            sleep(backoff).await;
        }
        true
    }

    async fn snapshot_server_time(&self) -> Result<()> {
        let mut client = self.resolver.create_slave_client(0).await?;
        let server_ms = client.time_ms().await?;
        self.server_time_offset_ms.store(
            server_ms as i64 - current_time_ms() as i64,
            Ordering::SeqCst,
        );
        client.close().await;
        Ok(())
    }

    async fn run(self: Arc<Self>) {
        loop {
            let restart = match self.run_session().await {
                Ok(Operation::Reset)
                    if self.state.get() == ServiceState::Started
                        && !self.stop_requested.load(Ordering::SeqCst) =>
                {
                    log::debug!("Resubscribing to {:?}", self.channels);
                    continue;
                }
                Ok(Operation::Restart) => {
                    self.finish_stop();
                    true
                }
                Ok(_) => {
                    self.finish_stop();
                    false
                }
                Err(e) => self.handle_error(e).await,
            };

            if !restart || !self.prepare_start(false).await {
                return;
            }
        }
    }

    /// One subscription session. Returns the operation that ended it.
    async fn run_session(self: &Arc<Self>) -> Result<Operation> {
        let mut cancel_rx = self.cancel.subscribe();
        if !matches!(
            self.state.get(),
            ServiceState::Starting | ServiceState::Started
        ) {
            return Ok(self.pending.take());
        }
        self.close_publisher().await;

        let client = tokio::select! {
            client = self.resolver.create_slave_client(0) => Some(client),
            _ = cancel_rx.changed() => None,
        };
        let Some(client) = client else {
            return Ok(self.pending.take());
        };

        let mut sub = Subscription::new(client?.into_connection());
        if self.by_pattern {
            sub.subscribe_to_channels_matching_patterns(&self.channels)
                .await?;
        } else {
            sub.subscribe_to_channels(&self.channels).await?;
        }

        let mut ending: Option<Operation> = None;
        loop {
            let event = tokio::select! {
                event = sub.next_event() => Some(event),
                _ = cancel_rx.changed() => None,
            };
            let Some(event) = event else {
                log::debug!("Subscription to {:?} cancelled", self.channels);
                sub.close().await;
                return Ok(ending.unwrap_or_else(|| self.pending.take()));
            };

            match event? {
                SubscriptionEvent::Subscribed { .. } => {
                    if self
                        .state
                        .transition(ServiceState::Starting, ServiceState::Started)
                    {
                        self.times_started.fetch_add(1, Ordering::SeqCst);
                        self.continuous_errors.store(0, Ordering::SeqCst);
                        self.last_pulse_ms.store(current_time_ms(), Ordering::SeqCst);
                        log::info!("Subscribed to {:?}", self.channels);
                        fire("on_start", &self.callbacks.on_start);
                    } else if self.state.get() == ServiceState::Stopping && ending.is_none() {
                        // stop requested before the subscription was confirmed
                        ending = Some(match self.pending.take() {
                            Operation::NoOp => Operation::Stop,
                            op => op,
                        });
                        self.unsubscribe_targets(&mut sub).await?;
                    }
                }
                SubscriptionEvent::Unsubscribed { channel, count, .. } => {
                    if let (Some(channel), Some(cb)) = (&channel, &self.callbacks.on_unsubscribe) {
                        guarded("on_unsubscribe", || cb(channel.as_str()));
                    }
                    if count <= 0 {
                        sub.close().await;
                        return Ok(ending.unwrap_or(Operation::Reset));
                    }
                }
                SubscriptionEvent::Message {
                    channel, payload, ..
                } => match decode_control(&payload) {
                    None => {
                        if let Some(cb) = &self.callbacks.on_message_bytes {
                            guarded("on_message_bytes", || cb(channel.as_str(), &payload[..]));
                        }
                        if let Some(cb) = &self.callbacks.on_message {
                            let text = String::from_utf8_lossy(&payload);
                            guarded("on_message", || cb(channel.as_str(), &*text));
                        }
                    }
                    Some(ControlFrame::Pulse) => {
                        self.last_pulse_ms.store(current_time_ms(), Ordering::SeqCst);
                        fire("on_heartbeat_received", &self.callbacks.on_heartbeat_received);
                    }
                    Some(ControlFrame::Wake) => {
                        let op = self.pending.take();
                        // another instance's command
                        let Some(name) = op.name() else { continue };
                        log::debug!("Control command {} on {}", name, channel);
                        if let Some(cb) = &self.callbacks.on_control_command {
                            guarded("on_control_command", || cb(name));
                        }
                        if ending.is_none() {
                            ending = Some(op);
                            self.unsubscribe_targets(&mut sub).await?;
                        }
                    }
                    Some(ControlFrame::Unknown(subtype)) => {
                        log::debug!(
                            "Ignoring control message CTRL:{} on {}",
                            String::from_utf8_lossy(subtype),
                            channel
                        );
                    }
                },
            }
        }
    }

    /// Unsubscribe every configured target, confirmed or not; the server
    /// handles commands in order, so the count still reaches zero
    async fn unsubscribe_targets(&self, sub: &mut Subscription) -> Result<()> {
        if self.by_pattern {
            sub.unsubscribe_from_channels_matching_any_patterns(&self.channels)
                .await
        } else {
            sub.unsubscribe_from_channels(&self.channels).await
        }
    }

    /// Returns true when the service should start again
    async fn handle_error(&self, e: Error) -> bool {
        self.errors.fetch_add(1, Ordering::SeqCst);
        let continuous = self.continuous_errors.fetch_add(1, Ordering::SeqCst) + 1;
        *self.last_error.lock() = Some(e.to_string());

        if self.state.get() == ServiceState::Disposed {
            return false;
        }
        self.state.force(ServiceState::Stopped);

        log::warn!(
            "Subscription to {:?} failed ({} continuous errors): {}",
            self.channels,
            continuous,
            e
        );
        if let Some(cb) = &self.callbacks.on_error {
            guarded("on_error", || cb(&e));
        }
        fire("on_stop", &self.callbacks.on_stop);

        if !self.config.auto_restart || self.stop_requested.load(Ordering::SeqCst) {
            return false;
        }
        if let Some(wait) = self.config.wait_before_next_restart {
            sleep(wait).await;
        }
        !self.stop_requested.load(Ordering::SeqCst)
            && self.state.get() != ServiceState::Disposed
    }

    fn finish_stop(&self) {
        if self.state.force(ServiceState::Stopped).is_some() {
            log::info!("Unsubscribed from {:?}", self.channels);
            fire("on_stop", &self.callbacks.on_stop);
        }
    }

    async fn request(self: &Arc<Self>, op: Operation) -> Result<()> {
        match self.state.get() {
            ServiceState::Disposed => return Err(Error::Disposed),
            ServiceState::Started if op == Operation::Reset => {
                self.pending.set(op);
                self.signal().await;
                return Ok(());
            }
            _ if op == Operation::Reset => return Ok(()),
            _ => {}
        }

        if self
            .state
            .transition(ServiceState::Started, ServiceState::Stopping)
        {
            self.pending.set(op);
            self.signal().await;
        } else if self
            .state
            .transition(ServiceState::Starting, ServiceState::Stopping)
        {
            // nothing is subscribed yet to hear a CTRL message
            self.pending.set(op);
            self.cancel_session();
        }
        Ok(())
    }

    /// Wake the session: `CTRL` on our channels, or cancellation when that is impossible
    async fn signal(&self) {
        if self.is_sentinel_subscription {
            self.cancel_session();
            return;
        }
        if let Err(e) = self.publish_control(ControlMessage::Wake).await {
            log::warn!(
                "Could not publish control message to {:?}, closing subscription: {}",
                self.channels,
                e
            );
            self.cancel_session();
        }
    }

    async fn publish_control(&self, msg: ControlMessage) -> Result<()> {
        let mut slot = self.publisher.lock().await;
        let reused = slot.is_some();
        match self.publish_on(&mut slot, msg).await {
            Err(e) if reused => {
                log::debug!("Publish connection for {:?} failed, reconnecting: {}", self.channels, e);
                self.publish_on(&mut slot, msg).await
            }
            result => result,
        }
    }

    /// Publish on the cached connection, connecting first when there is none.
    /// A failed connection is dropped.
    async fn publish_on(&self, slot: &mut Option<RedisClient>, msg: ControlMessage) -> Result<()> {
        let mut client = match slot.take() {
            Some(client) => client,
            None => self.resolver.create_master_client(0).await?,
        };
        for channel in &self.channels {
            client.publish(channel, msg.encode()).await?;
        }
        *slot = Some(client);
        Ok(())
    }

    async fn close_publisher(&self) {
        let client = self.publisher.lock().await.take();
        if let Some(client) = client {
            client.close().await;
        }
    }

    fn cancel_session(&self) {
        self.cancel.send_modify(|generation| *generation = generation.wrapping_add(1));
    }

    fn is_background_alive(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    async fn wait_for_exit(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while self.is_background_alive() {
            if Instant::now() >= deadline {
                return false;
            }
            sleep(Duration::from_millis(10)).await;
        }
        true
    }

    fn abort_tasks(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.abort();
        }
    }

    fn ensure_heartbeat(self: &Arc<Self>) {
        if self.is_sentinel_subscription {
            return;
        }
        let interval = self.config.heartbeat_interval;
        let timeout = self.config.heartbeat_timeout;
        let Some(period) = interval.or_else(|| timeout.map(|t| t / 4)) else {
            return;
        };
        let period = period.max(Duration::from_millis(1));

        let mut slot = self.heartbeat.lock();
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                inner.heartbeat_tick(interval.is_some(), timeout);
            }
        }));
    }

    fn heartbeat_tick(self: &Arc<Self>, send_pulse: bool, timeout: Option<Duration>) {
        if self.state.get() != ServiceState::Started {
            return;
        }

        if send_pulse {
            fire("on_heartbeat_sent", &self.callbacks.on_heartbeat_sent);
            let inner = self.clone();
            tokio::spawn(async move {
                if let Err(e) = inner.publish_control(ControlMessage::Pulse).await {
                    log::debug!("Heartbeat publish to {:?} failed: {}", inner.channels, e);
                }
            });
        }

        let Some(timeout) = timeout else { return };
        let silent_ms = elapsed_ms(self.last_pulse_ms.load(Ordering::SeqCst));
        if silent_ms <= timeout.as_millis() as u64 {
            return;
        }

        // a stop may have landed since the check above
        if self.stop_requested.load(Ordering::SeqCst) {
            return;
        }
        if self
            .state
            .transition(ServiceState::Started, ServiceState::Stopping)
        {
            log::warn!(
                "No heartbeat on {:?} for {}ms, restarting subscription",
                self.channels,
                silent_ms
            );
            self.pending.set(Operation::Restart);
            self.cancel_session();
        }
    }
}
