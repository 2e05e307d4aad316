//! In-memory node network for tests
//!
//! Every [`MockNode`] answers the small command surface the HA layer uses:
//! connection handshake, `ROLE` / `INFO`, `TIME`, pub/sub, and the sentinel
//! reporting commands. Nodes can be made unreachable, have their role
//! changed, or have all open connections dropped.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::client::{Connector, NodeConnection, ServerRole};
use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::protocol::RespValue;

#[derive(Clone, Default)]
pub struct MockNetwork {
    nodes: Arc<Mutex<HashMap<String, Arc<MockNode>>>>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(self.clone())
    }

    fn add(&self, host: &str, role: ServerRole) -> Arc<MockNode> {
        let node = Arc::new(MockNode::new(host, role));
        self.nodes.lock().insert(host.to_string(), node.clone());
        node
    }

    pub fn add_master(&self, host: &str) -> Arc<MockNode> {
        self.add(host, ServerRole::Master)
    }

    pub fn add_replica(&self, host: &str) -> Arc<MockNode> {
        self.add(host, ServerRole::Slave)
    }

    pub fn add_sentinel(&self, host: &str) -> Arc<MockNode> {
        let node = self.add(host, ServerRole::Sentinel);
        node.accepts_publish.store(false, Ordering::SeqCst);
        node
    }

    pub fn node(&self, host: &str) -> Option<Arc<MockNode>> {
        self.nodes.lock().get(host).cloned()
    }
}

#[async_trait]
impl Connector for MockNetwork {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn NodeConnection>> {
        let host = endpoint.host_string();
        let node = self.node(&host);
        let refused = || Error::Connect {
            host: host.clone(),
            source: std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused"),
        };

        let node = node.ok_or_else(refused)?;
        if !node.reachable.load(Ordering::SeqCst) {
            return Err(refused());
        }
        node.connects.fetch_add(1, Ordering::SeqCst);

        let (tx, rx) = mpsc::unbounded_channel();
        let kill_rx = node.kill_tx.subscribe();
        Ok(Box::new(MockConnection {
            id: node.next_conn_id.fetch_add(1, Ordering::SeqCst),
            node,
            endpoint: endpoint.clone(),
            tx,
            rx,
            kill_rx,
            closed: false,
        }))
    }
}

struct Subscriber {
    conn_id: u64,
    channels: BTreeSet<String>,
    patterns: BTreeSet<String>,
    tx: mpsc::UnboundedSender<RespValue>,
}

impl Subscriber {
    fn count(&self) -> i64 {
        (self.channels.len() + self.patterns.len()) as i64
    }
}

pub struct MockNode {
    host: String,
    reachable: AtomicBool,
    connects: AtomicUsize,
    role: Mutex<ServerRole>,
    role_command_supported: AtomicBool,
    accepts_publish: AtomicBool,
    delivers_publish: AtomicBool,
    commands: Mutex<Vec<Vec<String>>>,
    masters: Mutex<HashMap<String, String>>,
    replicas: Mutex<Vec<Vec<(String, String)>>>,
    sentinels: Mutex<Vec<Vec<(String, String)>>>,
    failovers: AtomicUsize,
    subscribers: Mutex<Vec<Subscriber>>,
    next_conn_id: AtomicU64,
    kill_tx: watch::Sender<u64>,
}

impl MockNode {
    fn new(host: &str, role: ServerRole) -> Self {
        Self {
            host: host.to_string(),
            reachable: AtomicBool::new(true),
            connects: AtomicUsize::new(0),
            role: Mutex::new(role),
            role_command_supported: AtomicBool::new(true),
            accepts_publish: AtomicBool::new(true),
            delivers_publish: AtomicBool::new(true),
            commands: Mutex::new(Vec::new()),
            masters: Mutex::new(HashMap::new()),
            replicas: Mutex::new(Vec::new()),
            sentinels: Mutex::new(Vec::new()),
            failovers: AtomicUsize::new(0),
            subscribers: Mutex::new(Vec::new()),
            next_conn_id: AtomicU64::new(1),
            kill_tx: watch::channel(0).0,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Unreachable nodes refuse connections and drop the open ones
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
        if !reachable {
            self.drop_connections();
        }
    }

    pub fn set_role(&self, role: ServerRole) {
        *self.role.lock() = role;
    }

    pub fn set_accepts_publish(&self, accepts: bool) {
        self.accepts_publish.store(accepts, Ordering::SeqCst);
    }

    /// When false, PUBLISH is acknowledged but never reaches subscribers
    pub fn set_delivers_publish(&self, delivers: bool) {
        self.delivers_publish.store(delivers, Ordering::SeqCst);
    }

    pub fn set_role_command_supported(&self, supported: bool) {
        self.role_command_supported.store(supported, Ordering::SeqCst);
    }

    /// Master reported by this sentinel for `group`
    pub fn set_master(&self, group: &str, host: &str) {
        self.masters
            .lock()
            .insert(group.to_string(), host.to_string());
    }

    /// Replicas reported by this sentinel, as `(host:port, flags)`
    pub fn set_replicas(&self, replicas: &[(&str, &str)]) {
        *self.replicas.lock() = replicas.iter().map(|(h, f)| node_fields(h, f)).collect();
    }

    /// Peer sentinels reported by this sentinel, as `(host:port, flags)`
    pub fn set_sentinels(&self, sentinels: &[(&str, &str)]) {
        *self.sentinels.lock() = sentinels.iter().map(|(h, f)| node_fields(h, f)).collect();
    }

    /// Close every open connection to this node
    pub fn drop_connections(&self) {
        self.subscribers.lock().clear();
        self.kill_tx.send_modify(|generation| *generation += 1);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn failover_count(&self) -> usize {
        self.failovers.load(Ordering::SeqCst)
    }

    pub fn commands(&self) -> Vec<Vec<String>> {
        self.commands.lock().clone()
    }

    /// Commands whose name matches `name` (case-insensitive)
    pub fn commands_named(&self, name: &str) -> Vec<Vec<String>> {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.first().is_some_and(|n| n.eq_ignore_ascii_case(name)))
            .cloned()
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Send an arbitrary frame to every subscribed connection
    pub fn push_raw(&self, frame: RespValue) -> usize {
        let subs = self.subscribers.lock();
        subs.iter()
            .filter(|sub| sub.tx.send(frame.clone()).is_ok())
            .count()
    }

    /// Deliver a message as if published on this node; returns the receiver count
    pub fn emit(&self, channel: &str, message: &str) -> usize {
        let mut delivered = 0;
        self.subscribers.lock().retain(|sub| {
            let mut alive = true;
            if sub.channels.contains(channel) {
                alive &= sub
                    .tx
                    .send(push_frame(&["message", channel, message]))
                    .is_ok();
                delivered += alive as usize;
            }
            for pattern in sub.patterns.iter().filter(|p| glob_match(p, channel)) {
                alive &= sub
                    .tx
                    .send(push_frame(&["pmessage", pattern, channel, message]))
                    .is_ok();
                delivered += alive as usize;
            }
            alive
        });
        delivered
    }

    fn handle(&self, conn_id: u64, tx: &mpsc::UnboundedSender<RespValue>, args: &[String]) {
        let reply = |v: RespValue| {
            let _ = tx.send(v);
        };
        let Some(name) = args.first().map(|a| a.to_ascii_uppercase()) else {
            return reply(RespValue::error("ERR empty command"));
        };

        match name.as_str() {
            "PING" => reply(RespValue::SimpleString(Bytes::from_static(b"PONG"))),
            "AUTH" | "SELECT" => reply(RespValue::SimpleString(Bytes::from_static(b"OK"))),
            "ROLE" if !self.role_command_supported.load(Ordering::SeqCst) => {
                reply(RespValue::error("ERR unknown command 'ROLE'"))
            }
            "ROLE" => reply(match *self.role.lock() {
                ServerRole::Master => RespValue::array(vec![
                    RespValue::bulk_string("master"),
                    RespValue::integer(0),
                    RespValue::array(vec![]),
                ]),
                ServerRole::Slave => RespValue::array(vec![
                    RespValue::bulk_string("slave"),
                    RespValue::bulk_string("127.0.0.1"),
                    RespValue::integer(6379),
                    RespValue::bulk_string("connected"),
                    RespValue::integer(0),
                ]),
                ServerRole::Sentinel => RespValue::array(vec![
                    RespValue::bulk_string("sentinel"),
                    RespValue::array(vec![]),
                ]),
                ServerRole::Unknown => RespValue::array(vec![RespValue::bulk_string("?")]),
            }),
            "INFO" => {
                let role = self.role.lock().as_str();
                reply(RespValue::bulk_string(&format!(
                    "# Replication\r\nrole:{}\r\nconnected_slaves:0\r\n",
                    role
                )))
            }
            "TIME" => {
                let now = crate::clock::current_time_ms();
                reply(RespValue::array(vec![
                    RespValue::bulk_string(&(now / 1000).to_string()),
                    RespValue::bulk_string(&((now % 1000) * 1000).to_string()),
                ]))
            }
            "PUBLISH" if !self.accepts_publish.load(Ordering::SeqCst) => {
                reply(RespValue::error("ERR unknown command 'PUBLISH'"))
            }
            "PUBLISH" if !self.delivers_publish.load(Ordering::SeqCst) => {
                reply(RespValue::integer(0))
            }
            "PUBLISH" if args.len() == 3 => {
                let n = self.emit(&args[1], &args[2]);
                reply(RespValue::integer(n as i64))
            }
            "SUBSCRIBE" | "PSUBSCRIBE" => self.subscribe(conn_id, tx, &name, &args[1..]),
            "UNSUBSCRIBE" | "PUNSUBSCRIBE" => self.unsubscribe(conn_id, tx, &name, &args[1..]),
            "SENTINEL" => reply(self.sentinel_command(args)),
            _ => reply(RespValue::error(&format!("ERR unknown command '{}'", args[0]))),
        }
    }

    fn subscribe(
        &self,
        conn_id: u64,
        tx: &mpsc::UnboundedSender<RespValue>,
        name: &str,
        targets: &[String],
    ) {
        let pattern = name == "PSUBSCRIBE";
        let kind = if pattern { "psubscribe" } else { "subscribe" };
        let mut subs = self.subscribers.lock();
        let idx = match subs.iter().position(|s| s.conn_id == conn_id) {
            Some(idx) => idx,
            None => {
                subs.push(Subscriber {
                    conn_id,
                    channels: BTreeSet::new(),
                    patterns: BTreeSet::new(),
                    tx: tx.clone(),
                });
                subs.len() - 1
            }
        };
        let sub = &mut subs[idx];
        for target in targets {
            if pattern {
                sub.patterns.insert(target.clone());
            } else {
                sub.channels.insert(target.clone());
            }
            let _ = tx.send(RespValue::array(vec![
                RespValue::bulk_string(kind),
                RespValue::bulk_string(target),
                RespValue::integer(sub.count()),
            ]));
        }
    }

    fn unsubscribe(
        &self,
        conn_id: u64,
        tx: &mpsc::UnboundedSender<RespValue>,
        name: &str,
        targets: &[String],
    ) {
        let pattern = name == "PUNSUBSCRIBE";
        let kind = if pattern { "punsubscribe" } else { "unsubscribe" };
        let mut subs = self.subscribers.lock();
        let Some(idx) = subs.iter().position(|s| s.conn_id == conn_id) else {
            let _ = tx.send(RespValue::array(vec![
                RespValue::bulk_string(kind),
                RespValue::Null,
                RespValue::integer(0),
            ]));
            return;
        };

        let sub = &mut subs[idx];
        let set = if pattern {
            &mut sub.patterns
        } else {
            &mut sub.channels
        };
        let targets: Vec<String> = if targets.is_empty() {
            set.iter().cloned().collect()
        } else {
            targets.to_vec()
        };

        if targets.is_empty() {
            let _ = tx.send(RespValue::array(vec![
                RespValue::bulk_string(kind),
                RespValue::Null,
                RespValue::integer(sub.count()),
            ]));
        }
        for target in targets {
            if pattern {
                sub.patterns.remove(&target);
            } else {
                sub.channels.remove(&target);
            }
            let _ = tx.send(RespValue::array(vec![
                RespValue::bulk_string(kind),
                RespValue::bulk_string(&target),
                RespValue::integer(sub.count()),
            ]));
        }
        if sub.count() == 0 {
            subs.remove(idx);
        }
    }

    fn sentinel_command(&self, args: &[String]) -> RespValue {
        let sub = args.get(1).map(|s| s.to_ascii_lowercase()).unwrap_or_default();
        let group = args.get(2).cloned().unwrap_or_default();

        match sub.as_str() {
            "get-master-addr-by-name" => match self.masters.lock().get(&group) {
                Some(host) => {
                    let (ip, port) = host.rsplit_once(':').unwrap_or((host.as_str(), "6379"));
                    RespValue::array(vec![
                        RespValue::bulk_string(ip),
                        RespValue::bulk_string(port),
                    ])
                }
                None => RespValue::Null,
            },
            "replicas" | "slaves" => flat_records(&self.replicas.lock()),
            "sentinels" => flat_records(&self.sentinels.lock()),
            "failover" => {
                self.failovers.fetch_add(1, Ordering::SeqCst);
                RespValue::SimpleString(Bytes::from_static(b"OK"))
            }
            _ => RespValue::error("ERR unknown sentinel subcommand"),
        }
    }

    fn forget(&self, conn_id: u64) {
        self.subscribers.lock().retain(|s| s.conn_id != conn_id);
    }
}

struct MockConnection {
    id: u64,
    node: Arc<MockNode>,
    endpoint: Endpoint,
    tx: mpsc::UnboundedSender<RespValue>,
    rx: mpsc::UnboundedReceiver<RespValue>,
    kill_rx: watch::Receiver<u64>,
    closed: bool,
}

#[async_trait]
impl NodeConnection for MockConnection {
    async fn send(&mut self, parts: &[&[u8]]) -> Result<()> {
        if self.closed || self.kill_rx.has_changed().unwrap_or(true) {
            self.closed = true;
            return Err(Error::ConnectionClosed(self.endpoint.host_string()));
        }
        let args: Vec<String> = parts
            .iter()
            .map(|p| String::from_utf8_lossy(p).into_owned())
            .collect();
        self.node.commands.lock().push(args.clone());
        self.node.handle(self.id, &self.tx, &args);
        Ok(())
    }

    async fn receive(&mut self) -> Result<RespValue> {
        if self.closed {
            return Err(Error::ConnectionClosed(self.endpoint.host_string()));
        }
        tokio::select! {
            value = self.rx.recv() => {
                value.ok_or_else(|| Error::ConnectionClosed(self.endpoint.host_string()))
            }
            _ = self.kill_rx.changed() => {
                self.closed = true;
                Err(Error::ConnectionClosed(self.endpoint.host_string()))
            }
        }
    }

    async fn close(&mut self) {
        self.closed = true;
        self.node.forget(self.id);
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

impl Drop for MockConnection {
    fn drop(&mut self) {
        self.node.forget(self.id);
    }
}

fn node_fields(host: &str, flags: &str) -> Vec<(String, String)> {
    let (ip, port) = host.rsplit_once(':').unwrap_or((host, "6379"));
    vec![
        ("name".into(), host.into()),
        ("ip".into(), ip.into()),
        ("port".into(), port.into()),
        ("flags".into(), flags.into()),
    ]
}

fn flat_records(records: &[Vec<(String, String)>]) -> RespValue {
    RespValue::array(
        records
            .iter()
            .map(|fields| {
                RespValue::array(
                    fields
                        .iter()
                        .flat_map(|(k, v)| [RespValue::bulk_string(k), RespValue::bulk_string(v)])
                        .collect(),
                )
            })
            .collect(),
    )
}

fn push_frame(parts: &[&str]) -> RespValue {
    RespValue::array(parts.iter().map(|p| RespValue::bulk_string(p)).collect())
}

/// `*` and `?` glob
fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let (mut star, mut mark) = (None, 0);
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            mark = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            mark += 1;
            ti = mark;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_match() {
        assert!(glob_match("*", "+switch-master"));
        assert!(glob_match("news.*", "news.sport"));
        assert!(!glob_match("news.*", "weather"));
        assert!(glob_match("h?llo", "hello"));
    }
}
