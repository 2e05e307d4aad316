//! Node connections
//!
//! The [`Connector`] / [`NodeConnection`] pair is the single seam between the
//! HA layer and the network. [`TcpConnector`] speaks RESP over TCP (optionally
//! wrapped in rustls); [`RedisClient`] layers the handful of commands the HA
//! layer needs (`ROLE`, `PING`, `TIME`, `PUBLISH`, `SENTINEL ...`) on top of
//! any connection and enforces the endpoint's per-call timeouts.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::ClientConfig;
use tokio_rustls::{TlsConnector, client::TlsStream};

use crate::endpoint::Endpoint;
use crate::error::{Error, Result};
use crate::protocol::{Parser, RespValue, encode_command};

/// A single duplex RESP connection to one node
#[async_trait]
pub trait NodeConnection: Send {
    /// Write one command (as its argument list)
    async fn send(&mut self, parts: &[&[u8]]) -> Result<()>;

    /// Await the next reply or push frame
    async fn receive(&mut self) -> Result<RespValue>;

    /// Close the connection; further calls fail
    async fn close(&mut self);

    fn endpoint(&self) -> &Endpoint;
}

/// Opens connections to endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn NodeConnection>>;
}

/// Stream type for node connections
enum NodeStream {
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl NodeStream {
    async fn read_buf(&mut self, buf: &mut BytesMut) -> std::io::Result<usize> {
        match self {
            NodeStream::Tcp(s) => s.read_buf(buf).await,
            NodeStream::Tls(s) => s.read_buf(buf).await,
        }
    }

    async fn write_all(&mut self, buf: &[u8]) -> std::io::Result<()> {
        match self {
            NodeStream::Tcp(s) => s.write_all(buf).await,
            NodeStream::Tls(s) => s.write_all(buf).await,
        }
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        match self {
            NodeStream::Tcp(s) => s.shutdown().await,
            NodeStream::Tls(s) => s.shutdown().await,
        }
    }
}

/// RESP connection over TCP or TLS
pub struct RedisConnection {
    stream: Option<NodeStream>,
    buf: BytesMut,
    endpoint: Endpoint,
}

impl RedisConnection {
    fn stream(&mut self) -> Result<&mut NodeStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::ConnectionClosed(self.endpoint.host_string()))
    }
}

#[async_trait]
impl NodeConnection for RedisConnection {
    async fn send(&mut self, parts: &[&[u8]]) -> Result<()> {
        let frame = encode_command(parts);
        self.stream()?.write_all(&frame).await?;
        Ok(())
    }

    async fn receive(&mut self) -> Result<RespValue> {
        loop {
            if let Some(value) = Parser::parse(&mut self.buf)? {
                return Ok(value);
            }

            let Self { stream, buf, endpoint } = &mut *self;
            let Some(stream) = stream.as_mut() else {
                return Err(Error::ConnectionClosed(endpoint.host_string()));
            };
            if stream.read_buf(buf).await? == 0 {
                self.stream = None;
                return Err(Error::ConnectionClosed(self.endpoint.host_string()));
            }
        }
    }

    async fn close(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

/// Connector for real nodes
#[derive(Clone, Default)]
pub struct TcpConnector {
    tls: Option<Arc<ClientConfig>>,
    /// Use TLS for every endpoint, not only `ssl` ones
    always_tls: bool,
}

impl TcpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tls(config: Arc<ClientConfig>, always_tls: bool) -> Self {
        Self {
            tls: Some(config),
            always_tls,
        }
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn NodeConnection>> {
        let host = endpoint.host_string();
        let tcp_stream = TcpStream::connect((endpoint.host(), endpoint.port()))
            .await
            .map_err(|source| Error::Connect {
                host: host.clone(),
                source,
            })?;
        let _ = tcp_stream.set_nodelay(true);

        let stream = if endpoint.ssl() || self.always_tls {
            let config = self.tls.clone().ok_or_else(|| {
                Error::Tls(format!("{} requires TLS but none is configured", host))
            })?;
            let connector = TlsConnector::from(config);
            let domain = rustls::pki_types::ServerName::try_from(endpoint.host().to_string())
                .map_err(|_| Error::Tls(format!("invalid DNS name '{}'", endpoint.host())))?;
            let tls_stream = connector
                .connect(domain, tcp_stream)
                .await
                .map_err(|e| Error::Tls(format!("handshake with {} failed: {}", host, e)))?;
            NodeStream::Tls(Box::new(tls_stream))
        } else {
            NodeStream::Tcp(tcp_stream)
        };

        Ok(Box::new(RedisConnection {
            stream: Some(stream),
            buf: BytesMut::with_capacity(4096),
            endpoint: endpoint.clone(),
        }))
    }
}

/// Role reported by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerRole {
    Master,
    Slave,
    Sentinel,
    Unknown,
}

impl ServerRole {
    pub fn from_name(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "master" => ServerRole::Master,
            "slave" | "replica" => ServerRole::Slave,
            "sentinel" => ServerRole::Sentinel,
            _ => ServerRole::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ServerRole::Master => "master",
            ServerRole::Slave => "slave",
            ServerRole::Sentinel => "sentinel",
            ServerRole::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ServerRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Command-level wrapper around a [`NodeConnection`]
pub struct RedisClient {
    conn: Box<dyn NodeConnection>,
}

impl RedisClient {
    /// Connect and run the AUTH / SELECT handshake the endpoint asks for
    pub async fn connect(connector: &dyn Connector, endpoint: &Endpoint) -> Result<Self> {
        let conn = with_timeout(
            endpoint.connect_timeout(),
            "connecting",
            connector.connect(endpoint),
        )
        .await?;
        let mut client = Self { conn };

        if let Some(password) = endpoint.password() {
            let mut parts: Vec<&[u8]> = Vec::with_capacity(3);
            parts.push(b"AUTH");
            if let Some(user) = endpoint.username() {
                parts.push(user.as_bytes());
            }
            parts.push(password.as_bytes());
            client.call(&parts).await?;
        }
        if endpoint.db() != 0 {
            let db = itoa::Buffer::new().format(endpoint.db()).to_string();
            client.call(&[b"SELECT", db.as_bytes()]).await?;
        }
        Ok(client)
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.conn.endpoint()
    }

    /// Hand the raw connection over (used for subscriptions)
    pub fn into_connection(self) -> Box<dyn NodeConnection> {
        self.conn
    }

    /// Send one command and await its reply; `-ERR` replies become `Error::Server`
    pub async fn call(&mut self, parts: &[&[u8]]) -> Result<RespValue> {
        let endpoint = self.conn.endpoint().clone();
        with_timeout(endpoint.send_timeout(), "sending command", self.conn.send(parts)).await?;
        let reply = with_timeout(
            endpoint.receive_timeout(),
            "reading reply",
            self.conn.receive(),
        )
        .await?;

        match reply {
            RespValue::Error(e) => Err(Error::Server(String::from_utf8_lossy(&e).into_owned())),
            other => Ok(other),
        }
    }

    /// `call` for string arguments
    pub async fn command(&mut self, parts: &[&str]) -> Result<RespValue> {
        let parts: Vec<&[u8]> = parts.iter().map(|p| p.as_bytes()).collect();
        self.call(&parts).await
    }

    pub async fn ping(&mut self) -> Result<()> {
        match self.command(&["PING"]).await {
            Ok(_) => Ok(()),
            // busy but alive
            Err(Error::Server(msg)) if msg.starts_with("LOADING") || msg.starts_with("MASTERDOWN") => {
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Current role via `ROLE`, falling back to `INFO replication`
    pub async fn role(&mut self) -> Result<ServerRole> {
        match self.command(&["ROLE"]).await {
            Ok(reply) => {
                let name = reply
                    .as_array()
                    .and_then(|items| items.first())
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| Error::UnexpectedReply {
                        command: "ROLE".into(),
                        reply: reply.describe(),
                    })?;
                Ok(ServerRole::from_name(&name))
            }
            Err(Error::Server(msg)) => {
                log::debug!(
                    "ROLE rejected by {} ({}), falling back to INFO",
                    self.endpoint(),
                    msg
                );
                let info = self.info("replication").await?;
                Ok(parse_info_field(&info, "role")
                    .map(ServerRole::from_name)
                    .unwrap_or(ServerRole::Unknown))
            }
            Err(e) => Err(e),
        }
    }

    pub async fn info(&mut self, section: &str) -> Result<String> {
        let reply = self.command(&["INFO", section]).await?;
        reply.as_str().ok_or_else(|| Error::UnexpectedReply {
            command: "INFO".into(),
            reply: reply.describe(),
        })
    }

    /// Server wall clock in milliseconds
    pub async fn time_ms(&mut self) -> Result<u64> {
        let reply = self.command(&["TIME"]).await?;
        let parsed = reply.as_array().and_then(|items| {
            let secs = items.first()?.as_int()?;
            let micros = items.get(1)?.as_int()?;
            Some((secs.max(0) as u64) * 1000 + (micros.max(0) as u64) / 1000)
        });
        parsed.ok_or_else(|| Error::UnexpectedReply {
            command: "TIME".into(),
            reply: reply.describe(),
        })
    }

    /// Returns the number of receivers
    pub async fn publish(&mut self, channel: &str, message: &[u8]) -> Result<i64> {
        let reply = self
            .call(&[b"PUBLISH", channel.as_bytes(), message])
            .await?;
        Ok(reply.as_int().unwrap_or(0))
    }

    pub async fn close(mut self) {
        self.conn.close().await;
    }
}

impl fmt::Debug for RedisClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisClient")
            .field("endpoint", &self.endpoint().host_string())
            .finish()
    }
}

/// Run `fut` under an optional deadline
async fn with_timeout<T, F>(limit: Option<Duration>, what: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match limit {
        Some(limit) => timeout(limit, fut).await.map_err(|_| Error::Timeout(what))?,
        None => fut.await,
    }
}

/// Parse a field from INFO output
pub(crate) fn parse_info_field<'a>(info: &'a str, field: &str) -> Option<&'a str> {
    info.lines().find_map(|line| {
        line.strip_prefix(field)
            .and_then(|value| value.strip_prefix(':'))
            .map(str::trim)
    })
}
