//! Node endpoints
//!
//! An [`Endpoint`] identifies one node (store or sentinel) together with the
//! credentials and per-call timeouts used to talk to it. Endpoints are built
//! once from configuration strings and never mutated afterwards.
//!
//! Accepted forms:
//! - `host`, `host:port`, `[::1]:port`
//! - `password@host:port`
//! - `redis://[user[:password]@]host[:port][/db][?key=value&...]`
//! - `rediss://...` (TLS implied)
//!
//! Query keys: `db`, `ssl`, `username`, `password`, `connectTimeout`,
//! `sendTimeout`, `receiveTimeout` (milliseconds, case-insensitive).

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default port for store nodes
pub const DEFAULT_PORT: u16 = 6379;

/// Default port for sentinel nodes
pub const DEFAULT_SENTINEL_PORT: u16 = 26379;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    host: String,
    port: u16,
    username: Option<String>,
    password: Option<String>,
    db: u32,
    ssl: bool,
    connect_timeout: Option<Duration>,
    send_timeout: Option<Duration>,
    receive_timeout: Option<Duration>,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            username: None,
            password: None,
            db: 0,
            ssl: false,
            connect_timeout: None,
            send_timeout: None,
            receive_timeout: None,
        }
    }

    /// Parse an endpoint string, applying `default_port` when none is given
    pub fn parse(input: &str, default_port: u16) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(Error::Config("empty endpoint".into()));
        }

        let (rest, is_url, ssl) = if let Some(rest) = input.strip_prefix("rediss://") {
            (rest, true, true)
        } else if let Some(rest) = input.strip_prefix("redis://") {
            (rest, true, false)
        } else {
            (input, false, false)
        };

        let (rest, query) = match rest.split_once('?') {
            Some((r, q)) => (r, Some(q)),
            None => (rest, None),
        };

        let (authority, path) = if is_url {
            match rest.split_once('/') {
                Some((a, p)) => (a, Some(p)),
                None => (rest, None),
            }
        } else {
            (rest, None)
        };

        let (userinfo, hostport) = match authority.rsplit_once('@') {
            Some((u, h)) => (Some(u), h),
            None => (None, authority),
        };

        let (host, port) = split_host_port(hostport, default_port, input)?;
        let mut endpoint = Endpoint::new(host, port);
        endpoint.ssl = ssl;

        if let Some(userinfo) = userinfo {
            match userinfo.split_once(':') {
                Some((user, pass)) if is_url => {
                    if !user.is_empty() {
                        endpoint.username = Some(user.to_string());
                    }
                    if !pass.is_empty() {
                        endpoint.password = Some(pass.to_string());
                    }
                }
                _ if !userinfo.is_empty() => endpoint.password = Some(userinfo.to_string()),
                _ => {}
            }
        }

        if let Some(path) = path.map(|p| p.trim_matches('/'))
            && !path.is_empty()
        {
            endpoint.db = path
                .parse()
                .map_err(|_| Error::Config(format!("invalid db '{}' in '{}'", path, input)))?;
        }

        if let Some(query) = query {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                endpoint.apply_option(key, value, input)?;
            }
        }

        Ok(endpoint)
    }

    fn apply_option(&mut self, key: &str, value: &str, input: &str) -> Result<()> {
        let invalid = || Error::Config(format!("invalid value '{}' for '{}' in '{}'", value, key, input));

        match key.to_ascii_lowercase().as_str() {
            "db" => self.db = value.parse().map_err(|_| invalid())?,
            "ssl" => self.ssl = parse_flag(value).ok_or_else(invalid)?,
            "password" => self.password = Some(value.to_string()).filter(|v| !v.is_empty()),
            "username" | "user" => self.username = Some(value.to_string()).filter(|v| !v.is_empty()),
            "connecttimeout" => self.connect_timeout = Some(parse_millis(value).ok_or_else(invalid)?),
            "sendtimeout" => self.send_timeout = Some(parse_millis(value).ok_or_else(invalid)?),
            "receivetimeout" => self.receive_timeout = Some(parse_millis(value).ok_or_else(invalid)?),
            other => log::debug!("Ignoring unknown endpoint option '{}' in '{}'", other, input),
        }
        Ok(())
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }

    pub fn db(&self) -> u32 {
        self.db
    }

    pub fn ssl(&self) -> bool {
        self.ssl
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    pub fn send_timeout(&self) -> Option<Duration> {
        self.send_timeout
    }

    pub fn receive_timeout(&self) -> Option<Duration> {
        self.receive_timeout
    }

    /// `host:port` (IPv6 hosts are bracketed)
    pub fn host_string(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// Copy with every per-call timeout set to `timeout`
    pub fn with_timeouts(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self.send_timeout = Some(timeout);
        self.receive_timeout = Some(timeout);
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }
}

impl FromStr for Endpoint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Endpoint::parse(s, DEFAULT_PORT)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.host_string())
    }
}

/// Parse a list of host strings, failing on the first malformed entry
pub fn parse_endpoints<S: AsRef<str>>(hosts: &[S], default_port: u16) -> Result<Vec<Endpoint>> {
    hosts
        .iter()
        .map(|h| Endpoint::parse(h.as_ref(), default_port))
        .collect()
}

fn split_host_port(hostport: &str, default_port: u16, input: &str) -> Result<(String, u16)> {
    let bad = || Error::Config(format!("malformed endpoint '{}'", input));

    if let Some(stripped) = hostport.strip_prefix('[') {
        let (host, after) = stripped.split_once(']').ok_or_else(bad)?;
        let port = match after.strip_prefix(':') {
            Some(p) => parse_port(p).ok_or_else(bad)?,
            None if after.is_empty() => default_port,
            None => return Err(bad()),
        };
        if host.is_empty() {
            return Err(bad());
        }
        return Ok((host.to_string(), port));
    }

    let (host, port) = match hostport.matches(':').count() {
        0 => (hostport, default_port),
        1 => {
            let (h, p) = hostport.split_once(':').ok_or_else(bad)?;
            (h, parse_port(p).ok_or_else(bad)?)
        }
        // bare IPv6 address without brackets
        _ => (hostport, default_port),
    };

    if host.is_empty() || host.contains(char::is_whitespace) {
        return Err(bad());
    }
    Ok((host.to_string(), port))
}

fn parse_port(s: &str) -> Option<u16> {
    s.parse::<u16>().ok().filter(|p| *p != 0)
}

fn parse_millis(s: &str) -> Option<Duration> {
    s.parse::<u64>().ok().map(Duration::from_millis)
}

fn parse_flag(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "true" | "yes" | "1" => Some(true),
        "false" | "no" | "0" => Some(false),
        _ => None,
    }
}
