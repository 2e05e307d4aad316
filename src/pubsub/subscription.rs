//! Subscription protocol
//!
//! Sends SUBSCRIBE / PSUBSCRIBE / UNSUBSCRIBE / PUNSUBSCRIBE on a dedicated
//! connection and decodes the frames that come back:
//!
//! ```text
//! [subscribe|psubscribe|unsubscribe|punsubscribe, <channel>, <count>]
//! [message, <channel>, <payload>]
//! [pmessage, <pattern>, <channel>, <payload>]
//! ```

use std::collections::BTreeSet;

use bytes::Bytes;

use super::{BytesMessageCallback, MessageCallback, NameCallback, guarded};
use crate::client::NodeConnection;
use crate::error::{Error, Result};
use crate::protocol::RespValue;

/// Typed subscription frame
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    Subscribed {
        channel: String,
        pattern: bool,
        count: i64,
    },
    Unsubscribed {
        channel: Option<String>,
        pattern: bool,
        count: i64,
    },
    Message {
        channel: String,
        payload: Bytes,
        /// Matching pattern for `pmessage`
        pattern: Option<String>,
    },
}

#[derive(Clone, Default)]
pub struct SubscriptionCallbacks {
    pub on_subscribe: Option<NameCallback>,
    pub on_unsubscribe: Option<NameCallback>,
    pub on_message: Option<MessageCallback>,
    pub on_message_bytes: Option<BytesMessageCallback>,
}

pub struct Subscription {
    conn: Box<dyn NodeConnection>,
    subscription_count: i64,
    active_channels: BTreeSet<String>,
    active_patterns: BTreeSet<String>,
    callbacks: SubscriptionCallbacks,
}

impl Subscription {
    pub fn new(conn: Box<dyn NodeConnection>) -> Self {
        Self {
            conn,
            subscription_count: 0,
            active_channels: BTreeSet::new(),
            active_patterns: BTreeSet::new(),
            callbacks: SubscriptionCallbacks::default(),
        }
    }

    pub fn with_callbacks(mut self, callbacks: SubscriptionCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Server-reported number of active channels plus patterns
    pub fn subscription_count(&self) -> i64 {
        self.subscription_count
    }

    pub fn active_channels(&self) -> &BTreeSet<String> {
        &self.active_channels
    }

    pub fn active_patterns(&self) -> &BTreeSet<String> {
        &self.active_patterns
    }

    pub async fn subscribe_to_channels<S: AsRef<str>>(&mut self, channels: &[S]) -> Result<()> {
        self.send_with_targets(b"SUBSCRIBE", channels, true).await
    }

    pub async fn subscribe_to_channels_matching_patterns<S: AsRef<str>>(
        &mut self,
        patterns: &[S],
    ) -> Result<()> {
        self.send_with_targets(b"PSUBSCRIBE", patterns, true).await
    }

    pub async fn unsubscribe_from_all_channels(&mut self) -> Result<()> {
        self.conn.send(&[b"UNSUBSCRIBE"]).await
    }

    pub async fn unsubscribe_from_all_channels_matching_any_patterns(&mut self) -> Result<()> {
        self.conn.send(&[b"PUNSUBSCRIBE"]).await
    }

    pub async fn unsubscribe_from_channels<S: AsRef<str>>(&mut self, channels: &[S]) -> Result<()> {
        self.send_with_targets(b"UNSUBSCRIBE", channels, false).await
    }

    pub async fn unsubscribe_from_channels_matching_any_patterns<S: AsRef<str>>(
        &mut self,
        patterns: &[S],
    ) -> Result<()> {
        self.send_with_targets(b"PUNSUBSCRIBE", patterns, false).await
    }

    /// Unsubscribe from every channel and pattern this connection holds
    pub async fn unsubscribe_all(&mut self) -> Result<()> {
        if !self.active_patterns.is_empty() {
            self.unsubscribe_from_all_channels_matching_any_patterns()
                .await?;
        }
        if !self.active_channels.is_empty() || self.active_patterns.is_empty() {
            self.unsubscribe_from_all_channels().await?;
        }
        Ok(())
    }

    async fn send_with_targets<S: AsRef<str>>(
        &mut self,
        command: &'static [u8],
        targets: &[S],
        required: bool,
    ) -> Result<()> {
        if required && targets.is_empty() {
            return Err(Error::Config(format!(
                "{} needs at least one target",
                String::from_utf8_lossy(command)
            )));
        }
        let mut parts: Vec<&[u8]> = Vec::with_capacity(targets.len() + 1);
        parts.push(command);
        parts.extend(targets.iter().map(|t| t.as_ref().as_bytes()));
        self.conn.send(&parts).await
    }

    /// Await and decode the next frame, firing the matching callbacks
    pub async fn next_event(&mut self) -> Result<SubscriptionEvent> {
        let frame = self.conn.receive().await?;
        let event = self.decode(frame)?;
        self.apply(&event);
        Ok(event)
    }

    /// Receive until the subscription count drops to zero
    pub async fn run(&mut self) -> Result<()> {
        loop {
            self.next_event().await?;
            if self.subscription_count <= 0 {
                return Ok(());
            }
        }
    }

    /// Unsubscribe from everything and drain until nothing is left
    pub async fn dispose(mut self) -> Result<()> {
        if self.subscription_count > 0 {
            self.unsubscribe_all().await?;
            self.run().await?;
        }
        self.conn.close().await;
        Ok(())
    }

    /// Drop the connection without unsubscribing
    pub async fn close(mut self) {
        self.conn.close().await;
    }

    fn decode(&self, frame: RespValue) -> Result<SubscriptionEvent> {
        let items = match frame {
            RespValue::Array(items) => items,
            other => {
                return Err(Error::Protocol(format!(
                    "expected subscription frame, got {}",
                    other.describe()
                )));
            }
        };

        let kind = items
            .first()
            .and_then(|v| v.as_str())
            .map(|s| s.to_ascii_lowercase())
            .ok_or_else(|| Error::Protocol("subscription frame without type".into()))?;

        let expected = if kind == "pmessage" { 4 } else { 3 };
        if items.len() != expected {
            return Err(Error::Protocol(format!(
                "'{}' frame has {} fields, expected {}",
                kind,
                items.len(),
                expected
            )));
        }

        let text = |idx: usize| -> Result<String> {
            items[idx]
                .as_str()
                .ok_or_else(|| Error::Protocol(format!("'{}' field {} is not a string", kind, idx)))
        };
        let count = |idx: usize| -> Result<i64> {
            items[idx]
                .as_int()
                .ok_or_else(|| Error::Protocol(format!("'{}' count is not an integer", kind)))
        };

        match kind.as_str() {
            "subscribe" | "psubscribe" => Ok(SubscriptionEvent::Subscribed {
                channel: text(1)?,
                pattern: kind == "psubscribe",
                count: count(2)?,
            }),
            "unsubscribe" | "punsubscribe" => Ok(SubscriptionEvent::Unsubscribed {
                channel: if items[1].is_null() { None } else { Some(text(1)?) },
                pattern: kind == "punsubscribe",
                count: count(2)?,
            }),
            "message" => Ok(SubscriptionEvent::Message {
                channel: text(1)?,
                payload: payload(&items[2])?,
                pattern: None,
            }),
            "pmessage" => Ok(SubscriptionEvent::Message {
                channel: text(2)?,
                payload: payload(&items[3])?,
                pattern: Some(text(1)?),
            }),
            other => Err(Error::Protocol(format!(
                "invalid subscription reply type '{}'",
                other
            ))),
        }
    }

    fn apply(&mut self, event: &SubscriptionEvent) {
        match event {
            SubscriptionEvent::Subscribed {
                channel,
                pattern,
                count,
            } => {
                self.subscription_count = *count;
                if *pattern {
                    self.active_patterns.insert(channel.clone());
                } else {
                    self.active_channels.insert(channel.clone());
                }
                if let Some(cb) = &self.callbacks.on_subscribe {
                    guarded("on_subscribe", || cb(channel.as_str()));
                }
            }
            SubscriptionEvent::Unsubscribed {
                channel,
                pattern,
                count,
            } => {
                self.subscription_count = *count;
                if let Some(channel) = channel {
                    if *pattern {
                        self.active_patterns.remove(channel);
                    } else {
                        self.active_channels.remove(channel);
                    }
                    if let Some(cb) = &self.callbacks.on_unsubscribe {
                        guarded("on_unsubscribe", || cb(channel.as_str()));
                    }
                }
            }
            SubscriptionEvent::Message {
                channel, payload, ..
            } => {
                if let Some(cb) = &self.callbacks.on_message_bytes {
                    guarded("on_message_bytes", || cb(channel.as_str(), &payload[..]));
                }
                if let Some(cb) = &self.callbacks.on_message {
                    let text = String::from_utf8_lossy(payload);
                    guarded("on_message", || cb(channel.as_str(), &text));
                }
            }
        }
    }
}

fn payload(value: &RespValue) -> Result<Bytes> {
    match value {
        RespValue::BulkString(b) | RespValue::SimpleString(b) => Ok(b.clone()),
        RespValue::Null => Ok(Bytes::new()),
        other => Err(Error::Protocol(format!(
            "message payload is {}",
            other.describe()
        ))),
    }
}
