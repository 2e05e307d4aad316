//! Sentinel event stream
//!
//! Sentinels publish one channel per event type (`+sdown`, `+switch-master`,
//! ...). The payload is a space-separated instance description, e.g.
//!
//! ```text
//! +sdown          master mymaster 10.0.0.1 6379
//! +sdown          slave 10.0.0.2:6379 10.0.0.2 6379 @ mymaster 10.0.0.1 6379
//! +switch-master  mymaster 10.0.0.1 6379 10.0.0.3 6379
//! ```

pub const SWITCH_MASTER: &str = "+switch-master";
pub const FAILOVER_END: &str = "+failover-end";
pub const SDOWN: &str = "+sdown";
pub const SDOWN_CLEARED: &str = "-sdown";
pub const ODOWN: &str = "+odown";
pub const ODOWN_CLEARED: &str = "-odown";

/// Event kinds the HA layer reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SwitchMaster,
    FailoverEnd,
    SubjectivelyDown,
    ObjectivelyDown,
    Other,
}

impl EventKind {
    pub fn from_channel(channel: &str) -> Self {
        match channel {
            SWITCH_MASTER => EventKind::SwitchMaster,
            FAILOVER_END => EventKind::FailoverEnd,
            SDOWN => EventKind::SubjectivelyDown,
            ODOWN => EventKind::ObjectivelyDown,
            _ => EventKind::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentinelEvent {
    pub kind: EventKind,
    pub channel: String,
    pub message: String,
}

impl SentinelEvent {
    pub fn parse(channel: &str, message: &str) -> Self {
        Self {
            kind: EventKind::from_channel(channel),
            channel: channel.to_string(),
            message: message.to_string(),
        }
    }

    /// True when `master_name` appears as a whole word in the payload
    pub fn mentions_master(&self, master_name: &str) -> bool {
        self.message
            .split_ascii_whitespace()
            .any(|word| word == master_name)
    }

    /// New master address announced by `+switch-master`
    pub fn switch_master_target(&self) -> Option<(String, u16)> {
        if self.kind != EventKind::SwitchMaster {
            return None;
        }
        // <name> <old-ip> <old-port> <new-ip> <new-port>
        let fields: Vec<&str> = self.message.split_ascii_whitespace().collect();
        let [_, _, _, ip, port] = fields.as_slice() else {
            return None;
        };
        Some((ip.to_string(), port.parse().ok()?))
    }

    /// Whether this event should reconfigure clients
    pub fn triggers_reset(&self, on_sdown: bool, on_odown: bool) -> bool {
        match self.kind {
            EventKind::SwitchMaster | EventKind::FailoverEnd => true,
            EventKind::SubjectivelyDown => on_sdown,
            EventKind::ObjectivelyDown => on_odown,
            EventKind::Other => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_channel() {
        assert_eq!(EventKind::from_channel("+switch-master"), EventKind::SwitchMaster);
        assert_eq!(EventKind::from_channel("+failover-end"), EventKind::FailoverEnd);
        assert_eq!(EventKind::from_channel("+sdown"), EventKind::SubjectivelyDown);
        assert_eq!(EventKind::from_channel("+odown"), EventKind::ObjectivelyDown);
        assert_eq!(EventKind::from_channel(SDOWN_CLEARED), EventKind::Other);
        assert_eq!(EventKind::from_channel(ODOWN_CLEARED), EventKind::Other);
        assert_eq!(EventKind::from_channel("+tilt"), EventKind::Other);
    }

    #[test]
    fn test_mentions_master_is_word_match() {
        let ev = SentinelEvent::parse("+sdown", "slave 10.0.0.2:6379 10.0.0.2 6379 @ mymaster 10.0.0.1 6379");
        assert!(ev.mentions_master("mymaster"));
        assert!(!ev.mentions_master("my"));

        let other = SentinelEvent::parse("+sdown", "master mymaster2 10.0.0.1 6379");
        assert!(!other.mentions_master("mymaster"));
    }

    #[test]
    fn test_switch_master_target() {
        let ev = SentinelEvent::parse("+switch-master", "mymaster 10.0.0.1 6379 10.0.0.3 6380");
        assert_eq!(ev.switch_master_target(), Some(("10.0.0.3".to_string(), 6380)));

        let short = SentinelEvent::parse("+switch-master", "mymaster 10.0.0.1");
        assert_eq!(short.switch_master_target(), None);

        let sdown = SentinelEvent::parse("+sdown", "mymaster 10.0.0.1 6379 10.0.0.3 6380");
        assert_eq!(sdown.switch_master_target(), None);
    }

    #[test]
    fn test_triggers_reset() {
        let switch = SentinelEvent::parse("+switch-master", "m a 1 b 2");
        assert!(switch.triggers_reset(false, false));

        let sdown = SentinelEvent::parse("+sdown", "master m 10.0.0.1 6379");
        assert!(sdown.triggers_reset(true, false));
        assert!(!sdown.triggers_reset(false, true));

        let odown = SentinelEvent::parse("+odown", "master m 10.0.0.1 6379 #quorum 2/2");
        assert!(odown.triggers_reset(false, true));

        assert!(!SentinelEvent::parse("-sdown", "master m 10.0.0.1 6379").triggers_reset(true, true));
    }
}
