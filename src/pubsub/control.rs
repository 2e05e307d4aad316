//! Control sub-protocol carried on the subscribed channels
//!
//! `CTRL` wakes every listener on the channel; each instance then performs its
//! own pending [`Operation`] (instances with nothing pending ignore it).
//! `CTRL:PULSE` is the heartbeat.

use std::sync::atomic::{AtomicU8, Ordering};

pub const CONTROL_PREFIX: &[u8; 4] = b"CTRL";

/// Pending operation codes
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Operation {
    #[default]
    NoOp = 0,
    Stop = 1,
    Reset = 2,
    Restart = 3,
}

impl Operation {
    pub const ALL: [Operation; 3] = [Operation::Stop, Operation::Reset, Operation::Restart];

    #[inline]
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Operation::NoOp),
            1 => Some(Operation::Stop),
            2 => Some(Operation::Reset),
            3 => Some(Operation::Restart),
            _ => None,
        }
    }

    /// Wire name; `NoOp` has none
    pub fn name(self) -> Option<&'static str> {
        match self {
            Operation::NoOp => None,
            Operation::Stop => Some("STOP"),
            Operation::Reset => Some("RESET"),
            Operation::Restart => Some("RESTART"),
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Operation::ALL
            .into_iter()
            .find(|op| op.name().is_some_and(|n| n.eq_ignore_ascii_case(name)))
    }
}

/// Name for a raw operation code; unknown codes have none
pub fn operation_name(code: u8) -> Option<&'static str> {
    Operation::from_code(code).and_then(Operation::name)
}

/// Lock-free slot holding the operation this instance will perform on the next `CTRL`
#[derive(Debug, Default)]
pub struct PendingOperation(AtomicU8);

impl PendingOperation {
    pub fn set(&self, op: Operation) {
        self.0.store(op.code(), Ordering::SeqCst);
    }

    /// Take the pending operation, leaving `NoOp`
    pub fn take(&self) -> Operation {
        Operation::from_code(self.0.swap(Operation::NoOp.code(), Ordering::SeqCst))
            .unwrap_or_default()
    }

    pub fn peek(&self) -> Operation {
        Operation::from_code(self.0.load(Ordering::SeqCst)).unwrap_or_default()
    }
}

/// Control messages this service sends
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlMessage {
    /// Perform the pending operation
    Wake,
    Pulse,
}

impl ControlMessage {
    pub fn encode(self) -> &'static [u8] {
        match self {
            ControlMessage::Wake => b"CTRL",
            ControlMessage::Pulse => b"CTRL:PULSE",
        }
    }
}

/// Decoded control frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame<'a> {
    Wake,
    Pulse,
    /// `CTRL:<subtype>` with a subtype this version does not know
    Unknown(&'a [u8]),
}

/// Returns `None` for ordinary messages
pub fn decode_control(payload: &[u8]) -> Option<ControlFrame<'_>> {
    if payload.len() < CONTROL_PREFIX.len() || &payload[..4] != CONTROL_PREFIX {
        return None;
    }
    match &payload[4..] {
        [] => Some(ControlFrame::Wake),
        [b':', subtype @ ..] if subtype.eq_ignore_ascii_case(b"PULSE") => Some(ControlFrame::Pulse),
        [b':', subtype @ ..] => Some(ControlFrame::Unknown(subtype)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operation_names_round_trip() {
        for op in Operation::ALL {
            let name = op.name().unwrap();
            assert_eq!(Operation::from_name(name), Some(op));
            assert_eq!(Operation::from_code(op.code()), Some(op));
        }
        assert_eq!(Operation::from_name("stop"), Some(Operation::Stop));
        assert_eq!(Operation::NoOp.name(), None);
        assert_eq!(operation_name(9), None);
        assert_eq!(operation_name(3), Some("RESTART"));
    }

    #[test]
    fn test_decode_control() {
        assert_eq!(decode_control(b"CTRL"), Some(ControlFrame::Wake));
        assert_eq!(decode_control(b"CTRL:PULSE"), Some(ControlFrame::Pulse));
        assert_eq!(
            decode_control(b"CTRL:FLUSH"),
            Some(ControlFrame::Unknown(b"FLUSH"))
        );
        assert_eq!(decode_control(b"CTRLX"), None);
        assert_eq!(decode_control(b"CTR"), None);
        assert_eq!(decode_control(b"hello"), None);

        for msg in [ControlMessage::Wake, ControlMessage::Pulse] {
            assert!(decode_control(msg.encode()).is_some());
        }
    }

    #[test]
    fn test_pending_take_resets() {
        let pending = PendingOperation::default();
        pending.set(Operation::Restart);
        assert_eq!(pending.peek(), Operation::Restart);
        assert_eq!(pending.take(), Operation::Restart);
        assert_eq!(pending.take(), Operation::NoOp);
    }
}
