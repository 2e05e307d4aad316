use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a managed subscription service
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    Stopped = 0,
    Starting = 1,
    Started = 2,
    Stopping = 3,
    Disposed = 4,
}

impl ServiceState {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ServiceState::Starting,
            2 => ServiceState::Started,
            3 => ServiceState::Stopping,
            4 => ServiceState::Disposed,
            _ => ServiceState::Stopped,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ServiceState::Stopped => "Stopped",
            ServiceState::Starting => "Starting",
            ServiceState::Started => "Started",
            ServiceState::Stopping => "Stopping",
            ServiceState::Disposed => "Disposed",
        }
    }
}

impl fmt::Display for ServiceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Legal `(from, to)` pairs
fn is_legal(from: ServiceState, to: ServiceState) -> bool {
    use ServiceState::*;
    matches!(
        (from, to),
        (Stopped, Starting)
            | (Starting, Started)
            | (Starting, Stopping)
            | (Starting, Stopped)
            | (Started, Stopping)
            | (Started, Stopped)
            | (Stopping, Stopped)
            | (Stopped | Starting | Started | Stopping, Disposed)
    )
}

/// Atomic state cell; every change is a compare-and-swap checked against the
/// legal transition table
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(initial: ServiceState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    #[inline]
    pub fn get(&self) -> ServiceState {
        ServiceState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// CAS `from -> to`. On failure returns the state actually observed
    /// (which is `from` itself when the pair is illegal).
    pub fn try_transition(
        &self,
        from: ServiceState,
        to: ServiceState,
    ) -> Result<(), ServiceState> {
        if !is_legal(from, to) {
            return Err(from);
        }
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(ServiceState::from_u8)
    }

    #[inline]
    pub fn transition(&self, from: ServiceState, to: ServiceState) -> bool {
        self.try_transition(from, to).is_ok()
    }

    /// Move to `to` from whatever legal state currently holds.
    /// Returns the prior state, or `None` when no legal move exists.
    pub fn force(&self, to: ServiceState) -> Option<ServiceState> {
        loop {
            let current = self.get();
            if !is_legal(current, to) {
                return None;
            }
            if self.transition(current, to) {
                return Some(current);
            }
        }
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new(ServiceState::Stopped)
    }
}
