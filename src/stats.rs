//! Failover statistics
//!
//! Components never touch process-wide counters directly; they are handed a
//! [`StatsSink`] and call `increment` at each interesting point.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

const COUNTER_COUNT: usize = 11;

/// Counters tracked by the HA layer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Counter {
    Failovers,
    FailedSentinelWorkers,
    ForcedMasterFailovers,
    InvalidMasters,
    NoMastersFound,
    ClientsCreated,
    SubjectiveServersDown,
    ObjectiveServersDown,
    RetryCount,
    RetrySuccess,
    RetryTimedOut,
}

impl Counter {
    pub const ALL: [Counter; COUNTER_COUNT] = [
        Counter::Failovers,
        Counter::FailedSentinelWorkers,
        Counter::ForcedMasterFailovers,
        Counter::InvalidMasters,
        Counter::NoMastersFound,
        Counter::ClientsCreated,
        Counter::SubjectiveServersDown,
        Counter::ObjectiveServersDown,
        Counter::RetryCount,
        Counter::RetrySuccess,
        Counter::RetryTimedOut,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Counter::Failovers => "total_failovers",
            Counter::FailedSentinelWorkers => "total_failed_sentinel_workers",
            Counter::ForcedMasterFailovers => "total_forced_master_failovers",
            Counter::InvalidMasters => "total_invalid_masters",
            Counter::NoMastersFound => "total_no_masters_found",
            Counter::ClientsCreated => "total_clients_created",
            Counter::SubjectiveServersDown => "total_subjective_servers_down",
            Counter::ObjectiveServersDown => "total_objective_servers_down",
            Counter::RetryCount => "total_retry_count",
            Counter::RetrySuccess => "total_retry_success",
            Counter::RetryTimedOut => "total_retry_timed_out",
        }
    }

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

/// Observability sink injected into every component
pub trait StatsSink: Send + Sync {
    fn increment(&self, counter: Counter);
}

/// Sink that drops everything
#[derive(Debug, Default)]
pub struct NullStats;

impl StatsSink for NullStats {
    fn increment(&self, _counter: Counter) {}
}

/// Lock-free in-memory counters
#[derive(Debug, Default)]
pub struct AtomicStats {
    counters: [AtomicU64; COUNTER_COUNT],
}

impl AtomicStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Point-in-time copy of all counters, keyed by name
    pub fn snapshot(&self) -> BTreeMap<&'static str, u64> {
        Counter::ALL
            .iter()
            .map(|c| (c.name(), self.get(*c)))
            .collect()
    }

    pub fn reset(&self) {
        for counter in &self.counters {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl StatsSink for AtomicStats {
    #[inline]
    fn increment(&self, counter: Counter) {
        self.counters[counter.index()].fetch_add(1, Ordering::Relaxed);
    }
}
