//! Process-local counters.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter metric
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Increment the counter by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a value
    pub fn inc_by(&self, v: u64) {
        self.value.fetch_add(v, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Counters for the whole hub, shared as `Arc<HubMetrics>`.
#[derive(Debug, Default)]
pub struct HubMetrics {
    pub adapter_initializations: Counter,
    pub adapter_init_failures: Counter,
    pub retries: Counter,
    pub circuit_transitions: Counter,
    pub rate_limited: Counter,
    pub safety_denials: Counter,
    pub events_dispatched: Counter,
    pub context_records: Counter,
    pub context_record_failures: Counter,
    pub context_degraded_writes: Counter,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub adapter_initializations: u64,
    pub adapter_init_failures: u64,
    pub retries: u64,
    pub circuit_transitions: u64,
    pub rate_limited: u64,
    pub safety_denials: u64,
    pub events_dispatched: u64,
    pub context_records: u64,
    pub context_record_failures: u64,
    pub context_degraded_writes: u64,
}

impl HubMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            adapter_initializations: self.adapter_initializations.get(),
            adapter_init_failures: self.adapter_init_failures.get(),
            retries: self.retries.get(),
            circuit_transitions: self.circuit_transitions.get(),
            rate_limited: self.rate_limited.get(),
            safety_denials: self.safety_denials.get(),
            events_dispatched: self.events_dispatched.get(),
            context_records: self.context_records.get(),
            context_record_failures: self.context_record_failures.get(),
            context_degraded_writes: self.context_degraded_writes.get(),
        }
    }
}
