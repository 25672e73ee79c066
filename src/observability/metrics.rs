// Supervisor counters and gauges
//
// Atomic, lock-free counters shared by every subsystem of one Supervisor.
// A serialisable snapshot feeds the status dump.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Counter metric (monotonically increasing)
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add(&self, delta: u64) {
        self.value.fetch_add(delta, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Gauge metric (can go up or down)
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Saturates at zero
    pub fn dec(&self) {
        let _ = self
            .value
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1)));
    }

    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// All counters of one supervisor instance
#[derive(Debug, Default)]
pub struct SupervisorMetrics {
    pub processes_spawned: Counter,
    pub spawn_failures: Counter,
    pub processes_timed_out: Counter,
    pub processes_running: Gauge,
    pub commands_executed: Counter,
    pub commands_failed: Counter,
    pub commands_cancelled: Counter,
    pub commands_rejected: Counter,
    pub limit_violations: Counter,
    pub events_signaled: Counter,
    pub events_dropped: Counter,
    pub file_events: Counter,
}

/// Point-in-time copy of `SupervisorMetrics`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub processes_spawned: u64,
    pub spawn_failures: u64,
    pub processes_timed_out: u64,
    pub processes_running: u64,
    pub commands_executed: u64,
    pub commands_failed: u64,
    pub commands_cancelled: u64,
    pub commands_rejected: u64,
    pub limit_violations: u64,
    pub events_signaled: u64,
    pub events_dropped: u64,
    pub file_events: u64,
}

impl SupervisorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            processes_spawned: self.processes_spawned.get(),
            spawn_failures: self.spawn_failures.get(),
            processes_timed_out: self.processes_timed_out.get(),
            processes_running: self.processes_running.get(),
            commands_executed: self.commands_executed.get(),
            commands_failed: self.commands_failed.get(),
            commands_cancelled: self.commands_cancelled.get(),
            commands_rejected: self.commands_rejected.get(),
            limit_violations: self.limit_violations.get(),
            events_signaled: self.events_signaled.get(),
            events_dropped: self.events_dropped.get(),
            file_events: self.file_events.get(),
        }
    }
}
