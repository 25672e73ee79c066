//! Process-wide async event bus.
//!
//! `EventNotifier` is a bounded drop-oldest queue paired with an eventfd.
//! Producers push and bump the counter; consumers wait on the eventfd (or
//! poll `event_fd()` from their own loop) and drain everything in one pass.
//! `AsyncEventManager` sorts drained events into per-connection queues.

use crate::config::types::{ConnectionId, EventConfig, Result, SupervisorError, GLOBAL_CONNECTION};
use crate::kernel::eventfd::WakeFd;
use crate::observability::metrics::SupervisorMetrics;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u32)]
pub enum AsyncEventType {
    ProcessReady = 1,
    ProcessOutput = 2,
    ProcessError = 4,
    ProcessExited = 8,
    FileChanged = 16,
    CustomSignal = 32,
}

impl AsyncEventType {
    pub fn bits(&self) -> u32 {
        *self as u32
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AsyncEventType::ProcessReady => "process_ready",
            AsyncEventType::ProcessOutput => "process_output",
            AsyncEventType::ProcessError => "process_error",
            AsyncEventType::ProcessExited => "process_exited",
            AsyncEventType::FileChanged => "file_changed",
            AsyncEventType::CustomSignal => "custom_signal",
        }
    }
}

impl std::fmt::Display for AsyncEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AsyncEventType {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "process_ready" => Ok(AsyncEventType::ProcessReady),
            "process_output" => Ok(AsyncEventType::ProcessOutput),
            "process_error" => Ok(AsyncEventType::ProcessError),
            "process_exited" => Ok(AsyncEventType::ProcessExited),
            "file_changed" => Ok(AsyncEventType::FileChanged),
            "custom_signal" => Ok(AsyncEventType::CustomSignal),
            other => Err(SupervisorError::Event(format!("unknown event type: {}", other))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AsyncEvent {
    /// Owning connection, or `GLOBAL_CONNECTION`
    pub connection_id: ConnectionId,
    pub event_type: AsyncEventType,
    pub value: u64,
    pub data: Option<String>,
    pub timestamp: SystemTime,
}

impl AsyncEvent {
    pub fn new(connection_id: ConnectionId, event_type: AsyncEventType, value: u64) -> Self {
        Self {
            connection_id,
            event_type,
            value,
            data: None,
            timestamp: SystemTime::now(),
        }
    }

    pub fn with_data(mut self, data: impl Into<String>) -> Self {
        self.data = Some(data.into());
        self
    }

    pub fn is_global(&self) -> bool {
        self.connection_id == GLOBAL_CONNECTION
    }

    pub fn age(&self) -> Duration {
        SystemTime::now()
            .duration_since(self.timestamp)
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventStats {
    pub total_signaled: u64,
    pub total_processed: u64,
    pub total_dropped: u64,
}

/// Bounded event queue with an eventfd wake-up
#[derive(Debug)]
pub struct EventNotifier {
    wake: WakeFd,
    queue: Mutex<VecDeque<AsyncEvent>>,
    registered: Mutex<HashSet<ConnectionId>>,
    max_pending: usize,
    signaled: AtomicU64,
    processed: AtomicU64,
    dropped: AtomicU64,
    metrics: Option<Arc<SupervisorMetrics>>,
}

impl EventNotifier {
    pub fn new(config: &EventConfig) -> Result<Self> {
        Ok(Self {
            wake: WakeFd::new()?,
            queue: Mutex::new(VecDeque::new()),
            registered: Mutex::new(HashSet::new()),
            max_pending: config.max_pending_events.max(1),
            signaled: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<SupervisorMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn register_connection(&self, conn: ConnectionId) {
        let inserted = self
            .registered
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(conn);
        if inserted {
            debug!("Registered connection {} for async events", conn);
        }
    }

    /// Stop delivering to `conn` and drop its queued events
    pub fn unregister_connection(&self, conn: ConnectionId) {
        self.registered
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&conn);
        let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        let before = queue.len();
        queue.retain(|e| e.connection_id != conn);
        if before != queue.len() {
            debug!(
                "Dropped {} pending events of unregistered connection {}",
                before - queue.len(),
                conn
            );
        }
    }

    pub fn is_registered(&self, conn: ConnectionId) -> bool {
        self.registered
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(&conn)
    }

    pub fn registered_connections(&self) -> Vec<ConnectionId> {
        let mut conns: Vec<_> = self
            .registered
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .copied()
            .collect();
        conns.sort_unstable();
        conns
    }

    /// Global event
    pub fn signal(&self, event_type: AsyncEventType, value: u64) -> Result<()> {
        self.push(AsyncEvent::new(GLOBAL_CONNECTION, event_type, value))
    }

    /// Event for a registered connection; unknown connections are refused
    pub fn signal_for_connection(
        &self,
        conn: ConnectionId,
        event_type: AsyncEventType,
        value: u64,
    ) -> Result<()> {
        self.signal_event(AsyncEvent::new(conn, event_type, value))
    }

    pub fn signal_with_data(
        &self,
        conn: ConnectionId,
        event_type: AsyncEventType,
        value: u64,
        data: impl Into<String>,
    ) -> Result<()> {
        self.signal_event(AsyncEvent::new(conn, event_type, value).with_data(data))
    }

    pub fn signal_custom(
        &self,
        conn: ConnectionId,
        value: u64,
        data: Option<String>,
    ) -> Result<()> {
        let mut event = AsyncEvent::new(conn, AsyncEventType::CustomSignal, value);
        event.data = data;
        self.signal_event(event)
    }

    /// Enqueue a prepared event, checking registration for connection-scoped ones
    pub fn signal_event(&self, event: AsyncEvent) -> Result<()> {
        if !event.is_global() && !self.is_registered(event.connection_id) {
            return Err(SupervisorError::Event(format!(
                "connection {} is not registered",
                event.connection_id
            )));
        }
        self.push(event)
    }

    fn push(&self, event: AsyncEvent) -> Result<()> {
        {
            let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
            while queue.len() >= self.max_pending {
                if let Some(old) = queue.pop_front() {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    if let Some(ref m) = self.metrics {
                        m.events_dropped.inc();
                    }
                    warn!(
                        "Event queue full, dropped {} for connection {}",
                        old.event_type, old.connection_id
                    );
                }
            }
            queue.push_back(event);
        }
        self.signaled.fetch_add(1, Ordering::Relaxed);
        if let Some(ref m) = self.metrics {
            m.events_signaled.inc();
        }
        self.wake.signal(1)
    }

    /// Block up to `timeout_ms` until an event is pending
    pub fn wait_for_event(&self, timeout_ms: i32) -> bool {
        if self.has_pending() {
            return true;
        }
        match self.wake.wait(timeout_ms) {
            Ok(ready) => ready || self.has_pending(),
            Err(e) => {
                warn!("Event wait failed: {}", e);
                false
            }
        }
    }

    /// Take every queued event, oldest first, and reset the wake counter
    pub fn drain_pending(&self) -> Vec<AsyncEvent> {
        // Reset the counter first so an event pushed mid-drain still leaves a wake-up
        if let Err(e) = self.wake.drain() {
            warn!("Failed to reset event counter: {}", e);
        }
        let drained: Vec<AsyncEvent> = self
            .queue
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .drain(..)
            .collect();
        self.processed
            .fetch_add(drained.len() as u64, Ordering::Relaxed);
        drained
    }

    pub fn has_pending(&self) -> bool {
        self.pending_count() > 0
    }

    pub fn pending_count(&self) -> usize {
        self.queue.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    /// Raw eventfd for integration into an external poll loop
    pub fn event_fd(&self) -> RawFd {
        self.wake.raw_fd()
    }

    pub fn stats(&self) -> EventStats {
        EventStats {
            total_signaled: self.signaled.load(Ordering::Relaxed),
            total_processed: self.processed.load(Ordering::Relaxed),
            total_dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Per-connection view over the bus
#[derive(Debug)]
pub struct AsyncEventManager {
    notifier: Arc<EventNotifier>,
    queues: Mutex<HashMap<ConnectionId, VecDeque<AsyncEvent>>>,
    max_connection_events: usize,
    idle_timeout_ms: u64,
}

impl AsyncEventManager {
    pub fn new(notifier: Arc<EventNotifier>, config: &EventConfig) -> Self {
        Self {
            notifier,
            queues: Mutex::new(HashMap::new()),
            max_connection_events: config.max_connection_events.max(1),
            idle_timeout_ms: config.idle_timeout_ms,
        }
    }

    pub fn notifier(&self) -> &Arc<EventNotifier> {
        &self.notifier
    }

    pub fn register_connection(&self, conn: ConnectionId) {
        self.notifier.register_connection(conn);
        self.queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .entry(conn)
            .or_default();
    }

    pub fn unregister_connection(&self, conn: ConnectionId) {
        self.notifier.unregister_connection(conn);
        self.queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&conn);
    }

    /// Move everything off the bus into per-connection queues.
    /// Global events land under `GLOBAL_CONNECTION`. Returns the number moved.
    pub fn process_async_events(&self) -> usize {
        let events = self.notifier.drain_pending();
        let count = events.len();
        if count == 0 {
            return 0;
        }
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        for event in events {
            let queue = queues.entry(event.connection_id).or_default();
            if queue.len() >= self.max_connection_events {
                queue.pop_front();
                debug!(
                    "Connection {} event queue full, dropped oldest",
                    event.connection_id
                );
            }
            queue.push_back(event);
        }
        count
    }

    /// Drain one connection's queue
    pub fn get_connection_events(&self, conn: ConnectionId) -> Vec<AsyncEvent> {
        self.queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get_mut(&conn)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    pub fn has_events(&self, conn: ConnectionId) -> bool {
        self.queues
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&conn)
            .map_or(false, |q| !q.is_empty())
    }

    /// Drop queued events older than `max_age`; returns how many were removed
    pub fn cleanup_old_events(&self, max_age: Duration) -> usize {
        let mut removed = 0;
        let mut queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        for queue in queues.values_mut() {
            let before = queue.len();
            queue.retain(|e| e.age() <= max_age);
            removed += before - queue.len();
        }
        if removed > 0 {
            debug!("Discarded {} stale async events", removed);
        }
        removed
    }

    /// 0 when something is queued, otherwise the idle poll timeout
    pub fn optimal_timeout_ms(&self) -> u64 {
        if self.notifier.has_pending() {
            return 0;
        }
        let queues = self.queues.lock().unwrap_or_else(|p| p.into_inner());
        if queues.values().any(|q| !q.is_empty()) {
            0
        } else {
            self.idle_timeout_ms
        }
    }
}
