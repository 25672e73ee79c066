//! Per-connection resource policy, sampling and enforcement.
//!
//! Limits and sandbox settings are configured per connection before spawn.
//! `child_plan` hands the pre-exec part (rlimits, chroot, no_new_privs) to
//! the spawn path; `apply` attaches the running pid, adjusts it with
//! prlimit/setpriority and starts a sampling thread. Each sampling tick
//! re-evaluates every limit: soft breaches log, hard breaches run the
//! configured action.

use crate::config::types::{ConnectionId, ResourceManagerConfig, Result, SupervisorError};
use crate::events::notifier::{AsyncEventType, EventNotifier};
use crate::kernel::rlimit::{self, RlimitResource, RlimitSetting};
use crate::kernel::signal::{self, KillReport};
use crate::observability::audit::{AuditLog, SecurityEvent, SecurityEventType};
use crate::observability::metrics::SupervisorMetrics;
use crate::resource::accounting::{AccountingReader, ResourceUsage};
use crate::resource::limits::{
    parse_limit_spec, EnforcementAction, ResourceLimit, ResourceLimitType, SandboxMode,
};
use crate::runtime::security::path_validation;
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime};

/// Resource policy and live state of one connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessResourceConfig {
    pub connection_id: ConnectionId,
    pub pid: Option<i32>,
    pub sandbox_mode: SandboxMode,
    pub limits: BTreeMap<ResourceLimitType, ResourceLimit>,
    pub allowed_paths: Vec<String>,
    pub blocked_paths: Vec<String>,
    pub chroot_path: Option<String>,
    pub monitoring_enabled: bool,
    pub monitor_interval_ms: u64,
    pub current_usage: ResourceUsage,
    pub usage_history: VecDeque<ResourceUsage>,
    /// Set when limits were applied to the live process
    pub applied_at: Option<SystemTime>,
    /// Stopped by a suspend action and not yet resumed
    pub suspended: bool,
    pub violations: u64,
    #[serde(skip)]
    soft_breached: BTreeSet<ResourceLimitType>,
    /// A terminate action is under way; later breaches are not re-enforced
    #[serde(skip)]
    pub terminating: bool,
}

impl ProcessResourceConfig {
    fn new(conn: ConnectionId, monitor_interval_ms: u64) -> Self {
        Self {
            connection_id: conn,
            pid: None,
            sandbox_mode: SandboxMode::None,
            limits: BTreeMap::new(),
            allowed_paths: Vec::new(),
            blocked_paths: Vec::new(),
            chroot_path: None,
            monitoring_enabled: true,
            monitor_interval_ms,
            current_usage: ResourceUsage::default(),
            usage_history: VecDeque::new(),
            applied_at: None,
            suspended: false,
            violations: 0,
            soft_breached: BTreeSet::new(),
            terminating: false,
        }
    }

    fn nice_value(&self) -> Option<i32> {
        self.limits
            .get(&ResourceLimitType::NiceValue)
            .filter(|l| l.enabled)
            .map(|l| l.hard_limit as i32)
    }

    /// Current value of a sampled limit type
    fn measured(&self, limit_type: ResourceLimitType) -> Option<f64> {
        let usage = &self.current_usage;
        match limit_type {
            ResourceLimitType::CpuTime => Some(usage.cpu_time_seconds),
            ResourceLimitType::CpuPercent => Some(usage.cpu_percent),
            ResourceLimitType::MemoryVirtual => Some(usage.memory_virtual_bytes as f64),
            ResourceLimitType::MemoryRss => Some(usage.memory_rss_bytes as f64),
            ResourceLimitType::FileDescriptors => Some(usage.file_descriptors_open as f64),
            ResourceLimitType::WallTime => self.applied_at.map(|t| {
                SystemTime::now()
                    .duration_since(t)
                    .unwrap_or_default()
                    .as_secs_f64()
            }),
            // Kernel-enforced or not measurable
            ResourceLimitType::FileSize | ResourceLimitType::NiceValue => None,
        }
    }
}

/// Pre-exec portion of a connection's policy, consumed by the spawn path
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChildResourcePlan {
    pub rlimits: Vec<RlimitSetting>,
    pub chroot: Option<String>,
    pub no_new_privs: bool,
}

/// Hard-limit breach found on one tick
#[derive(Debug, Clone)]
struct Breach {
    limit: ResourceLimit,
    value: f64,
}

#[derive(Debug)]
struct Shared {
    config: ResourceManagerConfig,
    reader: Arc<dyn AccountingReader>,
    states: Mutex<HashMap<ConnectionId, ProcessResourceConfig>>,
    events: Arc<EventNotifier>,
    audit: Arc<AuditLog>,
    metrics: Arc<SupervisorMetrics>,
}

#[derive(Debug)]
struct MonitorHandle {
    shutdown_tx: Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Debug)]
pub struct ResourceManager {
    shared: Arc<Shared>,
    monitors: Mutex<HashMap<ConnectionId, MonitorHandle>>,
}

impl ResourceManager {
    pub fn new(
        config: ResourceManagerConfig,
        reader: Arc<dyn AccountingReader>,
        events: Arc<EventNotifier>,
        audit: Arc<AuditLog>,
        metrics: Arc<SupervisorMetrics>,
    ) -> Self {
        info!(
            "Resource manager using {} accounting, {}ms default interval",
            reader.backend_name(),
            config.monitor_interval_ms
        );
        Self {
            shared: Arc::new(Shared {
                config,
                reader,
                states: Mutex::new(HashMap::new()),
                events,
                audit,
                metrics,
            }),
            monitors: Mutex::new(HashMap::new()),
        }
    }

    fn with_state<R>(
        &self,
        conn: ConnectionId,
        f: impl FnOnce(&mut ProcessResourceConfig) -> R,
    ) -> R {
        let mut states = self.shared.states.lock().unwrap_or_else(|p| p.into_inner());
        let interval = self.shared.config.monitor_interval_ms;
        let state = states
            .entry(conn)
            .or_insert_with(|| ProcessResourceConfig::new(conn, interval));
        f(state)
    }

    fn read_state<R>(
        &self,
        conn: ConnectionId,
        f: impl FnOnce(&ProcessResourceConfig) -> R,
    ) -> Option<R> {
        let states = self.shared.states.lock().unwrap_or_else(|p| p.into_inner());
        states.get(&conn).map(f)
    }

    pub fn configure_limit(
        &self,
        conn: ConnectionId,
        limit_type: ResourceLimitType,
        soft: f64,
        hard: f64,
        action: EnforcementAction,
    ) -> Result<()> {
        let limit = ResourceLimit::new(limit_type, soft, hard, action)?;
        debug!("Connection {}: {} ({})", conn, limit.description, action);
        self.with_state(conn, |state| {
            state.soft_breached.remove(&limit_type);
            state.limits.insert(limit_type, limit);
        });
        Ok(())
    }

    /// Configure from a `soft:hard:action` string
    pub fn configure_limit_from_spec(
        &self,
        conn: ConnectionId,
        limit_type: ResourceLimitType,
        spec: &str,
    ) -> Result<()> {
        let parsed = parse_limit_spec(spec)?;
        self.configure_limit(conn, limit_type, parsed.soft, parsed.hard, parsed.action)
    }

    pub fn remove_limit(&self, conn: ConnectionId, limit_type: ResourceLimitType) -> bool {
        let mut states = self.shared.states.lock().unwrap_or_else(|p| p.into_inner());
        states
            .get_mut(&conn)
            .map_or(false, |s| s.limits.remove(&limit_type).is_some())
    }

    pub fn get_limits(&self, conn: ConnectionId) -> Vec<ResourceLimit> {
        self.read_state(conn, |s| s.limits.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn configure_sandbox(
        &self,
        conn: ConnectionId,
        mode: SandboxMode,
        allowed_paths: Vec<String>,
        blocked_paths: Vec<String>,
        chroot: Option<String>,
    ) -> Result<()> {
        if mode == SandboxMode::Strict && allowed_paths.is_empty() {
            return Err(SupervisorError::Validation(
                "strict sandbox requires a non-empty allowed path list".to_string(),
            ));
        }
        let chroot = chroot.filter(|c| !c.trim().is_empty());
        if let Some(ref root) = chroot {
            if !root.starts_with('/') || path_validation::has_traversal(root) {
                return Err(SupervisorError::Validation(format!(
                    "chroot path must be absolute without traversal: {}",
                    root
                )));
            }
            if mode < SandboxMode::Isolated {
                warn!(
                    "Connection {}: chroot {} is ignored in {} mode",
                    conn, root, mode
                );
            }
        }
        for path in allowed_paths.iter().chain(blocked_paths.iter()) {
            if path_validation::has_traversal(path) {
                return Err(SupervisorError::Validation(format!(
                    "sandbox path contains traversal: {}",
                    path
                )));
            }
        }

        info!("Connection {}: sandbox mode {}", conn, mode);
        self.with_state(conn, |state| {
            state.sandbox_mode = mode;
            state.allowed_paths = allowed_paths;
            state.blocked_paths = blocked_paths;
            state.chroot_path = chroot;
        });
        Ok(())
    }

    pub fn set_monitoring(&self, conn: ConnectionId, enabled: bool, interval_ms: Option<u64>) {
        self.with_state(conn, |state| {
            state.monitoring_enabled = enabled;
            if let Some(ms) = interval_ms {
                state.monitor_interval_ms = ms.max(1);
            }
        });
    }

    pub fn has_config(&self, conn: ConnectionId) -> bool {
        self.read_state(conn, |_| ()).is_some()
    }

    pub fn config_snapshot(&self, conn: ConnectionId) -> Option<ProcessResourceConfig> {
        self.read_state(conn, |s| s.clone())
    }

    /// Give `to` the limits and sandbox policy of `from`, without any live state
    pub fn copy_config(&self, from: ConnectionId, to: ConnectionId) -> bool {
        let mut states = self.shared.states.lock().unwrap_or_else(|p| p.into_inner());
        let Some(source) = states.get(&from) else {
            return false;
        };
        let mut copy = ProcessResourceConfig::new(to, source.monitor_interval_ms);
        copy.sandbox_mode = source.sandbox_mode;
        copy.limits = source.limits.clone();
        copy.allowed_paths = source.allowed_paths.clone();
        copy.blocked_paths = source.blocked_paths.clone();
        copy.chroot_path = source.chroot_path.clone();
        copy.monitoring_enabled = source.monitoring_enabled;
        states.insert(to, copy);
        true
    }

    /// Sandbox path policy for `conn`
    pub fn check_sandbox_path(&self, conn: ConnectionId, path: &str) -> bool {
        let Some((mode, allowed, blocked)) = self.read_state(conn, |s| {
            (s.sandbox_mode, s.allowed_paths.clone(), s.blocked_paths.clone())
        }) else {
            return true;
        };
        if mode == SandboxMode::None {
            return true;
        }
        if path_validation::has_traversal(path) {
            return false;
        }
        if blocked.iter().any(|b| path_validation::is_under(path, b)) {
            return false;
        }
        if mode == SandboxMode::Strict && allowed.is_empty() {
            return false;
        }
        allowed.is_empty() || allowed.iter().any(|a| path_validation::is_under(path, a))
    }

    /// Rlimits, chroot and no_new_privs to apply between fork and exec
    pub fn child_plan(&self, conn: ConnectionId) -> ChildResourcePlan {
        self.read_state(conn, |state| {
            let mut plan = ChildResourcePlan {
                rlimits: state.limits.values().filter_map(|l| l.to_rlimit()).collect(),
                ..ChildResourcePlan::default()
            };
            if state.sandbox_mode >= SandboxMode::Restricted {
                plan.no_new_privs = true;
            }
            if state.sandbox_mode >= SandboxMode::Isolated {
                plan.chroot = state.chroot_path.clone();
            }
            if state.sandbox_mode == SandboxMode::Strict {
                plan.rlimits.push(RlimitSetting::fixed(RlimitResource::Core, 0));
            }
            plan
        })
        .unwrap_or_default()
    }

    /// Attach `pid` to the connection's policy. Connections without any
    /// configuration are left alone.
    pub fn apply(&self, conn: ConnectionId, pid: i32) -> Result<bool> {
        let (rlimits, nice, monitor) = {
            let mut states = self.shared.states.lock().unwrap_or_else(|p| p.into_inner());
            let Some(state) = states.get_mut(&conn) else {
                return Ok(false);
            };
            state.pid = Some(pid);
            state.applied_at = Some(SystemTime::now());
            state.current_usage = ResourceUsage {
                pid,
                ..ResourceUsage::default()
            };
            state.usage_history.clear();
            state.soft_breached.clear();
            state.suspended = false;
            state.terminating = false;
            let rlimits: Vec<RlimitSetting> =
                state.limits.values().filter_map(|l| l.to_rlimit()).collect();
            (rlimits, state.nice_value(), state.monitoring_enabled)
        };

        for setting in &rlimits {
            if let Err(e) = rlimit::apply_to_process(pid, setting) {
                warn!("Connection {}: prlimit {:?} on pid {} failed: {}", conn, setting.resource, pid, e);
            }
        }
        if let Some(nice) = nice {
            self.set_priority(conn, nice)?;
        }
        if monitor {
            self.start_monitoring(conn)?;
        }
        debug!("Applied resource policy of connection {} to pid {}", conn, pid);
        Ok(true)
    }

    pub fn set_priority(&self, conn: ConnectionId, nice: i32) -> Result<()> {
        let pid = self.pid_of(conn)?;
        rlimit::set_priority(pid, nice)?;
        self.with_state(conn, |state| state.current_usage.nice_value = nice);
        Ok(())
    }

    fn pid_of(&self, conn: ConnectionId) -> Result<i32> {
        self.read_state(conn, |s| s.pid)
            .flatten()
            .ok_or_else(|| SupervisorError::NotFound(format!("no process attached to connection {}", conn)))
    }

    pub fn start_monitoring(&self, conn: ConnectionId) -> Result<()> {
        let pid = self.pid_of(conn)?;
        let mut monitors = self.monitors.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(existing) = monitors.get(&conn) {
            if !existing.handle.is_finished() {
                return Ok(());
            }
        }
        if let Some(stale) = monitors.remove(&conn) {
            let _ = stale.handle.join();
        }

        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let shared = Arc::clone(&self.shared);
        let handle = std::thread::Builder::new()
            .name(format!("resmon-{}", conn))
            .spawn(move || {
                debug!("Monitoring connection {} (pid {})", conn, pid);
                loop {
                    if !shared.tick(conn, pid) {
                        break;
                    }
                    let interval = shared.interval_of(conn);
                    match shutdown_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => continue,
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Stopped monitoring connection {}", conn);
            })
            .map_err(|e| SupervisorError::ResourceLimit(format!("monitor thread: {}", e)))?;

        monitors.insert(conn, MonitorHandle { shutdown_tx, handle });
        Ok(())
    }

    pub fn stop_monitoring(&self, conn: ConnectionId) {
        let monitor = self
            .monitors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&conn);
        if let Some(monitor) = monitor {
            let _ = monitor.shutdown_tx.try_send(());
            // A monitor stopping itself (terminate action) must not join itself
            if monitor.handle.thread().id() != std::thread::current().id() {
                let _ = monitor.handle.join();
            }
        }
    }

    pub fn is_monitoring(&self, conn: ConnectionId) -> bool {
        self.monitors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&conn)
            .map_or(false, |m| !m.handle.is_finished())
    }

    /// Connections with a live sampling thread
    pub fn monitored_connections(&self) -> Vec<ConnectionId> {
        let mut conns: Vec<_> = self
            .monitors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|(_, m)| !m.handle.is_finished())
            .map(|(c, _)| *c)
            .collect();
        conns.sort_unstable();
        conns
    }

    /// Take one sample now and enforce; false when the process is gone
    pub fn update_usage(&self, conn: ConnectionId) -> bool {
        match self.pid_of(conn) {
            Ok(pid) => self.shared.tick(conn, pid),
            Err(_) => false,
        }
    }

    pub fn current_usage(&self, conn: ConnectionId) -> Option<ResourceUsage> {
        self.read_state(conn, |s| s.current_usage.clone())
    }

    /// Up to `max_entries` most recent samples, oldest first
    pub fn usage_history(&self, conn: ConnectionId, max_entries: usize) -> Vec<ResourceUsage> {
        self.read_state(conn, |s| {
            let skip = s.usage_history.len().saturating_sub(max_entries);
            s.usage_history.iter().skip(skip).cloned().collect()
        })
        .unwrap_or_default()
    }

    pub fn suspend(&self, conn: ConnectionId) -> Result<bool> {
        let pid = self.pid_of(conn)?;
        let sent = signal::stop_process(pid)?;
        if sent {
            self.with_state(conn, |s| s.suspended = true);
        }
        Ok(sent)
    }

    /// SIGCONT a throttled or suspended process
    pub fn resume(&self, conn: ConnectionId) -> Result<bool> {
        let pid = self.pid_of(conn)?;
        let sent = signal::continue_process(pid)?;
        self.with_state(conn, |s| s.suspended = false);
        if sent {
            info!("Resumed pid {} of connection {}", pid, conn);
        }
        Ok(sent)
    }

    pub fn terminate_safely(&self, conn: ConnectionId, grace: Duration) -> Result<KillReport> {
        let pid = self.pid_of(conn)?;
        Ok(self.shared.terminate(pid, grace))
    }

    /// Summary figures for status dumps
    pub fn resource_statistics(&self, conn: ConnectionId) -> BTreeMap<String, f64> {
        self.read_state(conn, |s| {
            let u = &s.current_usage;
            let mut stats = BTreeMap::new();
            stats.insert("cpu_time_seconds".to_string(), u.cpu_time_seconds);
            stats.insert("cpu_percent".to_string(), u.cpu_percent);
            stats.insert("memory_virtual_bytes".to_string(), u.memory_virtual_bytes as f64);
            stats.insert("memory_rss_bytes".to_string(), u.memory_rss_bytes as f64);
            stats.insert("memory_peak_bytes".to_string(), u.memory_peak_bytes as f64);
            stats.insert("file_descriptors_open".to_string(), u.file_descriptors_open as f64);
            stats.insert("bytes_read".to_string(), u.bytes_read as f64);
            stats.insert("bytes_written".to_string(), u.bytes_written as f64);
            stats.insert("nice_value".to_string(), f64::from(u.nice_value));
            stats.insert("samples".to_string(), s.usage_history.len() as f64);
            stats.insert("violations".to_string(), s.violations as f64);
            stats.insert("limits".to_string(), s.limits.len() as f64);
            stats
        })
        .unwrap_or_default()
    }

    /// Connections with any configuration
    pub fn configured_connections(&self) -> Vec<ConnectionId> {
        let mut conns: Vec<_> = self
            .shared
            .states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .copied()
            .collect();
        conns.sort_unstable();
        conns
    }

    /// Stop monitoring and forget all state of `conn`
    pub fn cleanup(&self, conn: ConnectionId) {
        self.stop_monitoring(conn);
        let removed = self
            .shared
            .states
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&conn)
            .is_some();
        if removed {
            debug!("Cleaned up resource state of connection {}", conn);
        }
    }

    pub fn shutdown(&self) {
        let conns: Vec<ConnectionId> = self
            .monitors
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .keys()
            .copied()
            .collect();
        for conn in conns {
            self.stop_monitoring(conn);
        }
    }
}

impl Shared {
    fn interval_of(&self, conn: ConnectionId) -> Duration {
        let states = self.states.lock().unwrap_or_else(|p| p.into_inner());
        let ms = states
            .get(&conn)
            .map_or(self.config.monitor_interval_ms, |s| s.monitor_interval_ms);
        Duration::from_millis(ms.max(1))
    }

    /// Sample, record, enforce. Returns false once the process is gone or
    /// the connection was cleaned up.
    fn tick(&self, conn: ConnectionId, pid: i32) -> bool {
        if !signal::is_alive(pid) || self.reader.is_zombie(pid) {
            return false;
        }
        let mut sample = match self.reader.sample(pid) {
            Ok(sample) => sample,
            Err(e) => {
                debug!("Sampling pid {} failed: {}", pid, e);
                return false;
            }
        };

        let (breaches, soft_new) = {
            let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
            let Some(state) = states.get_mut(&conn) else {
                return false;
            };
            if state.pid != Some(pid) {
                return false;
            }

            let previous = &state.current_usage;
            sample.pid = pid;
            sample.start_time = previous.start_time;
            let wall = sample
                .last_update
                .duration_since(previous.last_update)
                .unwrap_or_default()
                .as_secs_f64();
            if sample.cpu_percent == 0.0 && wall > 0.0 && !state.usage_history.is_empty() {
                let cpu = (sample.cpu_time_seconds - previous.cpu_time_seconds).max(0.0);
                sample.cpu_percent = cpu / wall * 100.0;
            }
            if sample.memory_peak_bytes < previous.memory_peak_bytes {
                sample.memory_peak_bytes = previous.memory_peak_bytes;
            }
            state.current_usage = sample;
            state.usage_history.push_back(state.current_usage.clone());
            while state.usage_history.len() > self.config.history_size.max(1) {
                state.usage_history.pop_front();
            }

            let mut breaches = Vec::new();
            let mut soft_new = Vec::new();
            let limits: Vec<ResourceLimit> =
                state.limits.values().filter(|l| l.enabled).cloned().collect();
            for limit in limits {
                let Some(value) = state.measured(limit.limit_type) else {
                    continue;
                };
                if value > limit.hard_limit {
                    state.violations += 1;
                    breaches.push(Breach { limit, value });
                } else if limit.soft_limit > 0.0 && value > limit.soft_limit {
                    if state.soft_breached.insert(limit.limit_type) {
                        soft_new.push((limit, value));
                    }
                } else {
                    state.soft_breached.remove(&limit.limit_type);
                }
            }
            (breaches, soft_new)
        };

        for (limit, value) in soft_new {
            warn!(
                "Connection {} pid {}: soft {} limit exceeded ({:.2} > {:.2})",
                conn, pid, limit.limit_type, value, limit.soft_limit
            );
            self.audit.record(
                SecurityEvent::new(
                    SecurityEventType::SoftLimitExceeded,
                    format!("{} {:.2} > soft {:.2}", limit.limit_type, value, limit.soft_limit),
                )
                .with_connection(conn)
                .with_pid(pid),
            );
        }

        for breach in breaches {
            self.enforce(conn, pid, &breach);
        }
        true
    }

    fn enforce(&self, conn: ConnectionId, pid: i32, breach: &Breach) {
        let limit = &breach.limit;
        self.metrics.limit_violations.inc();
        warn!(
            "Connection {} pid {}: hard {} limit exceeded ({:.2} > {:.2}), action {}",
            conn, pid, limit.limit_type, breach.value, limit.hard_limit, limit.action
        );
        self.audit.record(
            SecurityEvent::new(
                SecurityEventType::HardLimitEnforced,
                format!(
                    "{} {:.2} > hard {:.2}, action {}",
                    limit.limit_type, breach.value, limit.hard_limit, limit.action
                ),
            )
            .with_connection(conn)
            .with_pid(pid),
        );
        if let Err(e) = self.events.signal_with_data(
            conn,
            AsyncEventType::ProcessError,
            u64::from(limit.limit_type.code()),
            format!("{} limit exceeded", limit.limit_type),
        ) {
            debug!("Limit event for connection {} not signalled: {}", conn, e);
        }

        let outcome = match limit.action {
            EnforcementAction::Warn => Ok(true),
            EnforcementAction::Throttle => signal::stop_process(pid),
            EnforcementAction::Suspend => {
                let sent = signal::stop_process(pid);
                if matches!(sent, Ok(true)) {
                    let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
                    if let Some(state) = states.get_mut(&conn) {
                        state.suspended = true;
                    }
                }
                sent
            }
            EnforcementAction::Terminate => {
                {
                    let mut states = self.states.lock().unwrap_or_else(|p| p.into_inner());
                    match states.get_mut(&conn) {
                        Some(state) if !state.terminating => state.terminating = true,
                        _ => return,
                    }
                }
                let grace = Duration::from_millis(self.config.terminate_grace_ms);
                let report = self.terminate(pid, grace);
                Ok(report.term_sent || report.kill_sent || report.already_exited)
            }
        };
        if let Err(e) = outcome {
            error!(
                "Enforcing {} on pid {} of connection {} failed: {}",
                limit.action, pid, conn, e
            );
        }
    }

    fn terminate(&self, pid: i32, grace: Duration) -> KillReport {
        // A stopped process cannot act on SIGTERM
        let _ = signal::continue_process(pid);
        let reader = Arc::clone(&self.reader);
        let report = signal::terminate_gracefully(pid, grace, Duration::from_millis(10), || {
            signal::is_alive(pid) && !reader.is_zombie(pid)
        });
        if report.kill_sent {
            self.audit.record(
                SecurityEvent::new(
                    SecurityEventType::ForcedKill,
                    format!("pid {} ignored SIGTERM for {:?}", pid, grace),
                )
                .with_pid(pid),
            );
        }
        report
    }
}

impl Drop for ResourceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::EventConfig;

    #[derive(Debug)]
    struct FixedReader(ResourceUsage);

    impl AccountingReader for FixedReader {
        fn backend_name(&self) -> &'static str {
            "fixed"
        }

        fn sample(&self, pid: i32) -> Result<ResourceUsage> {
            Ok(ResourceUsage {
                pid,
                last_update: SystemTime::now(),
                ..self.0.clone()
            })
        }

        fn is_zombie(&self, pid: i32) -> bool {
            crate::resource::accounting::ProcAccountingReader::new().is_zombie(pid)
        }
    }

    fn process_state(pid: i32) -> Option<char> {
        let stat = std::fs::read_to_string(format!("/proc/{}/stat", pid)).ok()?;
        stat.rsplit_once(')')?.1.trim_start().chars().next()
    }

    fn wait_for_state(pid: i32, wanted: impl Fn(char) -> bool) -> bool {
        let deadline = std::time::Instant::now() + Duration::from_secs(3);
        while std::time::Instant::now() < deadline {
            if process_state(pid).map_or(false, &wanted) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    fn sleeper() -> std::process::Child {
        std::process::Command::new("/bin/sleep").arg("30").spawn().unwrap()
    }

    fn manager_with(reader: Arc<dyn AccountingReader>) -> ResourceManager {
        ResourceManager::new(
            ResourceManagerConfig::default(),
            reader,
            Arc::new(EventNotifier::new(&EventConfig::default()).unwrap()),
            Arc::new(AuditLog::disabled()),
            Arc::new(SupervisorMetrics::new()),
        )
    }

    fn manager() -> ResourceManager {
        manager_with(Arc::new(FixedReader(ResourceUsage::default())))
    }

    #[test]
    fn test_configure_limit_validation() {
        let rm = manager();
        assert!(rm
            .configure_limit(1, ResourceLimitType::CpuTime, 5.0, 10.0, EnforcementAction::Warn)
            .is_ok());
        assert!(rm
            .configure_limit(1, ResourceLimitType::CpuTime, 20.0, 10.0, EnforcementAction::Warn)
            .is_err());
        assert!(rm
            .configure_limit_from_spec(1, ResourceLimitType::MemoryVirtual, "1000:2000:terminate")
            .is_ok());
        assert!(rm
            .configure_limit_from_spec(1, ResourceLimitType::MemoryVirtual, "bad")
            .is_err());
        assert_eq!(rm.get_limits(1).len(), 2);
        assert!(rm.remove_limit(1, ResourceLimitType::CpuTime));
        assert!(!rm.remove_limit(1, ResourceLimitType::CpuTime));
    }

    #[test]
    fn test_child_plan_by_mode() {
        let rm = manager();
        rm.configure_limit(2, ResourceLimitType::FileDescriptors, 0.0, 32.0, EnforcementAction::Warn)
            .unwrap();
        rm.configure_limit(2, ResourceLimitType::MemoryRss, 0.0, 1e6, EnforcementAction::Warn)
            .unwrap();

        let plan = rm.child_plan(2);
        assert_eq!(plan.rlimits, vec![RlimitSetting::fixed(RlimitResource::OpenFiles, 32)]);
        assert!(!plan.no_new_privs);

        rm.configure_sandbox(2, SandboxMode::Restricted, vec![], vec![], Some("/srv/jail".into()))
            .unwrap();
        let plan = rm.child_plan(2);
        assert!(plan.no_new_privs);
        assert_eq!(plan.chroot, None);

        rm.configure_sandbox(
            2,
            SandboxMode::Strict,
            vec!["/srv/jail".into()],
            vec![],
            Some("/srv/jail".into()),
        )
        .unwrap();
        let plan = rm.child_plan(2);
        assert_eq!(plan.chroot.as_deref(), Some("/srv/jail"));
        assert!(plan
            .rlimits
            .contains(&RlimitSetting::fixed(RlimitResource::Core, 0)));

        assert_eq!(rm.child_plan(99), ChildResourcePlan::default());
    }

    #[test]
    fn test_sandbox_validation() {
        let rm = manager();
        assert!(rm
            .configure_sandbox(1, SandboxMode::Strict, vec![], vec![], None)
            .is_err());
        assert!(rm
            .configure_sandbox(1, SandboxMode::Isolated, vec![], vec![], Some("jail".into()))
            .is_err());
        assert!(rm
            .configure_sandbox(1, SandboxMode::Basic, vec!["/tmp/../etc".into()], vec![], None)
            .is_err());
    }

    #[test]
    fn test_check_sandbox_path() {
        let rm = manager();
        assert!(rm.check_sandbox_path(5, "/anything"));

        rm.configure_sandbox(
            5,
            SandboxMode::Basic,
            vec!["/srv".into()],
            vec!["/srv/secret".into()],
            None,
        )
        .unwrap();
        assert!(rm.check_sandbox_path(5, "/srv/data"));
        assert!(!rm.check_sandbox_path(5, "/srv/secret/key"));
        assert!(!rm.check_sandbox_path(5, "/etc"));
        assert!(!rm.check_sandbox_path(5, "/srv/../etc"));
    }

    #[test]
    fn test_apply_without_config_is_noop() {
        let rm = manager();
        assert!(!rm.apply(42, std::process::id() as i32).unwrap());
        assert!(rm.current_usage(42).is_none());
    }

    #[test]
    fn test_manual_tick_records_history_and_warns() {
        let usage = ResourceUsage {
            memory_rss_bytes: 5000,
            cpu_time_seconds: 1.0,
            ..ResourceUsage::default()
        };
        let rm = manager_with(Arc::new(FixedReader(usage)));
        rm.configure_limit(3, ResourceLimitType::MemoryRss, 1000.0, 1e9, EnforcementAction::Warn)
            .unwrap();
        rm.set_monitoring(3, false, None);
        // Our own pid stands in for a child; warn never signals it
        assert!(rm.apply(3, std::process::id() as i32).unwrap());
        assert!(!rm.is_monitoring(3));

        assert!(rm.update_usage(3));
        assert!(rm.update_usage(3));
        assert_eq!(rm.usage_history(3, 10).len(), 2);
        assert_eq!(rm.usage_history(3, 1).len(), 1);
        assert_eq!(rm.current_usage(3).unwrap().memory_rss_bytes, 5000);
        // Soft breach is recorded once while it persists
        assert_eq!(
            rm.shared.audit.count_of(SecurityEventType::SoftLimitExceeded),
            1
        );

        rm.configure_limit(3, ResourceLimitType::MemoryRss, 0.0, 100.0, EnforcementAction::Warn)
            .unwrap();
        assert!(rm.update_usage(3));
        assert_eq!(rm.shared.metrics.limit_violations.get(), 1);
        assert_eq!(rm.resource_statistics(3)["violations"], 1.0);

        rm.cleanup(3);
        assert!(!rm.has_config(3));
        assert!(!rm.update_usage(3));
    }

    #[test]
    fn test_history_is_capped() {
        let rm = ResourceManager::new(
            ResourceManagerConfig {
                history_size: 3,
                ..ResourceManagerConfig::default()
            },
            Arc::new(FixedReader(ResourceUsage::default())),
            Arc::new(EventNotifier::new(&EventConfig::default()).unwrap()),
            Arc::new(AuditLog::disabled()),
            Arc::new(SupervisorMetrics::new()),
        );
        rm.configure_limit(1, ResourceLimitType::WallTime, 0.0, 3600.0, EnforcementAction::Warn)
            .unwrap();
        rm.set_monitoring(1, false, None);
        rm.apply(1, std::process::id() as i32).unwrap();
        for _ in 0..5 {
            rm.update_usage(1);
        }
        assert_eq!(rm.usage_history(1, 100).len(), 3);
    }

    #[test]
    fn test_hard_memory_breach_throttles_child() {
        let usage = ResourceUsage {
            memory_rss_bytes: 64 << 20,
            ..ResourceUsage::default()
        };
        let rm = manager_with(Arc::new(FixedReader(usage)));
        let mut child = sleeper();
        let pid = child.id() as i32;
        rm.configure_limit(8, ResourceLimitType::MemoryRss, 0.0, 1e6, EnforcementAction::Throttle)
            .unwrap();
        rm.set_monitoring(8, false, None);
        assert!(rm.apply(8, pid).unwrap());

        assert!(rm.update_usage(8));
        assert!(wait_for_state(pid, |c| c == 'T'));
        assert_eq!(rm.shared.metrics.limit_violations.get(), 1);
        assert_eq!(
            rm.shared.audit.count_of(SecurityEventType::HardLimitEnforced),
            1
        );

        assert!(rm.resume(8).unwrap());
        assert!(wait_for_state(pid, |c| c != 'T'));
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_hard_memory_breach_suspends_child() {
        let usage = ResourceUsage {
            memory_virtual_bytes: 1 << 40,
            ..ResourceUsage::default()
        };
        let rm = manager_with(Arc::new(FixedReader(usage)));
        let mut child = sleeper();
        let pid = child.id() as i32;
        // Far above the rlimit the child gets, far below the sampled value
        rm.configure_limit(
            9,
            ResourceLimitType::MemoryVirtual,
            0.0,
            (1u64 << 36) as f64,
            EnforcementAction::Suspend,
        )
        .unwrap();
        rm.set_monitoring(9, false, None);
        assert!(rm.apply(9, pid).unwrap());

        assert!(rm.update_usage(9));
        assert!(wait_for_state(pid, |c| c == 'T'));
        assert!(rm.read_state(9, |s| s.suspended).unwrap());
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn test_hard_cpu_breach_terminates_child() {
        use std::os::unix::process::ExitStatusExt;

        let usage = ResourceUsage {
            cpu_time_seconds: 5.0,
            ..ResourceUsage::default()
        };
        let rm = ResourceManager::new(
            ResourceManagerConfig {
                terminate_grace_ms: 500,
                ..ResourceManagerConfig::default()
            },
            Arc::new(FixedReader(usage)),
            Arc::new(EventNotifier::new(&EventConfig::default()).unwrap()),
            Arc::new(AuditLog::disabled()),
            Arc::new(SupervisorMetrics::new()),
        );
        let mut child = sleeper();
        let pid = child.id() as i32;
        rm.configure_limit(10, ResourceLimitType::CpuTime, 0.0, 1.0, EnforcementAction::Terminate)
            .unwrap();
        rm.set_monitoring(10, false, None);
        assert!(rm.apply(10, pid).unwrap());

        let started = std::time::Instant::now();
        assert!(rm.update_usage(10));
        let status = child.wait().unwrap();
        assert_eq!(status.signal(), Some(libc::SIGTERM));
        // One tick plus the grace period at most
        assert!(started.elapsed() < Duration::from_millis(500 + 1000));
        assert!(rm.read_state(10, |s| s.terminating).unwrap());

        // The reaped child is gone; later ticks stop instead of enforcing again
        assert!(!rm.update_usage(10));
        assert_eq!(rm.shared.metrics.limit_violations.get(), 1);
    }

    #[test]
    fn test_terminating_connection_is_not_signalled_again() {
        let usage = ResourceUsage {
            cpu_time_seconds: 5.0,
            ..ResourceUsage::default()
        };
        let rm = manager_with(Arc::new(FixedReader(usage)));
        let mut child = sleeper();
        let pid = child.id() as i32;
        rm.configure_limit(11, ResourceLimitType::CpuTime, 0.0, 1.0, EnforcementAction::Terminate)
            .unwrap();
        rm.set_monitoring(11, false, None);
        assert!(rm.apply(11, pid).unwrap());
        rm.with_state(11, |s| s.terminating = true);

        assert!(rm.update_usage(11));
        assert!(rm.update_usage(11));
        std::thread::sleep(Duration::from_millis(100));
        assert!(child.try_wait().unwrap().is_none());
        assert_eq!(rm.shared.metrics.limit_violations.get(), 2);

        child.kill().unwrap();
        child.wait().unwrap();
    }
}
