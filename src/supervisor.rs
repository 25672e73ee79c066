//! Service container
//!
//! `Supervisor` builds every subsystem from one `SupervisorConfig`, hands
//! each its collaborators as `Arc`s and tears them down in reverse order.

use crate::config::types::{ConnectionId, Result, SupervisorConfig, SupervisorError};
use crate::config::validator::{check_system_capabilities, validate_config};
use crate::core::process::ProcessManager;
use crate::events::file_monitor::{FileMonitor, FileMonitorManager};
use crate::events::notifier::{AsyncEventManager, EventNotifier, EventStats};
use crate::exec::executor::CommandExecutor;
use crate::io::redirector::IORedirector;
use crate::observability::audit::AuditLog;
use crate::observability::metrics::{MetricsSnapshot, SupervisorMetrics};
use crate::resource::accounting::{ProcAccountingReader, ResourceUsage};
use crate::resource::manager::ResourceManager;
use crate::runtime::security::ProcessSecurityManager;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Serialisable snapshot of the whole supervisor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupervisorStatus {
    pub active_commands: usize,
    pub queued_commands: usize,
    pub process_count: usize,
    pub running_processes: usize,
    pub watch_count: usize,
    pub pending_events: usize,
    pub events: EventStats,
    /// Latest sample per monitored connection
    pub resource_usage: BTreeMap<ConnectionId, ResourceUsage>,
    pub metrics: MetricsSnapshot,
}

#[derive(Debug)]
pub struct Supervisor {
    config: SupervisorConfig,
    metrics: Arc<SupervisorMetrics>,
    audit: Arc<AuditLog>,
    events: Arc<EventNotifier>,
    async_events: Arc<AsyncEventManager>,
    security: Arc<ProcessSecurityManager>,
    redirector: Arc<IORedirector>,
    resources: Arc<ResourceManager>,
    processes: Arc<ProcessManager>,
    executor: Arc<CommandExecutor>,
    /// Absent when inotify is unavailable
    files: Option<Arc<FileMonitorManager>>,
    shut_down: AtomicBool,
}

impl Supervisor {
    /// Validate `config` and bring every subsystem up
    pub fn init(config: SupervisorConfig) -> Result<Self> {
        let validation = validate_config(&config)?;
        for warning in &validation.warnings {
            warn!("Config: {}", warning);
        }
        for missing in check_system_capabilities() {
            warn!("{}", missing);
        }

        let metrics = Arc::new(SupervisorMetrics::new());
        let audit = Arc::new(match &config.audit_log_path {
            Some(path) => AuditLog::with_file(PathBuf::from(path))?,
            None => AuditLog::disabled(),
        });
        let events =
            Arc::new(EventNotifier::new(&config.events)?.with_metrics(Arc::clone(&metrics)));
        let async_events = Arc::new(AsyncEventManager::new(Arc::clone(&events), &config.events));
        let security = Arc::new(ProcessSecurityManager::new(Arc::clone(&audit)));
        let redirector = Arc::new(IORedirector::new());
        let resources = Arc::new(ResourceManager::new(
            config.resources.clone(),
            Arc::new(ProcAccountingReader::new()),
            Arc::clone(&events),
            Arc::clone(&audit),
            Arc::clone(&metrics),
        ));
        let processes = Arc::new(ProcessManager::new(
            config.process.clone(),
            Arc::clone(&security),
            Arc::clone(&redirector),
            Arc::clone(&resources),
            Arc::clone(&events),
            Arc::clone(&metrics),
        )?);
        let executor = Arc::new(CommandExecutor::new(
            config.executor.clone(),
            Arc::clone(&processes),
            Arc::clone(&resources),
            Arc::clone(&redirector),
            Arc::clone(&security),
            Arc::clone(&events),
            Arc::clone(&metrics),
        )?);

        let files = match FileMonitor::new(config.files.clone(), Arc::clone(&audit)) {
            Ok(monitor) => Some(Arc::new(FileMonitorManager::new(
                Arc::new(monitor),
                Arc::clone(&events),
                Arc::clone(&metrics),
                &config.files,
            ))),
            Err(e) => {
                warn!("File monitoring disabled: {}", e);
                None
            }
        };

        info!("Supervisor initialised");
        Ok(Self {
            config,
            metrics,
            audit,
            events,
            async_events,
            security,
            redirector,
            resources,
            processes,
            executor,
            files,
            shut_down: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<SupervisorMetrics> {
        &self.metrics
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }

    pub fn events(&self) -> &Arc<EventNotifier> {
        &self.events
    }

    pub fn async_events(&self) -> &Arc<AsyncEventManager> {
        &self.async_events
    }

    pub fn security(&self) -> &Arc<ProcessSecurityManager> {
        &self.security
    }

    pub fn redirector(&self) -> &Arc<IORedirector> {
        &self.redirector
    }

    pub fn resources(&self) -> &Arc<ResourceManager> {
        &self.resources
    }

    pub fn processes(&self) -> &Arc<ProcessManager> {
        &self.processes
    }

    pub fn executor(&self) -> &Arc<CommandExecutor> {
        &self.executor
    }

    pub fn files(&self) -> Option<&Arc<FileMonitorManager>> {
        self.files.as_ref()
    }

    /// Like `files` but an error when monitoring is unavailable
    pub fn require_files(&self) -> Result<&Arc<FileMonitorManager>> {
        self.files
            .as_ref()
            .ok_or_else(|| SupervisorError::Watch("file monitoring unavailable".to_string()))
    }

    /// Register `conn` on the event bus and its per-connection queue
    pub fn register_connection(&self, conn: ConnectionId) {
        self.async_events.register_connection(conn);
    }

    /// Release everything `conn` holds, subsystem by subsystem
    pub fn cleanup_connection(&self, conn: ConnectionId) {
        let cancelled = self.executor.cancel_connection(conn);
        self.resources.cleanup(conn);
        self.redirector.cleanup(conn);
        self.processes.cleanup(conn);
        if let Some(files) = &self.files {
            files.cleanup(conn);
        }
        self.async_events.unregister_connection(conn);
        debug!(
            "Connection {} cleaned up ({} commands cancelled)",
            conn, cancelled
        );
    }

    pub fn status(&self) -> SupervisorStatus {
        let resource_usage = self
            .resources
            .configured_connections()
            .into_iter()
            .filter_map(|conn| self.resources.current_usage(conn).map(|u| (conn, u)))
            .collect();
        SupervisorStatus {
            active_commands: self.executor.active_count(),
            queued_commands: self.executor.queue_size(),
            process_count: self.processes.process_count(),
            running_processes: self.processes.running_count(),
            watch_count: self.files.as_ref().map_or(0, |f| f.monitor().watch_count()),
            pending_events: self.events.pending_count(),
            events: self.events.stats(),
            resource_usage,
            metrics: self.metrics.snapshot(),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    /// Tear down in reverse construction order. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Supervisor shutting down");
        self.executor.shutdown();
        self.processes.shutdown();
        self.resources.shutdown();
        for conn in self.events.registered_connections() {
            self.async_events.unregister_connection(conn);
        }
        info!("Supervisor shut down");
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        if !self.is_shut_down() {
            warn!("Supervisor dropped without shutdown; shutting down now");
            self.shutdown();
        }
    }
}
