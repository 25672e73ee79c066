//! CommandExecutor: validated request queue, worker pool and result store
//! layered over the ProcessManager.
//!
//! Each running command occupies its own process-table slot (a synthetic
//! connection id above `SLOT_BASE`), so one connection may run several
//! commands at once. The owning connection's resource policy is copied onto
//! the slot before spawn and completion events go to the owner.

use crate::config::types::{
    ConnectionId, ExecutorConfig, ExitClass, Result, StringMap, SupervisorError, EXIT_PENDING,
    EXIT_TIMEOUT,
};
use crate::core::process::ProcessManager;
use crate::core::types::ExternalProcessInfo;
use crate::events::notifier::{AsyncEventType, EventNotifier};
use crate::exec::history::{CommandHistory, ResultStore};
use crate::exec::request::{CommandRequest, CommandResult};
use crate::exec::templates::CommandTemplate;
use crate::io::redirector::{IORedirector, IoResult, MAX_IO_BUFFER};
use crate::observability::metrics::SupervisorMetrics;
use crate::resource::manager::ResourceManager;
use crate::runtime::security::{path_validation, ProcessSecurityManager};
use crate::utils::command::{format_command, resolve_command};
use crate::utils::output::BoundedOutput;
use log::{debug, error, info, warn};
use nix::sys::signal::Signal;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// First process-table slot used for executor commands
pub const SLOT_BASE: ConnectionId = 1 << 30;

const SLOT_SPAN: i32 = 1 << 29;

/// Wait between I/O polls while a command makes no progress
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// SIGTERM to SIGKILL delay for cancelled commands
const CANCEL_GRACE: Duration = Duration::from_secs(1);

/// Extra time past the request timeout before the executor kills on its own
const TIMEOUT_SLACK: Duration = Duration::from_secs(5);

#[derive(Debug)]
struct QueueState {
    items: VecDeque<CommandRequest>,
    accepting: bool,
}

#[derive(Debug, Clone)]
struct ActiveCommand {
    connection_id: ConnectionId,
    slot: ConnectionId,
    cancelled: bool,
}

/// Serialisable executor dump
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorStatus {
    pub accepting: bool,
    pub workers: usize,
    pub active_commands: usize,
    pub queue_size: usize,
    pub stored_results: usize,
    pub active_request_ids: Vec<String>,
    pub templates: Vec<String>,
    pub history: CommandHistory,
}

#[derive(Debug)]
struct Shared {
    config: ExecutorConfig,
    queue: Mutex<QueueState>,
    available: Condvar,
    active: Mutex<HashMap<String, ActiveCommand>>,
    results: Mutex<ResultStore>,
    templates: Mutex<HashMap<String, CommandTemplate>>,
    next_slot: AtomicI32,
    processes: Arc<ProcessManager>,
    resources: Arc<ResourceManager>,
    redirector: Arc<IORedirector>,
    security: Arc<ProcessSecurityManager>,
    events: Arc<EventNotifier>,
    metrics: Arc<SupervisorMetrics>,
}

#[derive(Debug)]
pub struct CommandExecutor {
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|p| p.into_inner())
}

impl CommandExecutor {
    /// Create the executor and start its worker pool
    pub fn new(
        config: ExecutorConfig,
        processes: Arc<ProcessManager>,
        resources: Arc<ResourceManager>,
        redirector: Arc<IORedirector>,
        security: Arc<ProcessSecurityManager>,
        events: Arc<EventNotifier>,
        metrics: Arc<SupervisorMetrics>,
    ) -> Result<Self> {
        let worker_count = config.effective_workers();
        let shared = Arc::new(Shared {
            queue: Mutex::new(QueueState {
                items: VecDeque::new(),
                accepting: true,
            }),
            available: Condvar::new(),
            active: Mutex::new(HashMap::new()),
            results: Mutex::new(ResultStore::new(
                config.max_history_size,
                config.history_eviction_slack,
            )),
            templates: Mutex::new(HashMap::new()),
            next_slot: AtomicI32::new(0),
            config,
            processes,
            resources,
            redirector,
            security,
            events,
            metrics,
        });

        let mut workers = Vec::with_capacity(worker_count);
        for index in 0..worker_count {
            let worker_shared = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("procwarden-worker-{}", index))
                .spawn(move || worker_shared.worker_loop())
                .map_err(|e| SupervisorError::Queue(format!("worker thread: {}", e)))?;
            workers.push(handle);
        }
        info!(
            "Command executor started ({} workers, queue {}, history {})",
            worker_count, shared.config.max_queue_size, shared.config.max_history_size
        );

        Ok(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Checks applied before a request may run or be queued
    pub fn validate_request(&self, request: &CommandRequest) -> Result<()> {
        self.shared.validate(request)
    }

    /// Run on the calling thread. Returns the request id once the command
    /// has finished, or "" when it was rejected or could not be spawned.
    pub fn execute_sync(&self, request: CommandRequest) -> String {
        let shared = &self.shared;
        if let Err(e) = shared.admit(&request) {
            shared.reject(&request, &e);
            return String::new();
        }

        let slot = {
            let mut active = lock(&shared.active);
            if active.len() >= shared.config.max_concurrent {
                drop(active);
                shared.reject(
                    &request,
                    &SupervisorError::Queue("Too many concurrent commands".to_string()),
                );
                return String::new();
            }
            shared.activate(&mut active, &request)
        };

        let result = shared.run(&request, slot);
        let spawned = result.pid > 0;
        let id = request.request_id.clone();
        shared.complete(&request, result);
        if spawned {
            id
        } else {
            String::new()
        }
    }

    /// Queue for the worker pool. Returns the request id, or "" when the
    /// request was rejected or the queue is full.
    pub fn execute_async(&self, request: CommandRequest) -> String {
        let shared = &self.shared;
        if let Err(e) = shared.admit(&request) {
            shared.reject(&request, &e);
            return String::new();
        }

        let id = request.request_id.clone();
        {
            let mut queue = lock(&shared.queue);
            if !queue.accepting {
                drop(queue);
                shared.reject(
                    &request,
                    &SupervisorError::Queue("Executor is shutting down".to_string()),
                );
                return String::new();
            }
            if queue.items.len() >= shared.config.max_queue_size {
                drop(queue);
                shared.reject(&request, &SupervisorError::Queue("Command queue full".to_string()));
                return String::new();
            }
            queue.items.push_back(request);
        }
        shared.available.notify_one();
        debug!("Queued command {}", id);
        id
    }

    /// Dispatch on the request's async flag
    pub fn execute(&self, request: CommandRequest) -> String {
        if request.async_exec {
            self.execute_async(request)
        } else {
            self.execute_sync(request)
        }
    }

    /// Queued requests are removed and never produce a result; running
    /// ones are asked to terminate.
    pub fn cancel(&self, request_id: &str) -> bool {
        let shared = &self.shared;
        let mut queue = lock(&shared.queue);
        if let Some(pos) = queue.items.iter().position(|r| r.request_id == request_id) {
            queue.items.remove(pos);
            drop(queue);
            shared.metrics.commands_cancelled.inc();
            info!("Cancelled queued command {}", request_id);
            return true;
        }

        let slot = {
            let mut active = lock(&shared.active);
            drop(queue);
            match active.get_mut(request_id) {
                Some(command) => {
                    command.cancelled = true;
                    command.slot
                }
                None => return false,
            }
        };
        // Not yet spawned is fine: the run checks the flag before spawning
        shared.processes.terminate(slot, Signal::SIGTERM);
        info!("Cancellation requested for running command {}", request_id);
        true
    }

    /// Cancel everything queued or running for `conn`
    pub fn cancel_connection(&self, conn: ConnectionId) -> usize {
        let shared = &self.shared;
        let mut cancelled = 0;
        {
            let mut queue = lock(&shared.queue);
            let before = queue.items.len();
            queue.items.retain(|r| r.connection_id != conn);
            cancelled += before - queue.items.len();
        }
        for _ in 0..cancelled {
            shared.metrics.commands_cancelled.inc();
        }

        let running: Vec<String> = lock(&shared.active)
            .iter()
            .filter(|(_, c)| c.connection_id == conn)
            .map(|(id, _)| id.clone())
            .collect();
        for id in running {
            if self.cancel(&id) {
                cancelled += 1;
            }
        }
        if cancelled > 0 {
            info!("Cancelled {} commands of connection {}", cancelled, conn);
        }
        cancelled
    }

    pub fn get_result(&self, request_id: &str) -> Option<CommandResult> {
        lock(&self.shared.results).get(request_id).cloned()
    }

    pub fn remove_result(&self, request_id: &str) -> Option<CommandResult> {
        lock(&self.shared.results).remove(request_id)
    }

    pub fn results_for_connection(&self, conn: ConnectionId) -> Vec<CommandResult> {
        lock(&self.shared.results).for_connection(conn)
    }

    pub fn slowest_commands(&self, n: usize) -> Vec<CommandResult> {
        lock(&self.shared.results).slowest(n)
    }

    pub fn history(&self) -> CommandHistory {
        lock(&self.shared.results).history()
    }

    pub fn clear_results(&self) {
        lock(&self.shared.results).clear();
    }

    pub fn active_count(&self) -> usize {
        lock(&self.shared.active).len()
    }

    pub fn queue_size(&self) -> usize {
        lock(&self.shared.queue).items.len()
    }

    pub fn is_active(&self, request_id: &str) -> bool {
        lock(&self.shared.active).contains_key(request_id)
    }

    pub fn is_queued(&self, request_id: &str) -> bool {
        lock(&self.shared.queue)
            .items
            .iter()
            .any(|r| r.request_id == request_id)
    }

    pub fn active_request_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = lock(&self.shared.active).keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn register_template(&self, template: CommandTemplate) -> Result<()> {
        template.validate()?;
        debug!("Registered command template {}", template.name);
        lock(&self.shared.templates).insert(template.name.clone(), template);
        Ok(())
    }

    pub fn unregister_template(&self, name: &str) -> bool {
        lock(&self.shared.templates).remove(name).is_some()
    }

    pub fn get_template(&self, name: &str) -> Option<CommandTemplate> {
        lock(&self.shared.templates).get(name).cloned()
    }

    pub fn list_templates(&self) -> Vec<String> {
        let mut names: Vec<String> = lock(&self.shared.templates).keys().cloned().collect();
        names.sort();
        names
    }

    /// Instantiate a template and run it synchronously
    pub fn execute_template(&self, name: &str, conn: ConnectionId, params: &StringMap) -> String {
        let Some(template) = self.get_template(name) else {
            warn!("Unknown command template {}", name);
            return String::new();
        };
        match template.instantiate(conn, params) {
            Ok(request) => self.execute_sync(request),
            Err(e) => {
                warn!("Template {} could not be instantiated: {}", name, e);
                String::new()
            }
        }
    }

    pub fn status(&self) -> ExecutorStatus {
        let (accepting, queue_size) = {
            let queue = lock(&self.shared.queue);
            (queue.accepting, queue.items.len())
        };
        ExecutorStatus {
            accepting,
            workers: lock(&self.workers).len(),
            active_commands: self.active_count(),
            queue_size,
            stored_results: lock(&self.shared.results).len(),
            active_request_ids: self.active_request_ids(),
            templates: self.list_templates(),
            history: self.history(),
        }
    }

    /// Stop accepting work, drop the queue, cancel running commands and
    /// join the workers. Idempotent.
    pub fn shutdown(&self) {
        let dropped = {
            let mut queue = lock(&self.shared.queue);
            if !queue.accepting {
                return;
            }
            queue.accepting = false;
            let dropped = queue.items.len();
            queue.items.clear();
            dropped
        };
        self.shared.available.notify_all();
        if dropped > 0 {
            info!("Dropped {} queued commands at shutdown", dropped);
        }

        for id in self.active_request_ids() {
            self.cancel(&id);
        }

        let workers: Vec<JoinHandle<()>> = lock(&self.workers).drain(..).collect();
        for handle in workers {
            if handle.join().is_err() {
                error!("Command worker panicked");
            }
        }
        info!("Command executor shut down");
    }
}

impl Drop for CommandExecutor {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    fn worker_loop(&self) {
        loop {
            let (request, slot) = {
                let mut queue = lock(&self.queue);
                let request = loop {
                    if !queue.accepting {
                        return;
                    }
                    if let Some(request) = queue.items.pop_front() {
                        break request;
                    }
                    queue = self
                        .available
                        .wait(queue)
                        .unwrap_or_else(|p| p.into_inner());
                };
                // Activated under the queue lock so cancel always finds it
                let slot = self.activate(&mut lock(&self.active), &request);
                (request, slot)
            };
            let result = self.run(&request, slot);
            self.complete(&request, result);
        }
    }

    fn validate(&self, request: &CommandRequest) -> Result<()> {
        if request.command.trim().is_empty() {
            return Err(SupervisorError::Validation("Empty command".to_string()));
        }
        if request.connection_id < 0 {
            return Err(SupervisorError::Validation(format!(
                "Invalid connection id {}",
                request.connection_id
            )));
        }
        let (min, max) = (self.config.min_timeout_secs, self.config.max_timeout_secs);
        if request.timeout_seconds < min || request.timeout_seconds > max {
            return Err(SupervisorError::Validation(format!(
                "Timeout {}s outside {}..={}s",
                request.timeout_seconds, min, max
            )));
        }

        let ctx = request
            .security
            .as_ref()
            .unwrap_or(&self.config.default_security);
        self.security.validate_process(
            request.connection_id,
            &request.command,
            &request.args,
            &request.env_pairs(),
            &request.working_dir,
            ctx,
        )?;

        if !request.working_dir.is_empty() && !path_validation::is_safe_working_dir(&request.working_dir) {
            return Err(SupervisorError::Security(format!(
                "Unsafe working directory: {}",
                request.working_dir
            )));
        }
        if resolve_command(&request.command).is_none() {
            return Err(SupervisorError::Validation(format!(
                "Command not found or not executable: {}",
                request.command
            )));
        }
        Ok(())
    }

    fn admit(&self, request: &CommandRequest) -> Result<()> {
        if !lock(&self.queue).accepting {
            return Err(SupervisorError::Queue("Executor is shutting down".to_string()));
        }
        self.validate(request)
    }

    fn reject(&self, request: &CommandRequest, err: &SupervisorError) {
        self.metrics.commands_rejected.inc();
        warn!(
            "Rejected command {} for connection {}: {}",
            request.request_id, request.connection_id, err
        );
    }

    fn activate(
        &self,
        active: &mut HashMap<String, ActiveCommand>,
        request: &CommandRequest,
    ) -> ConnectionId {
        let n = self.next_slot.fetch_add(1, Ordering::Relaxed);
        let slot = SLOT_BASE + n.rem_euclid(SLOT_SPAN);
        active.insert(
            request.request_id.clone(),
            ActiveCommand {
                connection_id: request.connection_id,
                slot,
                cancelled: false,
            },
        );
        slot
    }

    fn is_cancelled(&self, request_id: &str) -> bool {
        lock(&self.active)
            .get(request_id)
            .map_or(false, |c| c.cancelled)
    }

    fn run(&self, request: &CommandRequest, slot: ConnectionId) -> CommandResult {
        let mut result = CommandResult::started(request);
        if self.is_cancelled(&request.request_id) {
            result.cancelled = true;
            result.fail("Command cancelled");
            return result;
        }

        self.resources.copy_config(request.connection_id, slot);
        if self.redirector.is_configured(request.connection_id) {
            let plan = self.redirector.config(request.connection_id);
            if let Err(e) = self.redirector.set_config(slot, plan) {
                warn!("Redirection of connection {} not applied: {}", request.connection_id, e);
            }
        }
        let ctx = request
            .security
            .clone()
            .unwrap_or_else(|| self.config.default_security.clone());
        let mut info = ExternalProcessInfo {
            command: request.command.clone(),
            args: request.args.clone(),
            env: request.env_pairs(),
            working_dir: request.working_dir.clone(),
            timeout_seconds: request.timeout_seconds,
            ..ExternalProcessInfo::default()
        };

        debug!(
            "Running {} in slot {}: {}",
            request.request_id,
            slot,
            format_command(&request.command, &request.args)
        );
        if !self.processes.spawn(slot, &mut info, &ctx) {
            result.fail(info.error_message);
            self.release(slot);
            return result;
        }
        result.pid = info.pid;

        let (stdout, stderr, code) = self.collect(request, slot);
        let record = self.processes.process_info(slot);
        result.exit_code = code;
        result.resource_usage = self.resources.current_usage(slot);
        result.stdout_integrity = stdout.integrity();
        result.stderr_integrity = stderr.integrity();
        result.stdout = stdout.into_string();
        result.stderr = stderr.into_string();

        let timed_out = record.as_ref().map_or(false, |r| r.timed_out);
        if timed_out || code == EXIT_TIMEOUT {
            result.timed_out = true;
            result.exit_code = EXIT_TIMEOUT;
            result.fail("Process timed out");
        } else if self.is_cancelled(&request.request_id) {
            result.cancelled = true;
            result.fail("Command cancelled");
        } else {
            match ExitClass::from_code(code) {
                ExitClass::Success => result.success = true,
                ExitClass::Exited(c) => result.fail(format!("Process exited with code {}", c)),
                ExitClass::Signaled(s) => {
                    result.fail(format!("Process terminated by signal {}", s))
                }
                other => {
                    let message = record
                        .map(|r| r.error_message)
                        .filter(|m| !m.is_empty())
                        .unwrap_or_else(|| format!("Process ended abnormally ({})", other));
                    result.fail(message);
                }
            }
        }

        self.release(slot);
        result
    }

    /// Feed stdin, drain stdout/stderr and wait for exit
    fn collect(&self, request: &CommandRequest, slot: ConnectionId) -> (BoundedOutput, BoundedOutput, i32) {
        let new_output = || {
            if request.capture_output {
                BoundedOutput::new(self.config.max_output_bytes)
            } else {
                BoundedOutput::not_captured()
            }
        };
        let mut stdout = new_output();
        let mut stderr = new_output();
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut buf = vec![0u8; MAX_IO_BUFFER];

        let input = request.input_data.as_deref().unwrap_or("").as_bytes();
        let mut written = 0usize;
        let mut stdin_open = true;
        if input.is_empty() {
            self.processes.close_stdin(slot);
            stdin_open = false;
        }

        let deadline = Instant::now() + Duration::from_secs(request.timeout_seconds) + TIMEOUT_SLACK;
        let mut cancel_sent: Option<Instant> = None;
        let mut hard_killed = false;

        let code = loop {
            let mut progressed = false;

            if stdin_open {
                let r = self.processes.write_stdin(slot, &input[written..]);
                if r.success {
                    written += r.bytes_processed;
                    progressed |= r.bytes_processed > 0;
                }
                if r.is_error() || written >= input.len() {
                    self.processes.close_stdin(slot);
                    stdin_open = false;
                }
            }

            if stdout_open {
                let r = self.processes.read_stdout(slot, &mut buf);
                progressed |= absorb(r, &buf, &mut stdout, &mut stdout_open);
            }
            if stderr_open {
                let r = self.processes.read_stderr(slot, &mut buf);
                progressed |= absorb(r, &buf, &mut stderr, &mut stderr_open);
            }

            if self.is_cancelled(&request.request_id) {
                match cancel_sent {
                    None => {
                        self.processes.terminate(slot, Signal::SIGTERM);
                        cancel_sent = Some(Instant::now());
                    }
                    Some(at) if at.elapsed() >= CANCEL_GRACE && !hard_killed => {
                        self.processes.kill(slot);
                        hard_killed = true;
                    }
                    Some(_) => {}
                }
            }
            if !hard_killed && Instant::now() >= deadline {
                warn!("Command {} outlived its timeout; killing", request.request_id);
                self.processes.kill(slot);
                hard_killed = true;
            }

            let wait = if progressed { Duration::ZERO } else { POLL_INTERVAL };
            let code = self.processes.wait_for_exit(slot, wait);
            if code != EXIT_PENDING {
                break code;
            }
        };

        // Output written just before exit is still buffered in the pipes
        loop {
            let mut progressed = false;
            if stdout_open {
                let r = self.processes.read_stdout(slot, &mut buf);
                progressed |= absorb(r, &buf, &mut stdout, &mut stdout_open);
            }
            if stderr_open {
                let r = self.processes.read_stderr(slot, &mut buf);
                progressed |= absorb(r, &buf, &mut stderr, &mut stderr_open);
            }
            if !progressed {
                break;
            }
        }
        (stdout, stderr, code)
    }

    fn release(&self, slot: ConnectionId) {
        self.processes.cleanup(slot);
        self.resources.cleanup(slot);
        self.redirector.cleanup(slot);
    }

    fn complete(&self, request: &CommandRequest, mut result: CommandResult) {
        lock(&self.active).remove(&request.request_id);
        result.finish(request);

        self.metrics.commands_executed.inc();
        if result.cancelled {
            self.metrics.commands_cancelled.inc();
        }
        if !result.success {
            self.metrics.commands_failed.inc();
        }
        info!(
            "Command {} for connection {} finished: exit {} in {}ms{}",
            result.request_id,
            result.connection_id,
            result.exit_code,
            result.execution_time_ms,
            if result.success { "" } else { " (failed)" }
        );

        let conn = result.connection_id;
        let event_type = match result.exit_class() {
            ExitClass::Success | ExitClass::Exited(_) | ExitClass::Signaled(_) => {
                AsyncEventType::ProcessExited
            }
            _ => AsyncEventType::ProcessError,
        };
        let value = result.exit_code as i64 as u64;
        let request_id = result.request_id.clone();
        lock(&self.results).insert(result);

        if self.events.is_registered(conn) {
            if let Err(e) = self.events.signal_with_data(conn, event_type, value, request_id) {
                debug!("Completion event for connection {} dropped: {}", conn, e);
            }
        }
    }
}

/// Fold one read result into `out`; true when bytes arrived
fn absorb(r: IoResult, buf: &[u8], out: &mut BoundedOutput, open: &mut bool) -> bool {
    if r.success && r.bytes_processed > 0 {
        out.push(&buf[..r.bytes_processed]);
        return true;
    }
    if let Some(err) = r.error {
        *open = false;
        if err != "pipe closed" && !err.ends_with("is not a pipe") {
            out.mark_read_error();
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::types::{
        EventConfig, ProcessManagerConfig, ResourceManagerConfig, SecurityContext,
        EXIT_INTERNAL_FAILURE,
    };
    use crate::exec::builder::CommandBuilder;
    use crate::observability::audit::AuditLog;
    use crate::resource::accounting::ProcAccountingReader;

    fn open_context() -> SecurityContext {
        SecurityContext {
            sandbox_enabled: false,
            drop_privileges: false,
            max_processes: 0,
            ..SecurityContext::default()
        }
    }

    fn executor(config: ExecutorConfig) -> (CommandExecutor, Arc<EventNotifier>) {
        let audit = Arc::new(AuditLog::disabled());
        let metrics = Arc::new(SupervisorMetrics::new());
        let events = Arc::new(EventNotifier::new(&EventConfig::default()).unwrap());
        let security = Arc::new(ProcessSecurityManager::new(Arc::clone(&audit)));
        let redirector = Arc::new(IORedirector::new());
        let resources = Arc::new(ResourceManager::new(
            ResourceManagerConfig::default(),
            Arc::new(ProcAccountingReader::new()),
            Arc::clone(&events),
            audit,
            Arc::clone(&metrics),
        ));
        let processes = Arc::new(
            ProcessManager::new(
                ProcessManagerConfig::default(),
                Arc::clone(&security),
                Arc::clone(&redirector),
                Arc::clone(&resources),
                Arc::clone(&events),
                Arc::clone(&metrics),
            )
            .unwrap(),
        );
        let exec = CommandExecutor::new(
            ExecutorConfig {
                default_security: open_context(),
                ..config
            },
            processes,
            resources,
            redirector,
            security,
            Arc::clone(&events),
            metrics,
        )
        .unwrap();
        (exec, events)
    }

    fn wait_for_result(exec: &CommandExecutor, id: &str) -> CommandResult {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if let Some(result) = exec.get_result(id) {
                return result;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        panic!("no result for {}", id);
    }

    #[test]
    fn test_sync_echo() {
        let (exec, events) = executor(ExecutorConfig::default());
        events.register_connection(1);
        let id = exec.execute_sync(CommandBuilder::new("/bin/echo").connection(1).arg("hi").timeout(5).build());
        assert!(id.starts_with("cmd_"));
        let result = exec.get_result(&id).unwrap();
        assert!(result.success, "{}", result.error_message);
        assert_eq!(result.exit_code, 0);
        assert_eq!(result.stdout, "hi\n");
        assert!(events
            .drain_pending()
            .iter()
            .any(|e| e.event_type == AsyncEventType::ProcessExited
                && e.data.as_deref() == Some(id.as_str())));
    }

    #[test]
    fn test_validation_rejections() {
        let (exec, _) = executor(ExecutorConfig::default());
        assert_eq!(exec.execute_sync(CommandRequest::new(1, "", vec![])), "");
        assert_eq!(exec.execute_sync(CommandRequest::new(-3, "/bin/echo", vec![])), "");
        assert_eq!(
            exec.execute_sync(CommandBuilder::new("/bin/echo").timeout(0).build()),
            ""
        );
        assert_eq!(
            exec.execute_sync(CommandBuilder::new("/bin/echo").timeout(100_000).build()),
            ""
        );
        assert_eq!(exec.execute_sync(CommandRequest::new(1, "/bin/echo;rm", vec![])), "");
        assert_eq!(
            exec.execute_sync(CommandBuilder::new("/bin/echo").working_dir("/etc").build()),
            ""
        );
        assert_eq!(exec.execute_sync(CommandRequest::new(1, "/no/such/tool", vec![])), "");
        assert_eq!(exec.status().stored_results, 0);
        assert_eq!(exec.queue_size(), 0);
    }

    #[test]
    fn test_input_and_nonzero_exit() {
        let (exec, _) = executor(ExecutorConfig::default());
        let id = exec.execute_sync(CommandBuilder::new("/bin/cat").input("abc").build());
        assert_eq!(exec.get_result(&id).unwrap().stdout, "abc");

        let id = exec.execute_sync(
            CommandBuilder::new("/bin/sh")
                .args(["-c", "echo err >&2; exit 4"])
                .on_error("failed_cb")
                .build(),
        );
        let result = exec.get_result(&id).unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 4);
        assert_eq!(result.stderr, "err\n");
        assert_eq!(result.callback.as_deref(), Some("failed_cb"));
    }

    #[test]
    fn test_output_truncation() {
        let (exec, _) = executor(ExecutorConfig {
            max_output_bytes: 4,
            ..ExecutorConfig::default()
        });
        let id = exec.execute_sync(CommandBuilder::new("/bin/echo").arg("truncated").build());
        let result = exec.get_result(&id).unwrap();
        assert_eq!(result.stdout, "trun");
        assert_eq!(
            result.stdout_integrity,
            crate::utils::output::OutputIntegrity::Truncated
        );
    }

    #[test]
    fn test_async_and_cancel_queued() {
        let (exec, _) = executor(ExecutorConfig {
            worker_threads: 1,
            max_concurrent: 1,
            ..ExecutorConfig::default()
        });
        let blocker = exec.execute_async(CommandBuilder::new("/bin/sleep").arg("2").build());
        let queued = exec.execute_async(CommandBuilder::new("/bin/echo").arg("never").build());
        assert!(!blocker.is_empty() && !queued.is_empty());

        // The single worker is busy with the blocker
        let deadline = Instant::now() + Duration::from_secs(5);
        while !exec.is_active(&blocker) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(exec.is_queued(&queued));
        assert!(exec.cancel(&queued));
        assert!(!exec.cancel(&queued));
        assert!(exec.cancel(&blocker));

        let result = wait_for_result(&exec, &blocker);
        assert!(result.cancelled);
        assert!(!result.success);
        std::thread::sleep(Duration::from_millis(50));
        assert!(exec.get_result(&queued).is_none());
    }

    #[test]
    fn test_queue_full() {
        let (exec, _) = executor(ExecutorConfig {
            worker_threads: 1,
            max_concurrent: 1,
            max_queue_size: 1,
            ..ExecutorConfig::default()
        });
        let first = exec.execute_async(CommandBuilder::new("/bin/sleep").arg("1").build());
        let deadline = Instant::now() + Duration::from_secs(5);
        while !exec.is_active(&first) && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        let second = exec.execute_async(CommandBuilder::new("/bin/true").build());
        assert!(!second.is_empty());
        let third = exec.execute_async(CommandBuilder::new("/bin/true").build());
        assert_eq!(third, "");
        assert_eq!(exec.queue_size(), 1);
        exec.shutdown();
        assert_eq!(exec.execute_async(CommandBuilder::new("/bin/true").build()), "");
    }

    #[test]
    fn test_templates() {
        let (exec, _) = executor(ExecutorConfig::default());
        let mut tpl = CommandTemplate::new("greet", "/bin/echo");
        tpl.default_args = vec!["hello".into(), "${name}".into()];
        exec.register_template(tpl).unwrap();
        assert_eq!(exec.list_templates(), vec!["greet".to_string()]);

        let mut params = StringMap::new();
        params.insert("name".into(), "world".into());
        let id = exec.execute_template("greet", 2, &params);
        assert_eq!(exec.get_result(&id).unwrap().stdout, "hello world\n");
        assert_eq!(exec.execute_template("missing", 2, &params), "");
        assert!(exec.unregister_template("greet"));
        assert!(exec.get_template("greet").is_none());
    }

    #[test]
    fn test_spawn_failure_reports_internal_exit() {
        let (exec, _) = executor(ExecutorConfig::default());
        // Passes validation but fails chdir in the child
        let id = exec.execute_sync(
            CommandBuilder::new("/bin/true")
                .working_dir("/tmp/procwarden-missing-dir-for-test")
                .build(),
        );
        assert_eq!(id, "");
        let history = exec.history();
        assert_eq!(history.failed, 1);
        assert_eq!(history.by_exit_code.get(&EXIT_INTERNAL_FAILURE), Some(&1));
    }
}
