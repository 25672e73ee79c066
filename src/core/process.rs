//! ProcessManager: spawn, reaping, timeouts and stdio access for one
//! process per connection.
//!
//! The table is the single owner of pids and parent-side pipe ends. One
//! reaper thread polls every tracked pid with `waitpid(WNOHANG)`, enforces
//! wall-clock timeouts (SIGTERM, then SIGKILL after the grace period) and
//! notifies `wait_for_exit` callers through a condition variable.

use crate::config::types::{
    ConnectionId, ProcessManagerConfig, Result, SecurityContext, SupervisorError, EXIT_INTERNAL_FAILURE,
    EXIT_NOT_FOUND, EXIT_PENDING, EXIT_TIMEOUT,
};
use crate::core::types::ExternalProcessInfo;
use crate::events::notifier::{AsyncEventType, EventNotifier};
use crate::io::redirector::{IORedirector, IoResult};
use crate::kernel::child::{read_child_status, ChildOptions, ChildSpec, ChildStage};
use crate::kernel::fd;
use crate::kernel::rlimit::RlimitSetting;
use crate::kernel::signal::{self, KillReport};
use crate::observability::audit::{SecurityEvent, SecurityEventType};
use crate::observability::metrics::SupervisorMetrics;
use crate::resource::manager::ResourceManager;
use crate::runtime::security::ProcessSecurityManager;
use crate::utils::command::{format_command, resolve_command};
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::collections::{HashMap, HashSet};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

fn spawn_error(prefix: &str, err: impl std::fmt::Display) -> SupervisorError {
    SupervisorError::Spawn(format!("{prefix}: {err}"))
}

/// Table entry: the public record plus the descriptors it owns
#[derive(Debug)]
struct ProcessRecord {
    info: ExternalProcessInfo,
    stdin: Option<OwnedFd>,
    stdout: Option<OwnedFd>,
    stderr: Option<OwnedFd>,
    merge_stderr: bool,
    started: Instant,
    timeout: Duration,
    term_sent_at: Option<Instant>,
    kill_sent: bool,
}

impl ProcessRecord {
    fn fd_of(&self, which: Stdio) -> Option<RawFd> {
        match which {
            Stdio::In => self.stdin.as_ref().map(|f| f.as_raw_fd()),
            Stdio::Out => self.stdout.as_ref().map(|f| f.as_raw_fd()),
            Stdio::Err if self.merge_stderr => self.stdout.as_ref().map(|f| f.as_raw_fd()),
            Stdio::Err => self.stderr.as_ref().map(|f| f.as_raw_fd()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stdio {
    In,
    Out,
    Err,
}

impl Stdio {
    fn as_str(&self) -> &'static str {
        match self {
            Stdio::In => "stdin",
            Stdio::Out => "stdout",
            Stdio::Err => "stderr",
        }
    }
}

#[derive(Debug)]
enum ReaperMsg {
    Wake,
    Shutdown,
}

/// A forked child that is killed and reaped unless `disarm`ed
struct ForkedChild {
    pid: Pid,
    armed: bool,
}

impl ForkedChild {
    fn disarm(mut self) -> i32 {
        self.armed = false;
        self.pid.as_raw()
    }
}

impl Drop for ForkedChild {
    fn drop(&mut self) {
        if self.armed {
            let _ = nix::sys::signal::kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
        }
    }
}

/// Connection reserved between the admission check and the table insert
struct SpawnReservation<'a> {
    pending: &'a Mutex<HashSet<ConnectionId>>,
    conn: ConnectionId,
}

impl Drop for SpawnReservation<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&self.conn);
    }
}

/// Exit outcome found by one reaper pass
struct Exit {
    conn: ConnectionId,
    pid: i32,
    code: i32,
    timed_out: bool,
}

#[derive(Debug)]
struct Inner {
    config: ProcessManagerConfig,
    table: Mutex<HashMap<ConnectionId, ProcessRecord>>,
    /// Spawns in flight; always locked after `table`
    pending: Mutex<HashSet<ConnectionId>>,
    exited: Condvar,
    waiters: AtomicUsize,
    security: Arc<ProcessSecurityManager>,
    redirector: Arc<IORedirector>,
    resources: Arc<ResourceManager>,
    events: Arc<EventNotifier>,
    metrics: Arc<SupervisorMetrics>,
}

#[derive(Debug)]
pub struct ProcessManager {
    inner: Arc<Inner>,
    reaper_tx: Sender<ReaperMsg>,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl ProcessManager {
    /// Create the manager and start its reaper thread
    pub fn new(
        config: ProcessManagerConfig,
        security: Arc<ProcessSecurityManager>,
        redirector: Arc<IORedirector>,
        resources: Arc<ResourceManager>,
        events: Arc<EventNotifier>,
        metrics: Arc<SupervisorMetrics>,
    ) -> Result<Self> {
        let inner = Arc::new(Inner {
            config,
            table: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashSet::new()),
            exited: Condvar::new(),
            waiters: AtomicUsize::new(0),
            security,
            redirector,
            resources,
            events,
            metrics,
        });

        let (reaper_tx, reaper_rx) = unbounded::<ReaperMsg>();
        let reaper_inner = Arc::clone(&inner);
        let handle = std::thread::Builder::new()
            .name("procwarden-reaper".to_string())
            .spawn(move || {
                let mut fast = false;
                loop {
                    let interval = if fast || reaper_inner.waiters.load(Ordering::SeqCst) > 0 {
                        reaper_inner.config.fast_monitor_interval_ms
                    } else {
                        reaper_inner.config.monitor_interval_ms
                    };
                    match reaper_rx.recv_timeout(Duration::from_millis(interval.max(1))) {
                        Ok(ReaperMsg::Wake) | Err(RecvTimeoutError::Timeout) => {}
                        Ok(ReaperMsg::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    fast = reaper_inner.reap_once();
                }
                debug!("Reaper thread stopped");
            })
            .map_err(|e| spawn_error("reaper thread", e))?;

        info!(
            "Process manager started (max {} processes, {}ms reaper interval)",
            inner.config.max_processes, inner.config.monitor_interval_ms
        );
        Ok(Self {
            inner,
            reaper_tx,
            reaper: Mutex::new(Some(handle)),
        })
    }

    fn wake_reaper(&self) {
        let _ = self.reaper_tx.send(ReaperMsg::Wake);
    }

    fn table(&self) -> std::sync::MutexGuard<'_, HashMap<ConnectionId, ProcessRecord>> {
        self.inner.table.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Spawn `info` for `conn`. On failure `info.error_message` says why
    /// and `info.exit_code` is `EXIT_INTERNAL_FAILURE`.
    pub fn spawn(
        &self,
        conn: ConnectionId,
        info: &mut ExternalProcessInfo,
        security: &SecurityContext,
    ) -> bool {
        info.connection_id = conn;
        match self.try_spawn(conn, info, security) {
            Ok(pid) => {
                info!(
                    "Spawned pid {} for connection {}: {}",
                    pid,
                    conn,
                    format_command(&info.command, &info.args)
                );
                self.inner.metrics.processes_spawned.inc();

                if let Err(e) = self.inner.redirector.apply(conn, pid) {
                    warn!("Recording I/O configuration for pid {} failed: {}", pid, e);
                }
                if let Err(e) = self.inner.resources.apply(conn, pid) {
                    warn!("Applying resource policy to pid {} failed: {}", pid, e);
                }
                self.inner.notify(conn, AsyncEventType::ProcessReady, pid as u64, None);
                self.wake_reaper();
                true
            }
            Err(e) => {
                info.error_message = match e {
                    SupervisorError::Spawn(msg) => msg,
                    other => other.to_string(),
                };
                info.running = false;
                info.pid = -1;
                info.exit_code = EXIT_INTERNAL_FAILURE;
                self.inner.metrics.spawn_failures.inc();
                warn!("Spawn for connection {} failed: {}", conn, info.error_message);
                false
            }
        }
    }

    fn try_spawn(
        &self,
        conn: ConnectionId,
        info: &mut ExternalProcessInfo,
        security: &SecurityContext,
    ) -> Result<i32> {
        if info.command.trim().is_empty() {
            return Err(SupervisorError::Spawn("Empty command".to_string()));
        }

        let _reservation = {
            let mut table = self.table();
            let mut pending = self.inner.pending.lock().unwrap_or_else(|p| p.into_inner());
            if pending.contains(&conn) {
                return Err(SupervisorError::Spawn(format!(
                    "Connection {} already has a spawn in progress",
                    conn
                )));
            }
            if let Some(existing) = table.get(&conn) {
                if existing.info.running {
                    return Err(SupervisorError::Spawn(format!(
                        "Connection {} already has a running process (pid {})",
                        conn, existing.info.pid
                    )));
                }
                // A finished record is replaced by the new spawn
                table.remove(&conn);
            }
            let running = table.values().filter(|r| r.info.running).count();
            if running + pending.len() >= self.inner.config.max_processes {
                return Err(SupervisorError::Spawn("Process limit exceeded".to_string()));
            }
            pending.insert(conn);
            SpawnReservation {
                pending: &self.inner.pending,
                conn,
            }
        };

        self.inner
            .security
            .validate_process(
                conn,
                &info.command,
                &info.args,
                &info.env,
                &info.working_dir,
                security,
            )
            .map_err(|e| spawn_error("Security validation failed", e))?;

        let program = resolve_command(&info.command)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| info.command.clone());

        let stdio = self
            .inner
            .redirector
            .prepare(conn)
            .map_err(|e| spawn_error("Failed to setup I/O pipes", e))?;
        let (status_read, status_write) =
            fd::cloexec_pipe().map_err(|e| spawn_error("Failed to setup I/O pipes", e))?;

        let plan = self.inner.resources.child_plan(conn);
        let identity = self.inner.security.identity_plan(security);
        let options = ChildOptions {
            stdio: stdio.child_fds(),
            merge_stderr: stdio.merge_stderr,
            chroot_dir: plan.chroot,
            working_dir: (!info.working_dir.is_empty()).then(|| info.working_dir.clone()),
            rlimits: merge_rlimits(self.inner.security.child_rlimits(security), plan.rlimits),
            no_new_privs: plan.no_new_privs,
            uid: identity.uid,
            gid: identity.gid,
        };
        let env: Vec<(String, String)> = if info.env.is_empty() {
            std::env::vars().collect()
        } else {
            info.env.clone()
        };
        let spec = ChildSpec::new(&program, &info.args, &env, &options, status_write.as_raw_fd())
            .map_err(|e| spawn_error("exec failed", e))?;

        // SAFETY: the child only runs `ChildSpec::exec`, which issues
        // async-signal-safe syscalls on memory prepared before fork.
        let child = match unsafe { fork() } {
            Ok(ForkResult::Child) => spec.exec(),
            Ok(ForkResult::Parent { child }) => ForkedChild {
                pid: child,
                armed: true,
            },
            Err(e) => return Err(spawn_error("fork() failed", e)),
        };
        drop(status_write);
        drop(spec);
        let [stdin, stdout, stderr] = stdio.into_parent();
        let merge_stderr = options.merge_stderr;

        match read_child_status(status_read.as_raw_fd()) {
            Ok(None) => {}
            Ok(Some(failure)) => {
                let msg = if failure.stage == ChildStage::Exec {
                    std::io::Error::from_raw_os_error(failure.errno).to_string()
                } else {
                    failure.to_string()
                };
                if failure.stage == ChildStage::Setuid || failure.stage == ChildStage::Setgid {
                    self.inner.security.audit().record(
                        SecurityEvent::new(SecurityEventType::PrivilegeDropFailed, failure.to_string())
                            .with_connection(conn)
                            .with_command(info.command.clone()),
                    );
                }
                return Err(spawn_error("exec failed", msg));
            }
            Err(e) => return Err(spawn_error("exec failed", e)),
        }
        let pid = child.disarm();

        let timeout_secs = if info.timeout_seconds > 0 {
            info.timeout_seconds
        } else {
            self.inner.config.default_timeout_secs
        };
        info.pid = pid;
        info.running = true;
        info.timed_out = false;
        info.exit_code = EXIT_PENDING;
        info.error_message.clear();
        info.timeout_seconds = timeout_secs;
        info.start_time = Some(SystemTime::now());
        info.end_time = None;
        info.stdin_fd = fd::raw_or_invalid(&stdin);
        info.stdout_fd = fd::raw_or_invalid(&stdout);
        info.stderr_fd = fd::raw_or_invalid(&stderr);

        let record = ProcessRecord {
            info: info.clone(),
            stdin,
            stdout,
            stderr,
            merge_stderr,
            started: Instant::now(),
            timeout: Duration::from_secs(timeout_secs),
            term_sent_at: None,
            kill_sent: false,
        };
        // Counted before the reaper can see the record
        self.inner.metrics.processes_running.inc();
        self.table().insert(conn, record);
        Ok(pid)
    }

    /// Send `sig` to the process of `conn`; false if there is none
    pub fn terminate(&self, conn: ConnectionId, sig: Signal) -> bool {
        let pid = match self.table().get(&conn) {
            Some(record) if record.info.running => record.info.pid,
            _ => return false,
        };
        match signal::send_signal(pid, sig) {
            Ok(sent) => {
                if sent {
                    debug!("Sent {:?} to pid {} (connection {})", sig, pid, conn);
                    self.wake_reaper();
                }
                sent
            }
            Err(e) => {
                error!("Signalling pid {} of connection {} failed: {}", pid, conn, e);
                false
            }
        }
    }

    pub fn kill(&self, conn: ConnectionId) -> bool {
        self.terminate(conn, Signal::SIGKILL)
    }

    pub fn is_running(&self, conn: ConnectionId) -> bool {
        self.table().get(&conn).map_or(false, |r| r.info.running)
    }

    /// Exit code, `EXIT_PENDING` while running, `EXIT_NOT_FOUND` without a record
    pub fn exit_code(&self, conn: ConnectionId) -> i32 {
        match self.table().get(&conn) {
            Some(record) if record.info.running => EXIT_PENDING,
            Some(record) => record.info.exit_code,
            None => EXIT_NOT_FOUND,
        }
    }

    pub fn write_stdin(&self, conn: ConnectionId, data: &[u8]) -> IoResult {
        self.stream_io(conn, Stdio::In, |redirector, fd| {
            redirector.write_nonblocking(conn, fd, data)
        })
    }

    pub fn read_stdout(&self, conn: ConnectionId, buf: &mut [u8]) -> IoResult {
        self.stream_io(conn, Stdio::Out, |redirector, fd| {
            redirector.read_nonblocking(conn, fd, buf)
        })
    }

    /// Reads stdout when stderr is merged into it
    pub fn read_stderr(&self, conn: ConnectionId, buf: &mut [u8]) -> IoResult {
        self.stream_io(conn, Stdio::Err, |redirector, fd| {
            redirector.read_nonblocking(conn, fd, buf)
        })
    }

    fn stream_io<F>(&self, conn: ConnectionId, which: Stdio, op: F) -> IoResult
    where
        F: FnOnce(&IORedirector, RawFd) -> IoResult,
    {
        // The table lock is held across the call so cleanup cannot close
        // the descriptor underneath us; the I/O itself never blocks.
        let result = {
            let table = self.table();
            let Some(record) = table.get(&conn) else {
                return IoResult::error(format!("no process for connection {}", conn));
            };
            let Some(fd) = record.fd_of(which) else {
                return IoResult::error(format!("{} is not a pipe", which.as_str()));
            };
            op(&self.inner.redirector, fd)
        };

        if which != Stdio::In && result.success && result.bytes_processed > 0 {
            self.inner.notify(
                conn,
                AsyncEventType::ProcessOutput,
                result.bytes_processed as u64,
                Some(which.as_str().to_string()),
            );
        } else if let Some(ref err) = result.error {
            if err != "pipe closed" {
                self.inner.notify(conn, AsyncEventType::ProcessError, 0, Some(err.clone()));
            }
        }
        result
    }

    /// Close the parent's stdin end so the child sees EOF
    pub fn close_stdin(&self, conn: ConnectionId) -> bool {
        let mut table = self.table();
        match table.get_mut(&conn) {
            Some(record) => {
                let closed = record.stdin.take().is_some();
                record.info.stdin_fd = -1;
                closed
            }
            None => false,
        }
    }

    /// Block until the process of `conn` exits or `timeout` passes.
    ///
    /// Returns the exit code, `EXIT_PENDING` on timeout or `EXIT_NOT_FOUND`.
    pub fn wait_for_exit(&self, conn: ConnectionId, timeout: Duration) -> i32 {
        let deadline = Instant::now() + timeout;
        // The first waiter switches the reaper to its fast cadence
        if self.inner.waiters.fetch_add(1, Ordering::SeqCst) == 0 {
            self.wake_reaper();
        }

        let mut table = self.table();
        let code = loop {
            match table.get(&conn) {
                None => break EXIT_NOT_FOUND,
                Some(record) if !record.info.running => break record.info.exit_code,
                Some(_) => {}
            }
            let now = Instant::now();
            if now >= deadline {
                break EXIT_PENDING;
            }
            table = match self.inner.exited.wait_timeout(table, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        };
        drop(table);
        self.inner.waiters.fetch_sub(1, Ordering::SeqCst);
        code
    }

    pub fn process_info(&self, conn: ConnectionId) -> Option<ExternalProcessInfo> {
        self.table().get(&conn).map(|r| r.info.clone())
    }

    /// Tracked records, running or finished but not yet cleaned up
    pub fn process_count(&self) -> usize {
        self.table().len()
    }

    pub fn running_count(&self) -> usize {
        self.table().values().filter(|r| r.info.running).count()
    }

    /// Connections with a running process
    pub fn active_connections(&self) -> Vec<ConnectionId> {
        let mut conns: Vec<_> = self
            .table()
            .iter()
            .filter(|(_, r)| r.info.running)
            .map(|(c, _)| *c)
            .collect();
        conns.sort_unstable();
        conns
    }

    /// Drop the record of `conn`, terminating the process if it still runs.
    /// A second call is a no-op.
    pub fn cleanup(&self, conn: ConnectionId) {
        let Some(record) = self.table().remove(&conn) else {
            return;
        };
        if record.info.running {
            let pid = record.info.pid;
            let grace = Duration::from_millis(self.inner.config.termination_grace_ms);
            let report = reap_gracefully(pid, grace);
            if report.kill_sent {
                debug!("Cleanup of connection {} needed SIGKILL for pid {}", conn, pid);
            }
            self.inner.metrics.processes_running.dec();
            self.inner.exited.notify_all();
        }
        self.inner.resources.stop_monitoring(conn);
        debug!("Cleaned up process record of connection {}", conn);
    }

    /// Stop the reaper and clean up every tracked process. Idempotent.
    pub fn shutdown(&self) {
        let handle = self
            .reaper
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take();
        let Some(handle) = handle else {
            return;
        };
        let _ = self.reaper_tx.send(ReaperMsg::Shutdown);
        if handle.join().is_err() {
            error!("Reaper thread panicked");
        }

        let conns: Vec<ConnectionId> = self.table().keys().copied().collect();
        for conn in conns {
            self.cleanup(conn);
        }
        info!("Process manager shut down");
    }
}

impl Drop for ProcessManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn notify(
        &self,
        conn: ConnectionId,
        event_type: AsyncEventType,
        value: u64,
        data: Option<String>,
    ) {
        if !self.events.is_registered(conn) {
            return;
        }
        let result = match data {
            Some(data) => self.events.signal_with_data(conn, event_type, value, data),
            None => self.events.signal_for_connection(conn, event_type, value),
        };
        if let Err(e) = result {
            debug!("{} event for connection {} not delivered: {}", event_type, conn, e);
        }
    }

    /// One pass over the table. Returns true while kill escalations are pending.
    fn reap_once(&self) -> bool {
        let grace = Duration::from_millis(self.config.termination_grace_ms);
        let mut exits = Vec::new();
        let mut timeouts = Vec::new();
        let mut escalating = false;

        {
            let mut table = self.table.lock().unwrap_or_else(|p| p.into_inner());
            for (conn, record) in table.iter_mut() {
                if !record.info.running {
                    continue;
                }
                let pid = record.info.pid;
                let code = match waitpid(Pid::from_raw(pid), Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::Exited(_, code)) => Some(code),
                    Ok(WaitStatus::Signaled(_, sig, _)) => Some(-(sig as i32)),
                    Ok(_) | Err(Errno::EINTR) => None,
                    Err(e) => {
                        // ECHILD: reaped elsewhere; nothing left to wait for
                        record.info.error_message = format!("waitpid failed: {}", e);
                        Some(EXIT_INTERNAL_FAILURE)
                    }
                };

                if let Some(code) = code {
                    let code = if record.info.timed_out { EXIT_TIMEOUT } else { code };
                    record.info.running = false;
                    record.info.exit_code = code;
                    record.info.end_time = Some(SystemTime::now());
                    exits.push(Exit {
                        conn: *conn,
                        pid,
                        code,
                        timed_out: record.info.timed_out,
                    });
                    continue;
                }

                match record.term_sent_at {
                    None if record.started.elapsed() >= record.timeout => {
                        record.info.timed_out = true;
                        record.info.error_message = "Process timed out".to_string();
                        record.term_sent_at = Some(Instant::now());
                        // A stopped process cannot act on SIGTERM
                        let _ = signal::continue_process(pid);
                        if let Err(e) = signal::send_signal(pid, Signal::SIGTERM) {
                            warn!("SIGTERM to timed out pid {} failed: {}", pid, e);
                        }
                        timeouts.push((*conn, pid, record.timeout));
                        escalating = true;
                    }
                    Some(sent_at) if !record.kill_sent => {
                        if sent_at.elapsed() >= grace {
                            record.kill_sent = true;
                            match signal::send_signal(pid, Signal::SIGKILL) {
                                Ok(_) => info!("Escalated to SIGKILL for timed out pid {}", pid),
                                Err(e) => warn!("SIGKILL to pid {} failed: {}", pid, e),
                            }
                        }
                        escalating = true;
                    }
                    Some(_) => escalating = true,
                    None => {}
                }
            }
        }

        for (conn, pid, timeout) in timeouts {
            warn!(
                "Process {} of connection {} exceeded its {:?} timeout",
                pid, conn, timeout
            );
            self.metrics.processes_timed_out.inc();
            self.security.audit().record(
                SecurityEvent::new(
                    SecurityEventType::ProcessTimedOut,
                    format!("timeout after {:?}", timeout),
                )
                .with_connection(conn)
                .with_pid(pid),
            );
        }

        if !exits.is_empty() {
            self.exited.notify_all();
        }
        for exit in exits {
            self.metrics.processes_running.dec();
            if exit.timed_out {
                info!("Timed out pid {} of connection {} reaped", exit.pid, exit.conn);
            } else {
                info!(
                    "Process {} of connection {} exited with {}",
                    exit.pid, exit.conn, exit.code
                );
            }
            self.resources.stop_monitoring(exit.conn);
            self.notify(
                exit.conn,
                AsyncEventType::ProcessExited,
                exit.pid as u64,
                Some(exit.code.to_string()),
            );
        }
        escalating
    }
}

/// Combine rlimit lists, keeping the lowest value per resource. Lowering a
/// hard limit and raising it again fails without privilege, so duplicates
/// must not be applied one after another.
fn merge_rlimits(first: Vec<RlimitSetting>, second: Vec<RlimitSetting>) -> Vec<RlimitSetting> {
    let mut merged: Vec<RlimitSetting> = Vec::new();
    for setting in first.into_iter().chain(second) {
        match merged.iter_mut().find(|s| s.resource == setting.resource) {
            Some(existing) => {
                existing.soft = existing.soft.min(setting.soft);
                existing.hard = existing.hard.min(setting.hard);
            }
            None => merged.push(setting),
        }
    }
    merged
}

/// SIGTERM, wait up to `grace`, then SIGKILL, reaping our own child
fn reap_gracefully(pid: i32, grace: Duration) -> KillReport {
    let target = Pid::from_raw(pid);
    let mut reaped = false;
    let report = signal::terminate_gracefully(pid, grace, Duration::from_millis(5), || {
        if reaped {
            return false;
        }
        match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(_) => {
                reaped = true;
                false
            }
            Err(Errno::ECHILD) => false,
            Err(_) => signal::is_alive(pid),
        }
    });
    if report.kill_sent && !reaped {
        let _ = waitpid(target, None);
    }
    report
}

/// Terminate any pid: SIGTERM, poll for `timeout`, then SIGKILL.
///
/// Children of this process are reaped; for other pids liveness is probed
/// with signal 0.
pub fn terminate_process_gracefully(pid: i32, timeout: Duration) -> KillReport {
    let target = Pid::from_raw(pid);
    signal::terminate_gracefully(pid, timeout, Duration::from_millis(10), || {
        match waitpid(target, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => true,
            Ok(_) => false,
            Err(Errno::ECHILD) => signal::is_alive(pid),
            Err(_) => false,
        }
    })
}
