/// Core types and structures shared by every procwarden subsystem
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Opaque identifier of the logical connection a process or command belongs to.
/// `-1` is reserved for global (connection-less) events.
pub type ConnectionId = i32;

/// Connection id used for events that are not scoped to any connection
pub const GLOBAL_CONNECTION: ConnectionId = -1;

/// Exit code reported while a process is still running
pub const EXIT_PENDING: i32 = -1000;

/// Exit code reported for an unknown connection or request id
pub const EXIT_NOT_FOUND: i32 = -1001;

/// Exit code for spawn failures and security rejections
pub const EXIT_INTERNAL_FAILURE: i32 = -1002;

/// Exit code for processes terminated by the wall-clock timeout
pub const EXIT_TIMEOUT: i32 = -libc::ETIMEDOUT;

/// Caller-visible classification of an exit code.
///
/// Normal exits, signal terminations and internal failures are encoded in a
/// single `i32` so they can travel through callback layers untouched; this
/// enum recovers the class on the receiving side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitClass {
    /// Exit status 0
    Success,
    /// Non-zero exit status from `exit(2)`
    Exited(i32),
    /// Terminated by the contained signal number
    Signaled(i32),
    /// Killed by the supervisor after its timeout expired
    Timeout,
    /// Spawn failure, security rejection or other supervisor-side error
    InternalFailure,
    /// Still running
    Pending,
    /// No such process or request
    NotFound,
}

impl ExitClass {
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => ExitClass::Success,
            c if c > 0 => ExitClass::Exited(c),
            EXIT_TIMEOUT => ExitClass::Timeout,
            EXIT_PENDING => ExitClass::Pending,
            EXIT_NOT_FOUND => ExitClass::NotFound,
            EXIT_INTERNAL_FAILURE => ExitClass::InternalFailure,
            c if (-64..0).contains(&c) => ExitClass::Signaled(-c),
            _ => ExitClass::InternalFailure,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExitClass::Success)
    }
}

impl std::fmt::Display for ExitClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitClass::Success => write!(f, "success"),
            ExitClass::Exited(code) => write!(f, "exited({})", code),
            ExitClass::Signaled(sig) => write!(f, "signaled({})", sig),
            ExitClass::Timeout => write!(f, "timeout"),
            ExitClass::InternalFailure => write!(f, "internal-failure"),
            ExitClass::Pending => write!(f, "pending"),
            ExitClass::NotFound => write!(f, "not-found"),
        }
    }
}

/// Security policy applied to one spawned process
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SecurityContext {
    /// Enforce command allow/block lists and input sanitisation
    pub sandbox_enabled: bool,
    /// Commands (absolute paths) permitted to run; empty means any command not blocked
    pub allowed_commands: Vec<String>,
    /// Commands that are always rejected
    pub blocked_commands: Vec<String>,
    /// Path prefixes the working directory may live under; empty means unrestricted
    pub allowed_paths: Vec<String>,
    /// Path prefixes the working directory must never live under
    pub blocked_paths: Vec<String>,
    /// Target uid for privilege drop (0 leaves uid unchanged)
    pub uid: u32,
    /// Target gid for privilege drop (0 leaves gid unchanged)
    pub gid: u32,
    /// Drop to `uid`/`gid` in the child before exec
    pub drop_privileges: bool,
    /// Address space limit in bytes
    pub max_memory: u64,
    /// CPU time limit in seconds
    pub max_cpu_time: u64,
    /// RLIMIT_NPROC for the child. The kernel counts every process and
    /// thread of the child's real uid against it, not just the child's
    /// descendants, so this is a per-user ceiling. 0 leaves it unset.
    pub max_processes: u64,
    /// Open file descriptor limit
    pub max_open_files: u64,
}

impl Default for SecurityContext {
    fn default() -> Self {
        Self {
            sandbox_enabled: true,
            allowed_commands: Vec::new(),
            blocked_commands: Vec::new(),
            allowed_paths: Vec::new(),
            blocked_paths: Vec::new(),
            uid: 0,
            gid: 0,
            drop_privileges: true,
            max_memory: 100 * 1024 * 1024, // 100MB
            max_cpu_time: 30,              // 30 seconds
            max_processes: 0,
            max_open_files: 64,
        }
    }
}

/// Stdio stream selector
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StreamType {
    #[serde(rename = "stdin")]
    Stdin,
    #[serde(rename = "stdout")]
    Stdout,
    #[serde(rename = "stderr")]
    Stderr,
}

impl StreamType {
    /// Descriptor number the stream occupies in the child
    pub fn target_fd(&self) -> i32 {
        match self {
            StreamType::Stdin => libc::STDIN_FILENO,
            StreamType::Stdout => libc::STDOUT_FILENO,
            StreamType::Stderr => libc::STDERR_FILENO,
        }
    }

    pub fn all() -> [StreamType; 3] {
        [StreamType::Stdin, StreamType::Stdout, StreamType::Stderr]
    }
}

impl std::fmt::Display for StreamType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamType::Stdin => write!(f, "stdin"),
            StreamType::Stdout => write!(f, "stdout"),
            StreamType::Stderr => write!(f, "stderr"),
        }
    }
}

/// ProcessManager tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessManagerConfig {
    /// Global ceiling on concurrently tracked processes
    pub max_processes: usize,
    /// Timeout applied when a process record does not carry one (seconds)
    pub default_timeout_secs: u64,
    /// Read buffer size for stdout/stderr accessors
    pub buffer_size: usize,
    /// Reaper cadence when nobody is waiting (milliseconds)
    pub monitor_interval_ms: u64,
    /// Reaper cadence while waiters or kill escalations are pending (milliseconds)
    pub fast_monitor_interval_ms: u64,
    /// Delay between SIGTERM and SIGKILL during teardown and timeout escalation
    pub termination_grace_ms: u64,
}

impl Default for ProcessManagerConfig {
    fn default() -> Self {
        Self {
            max_processes: 100,
            default_timeout_secs: 30,
            buffer_size: 4096,
            monitor_interval_ms: 1000, // ~1s reaper cadence
            fast_monitor_interval_ms: 20,
            termination_grace_ms: 100,
        }
    }
}

/// CommandExecutor tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Upper bound on concurrently running commands
    pub max_concurrent: usize,
    /// Bounded FIFO capacity; submissions beyond it are rejected
    pub max_queue_size: usize,
    /// Number of results retained before oldest-first eviction
    pub max_history_size: usize,
    /// Extra entries evicted beyond the overage
    pub history_eviction_slack: usize,
    /// Worker thread count; 0 derives min(max_concurrent, 4)
    pub worker_threads: usize,
    /// Smallest accepted request timeout (seconds)
    pub min_timeout_secs: u64,
    /// Largest accepted request timeout (seconds)
    pub max_timeout_secs: u64,
    /// Per-stream capture cap in bytes
    pub max_output_bytes: usize,
    /// Security policy used when a request does not override it
    pub default_security: SecurityContext,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_queue_size: 100,
            max_history_size: 1000,
            history_eviction_slack: 10,
            worker_threads: 0,
            min_timeout_secs: 1,
            max_timeout_secs: 3600,
            max_output_bytes: 16 * 1024 * 1024, // 16MB per stream
            default_security: SecurityContext::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads > 0 {
            self.worker_threads
        } else {
            self.max_concurrent.clamp(1, 4)
        }
    }
}

/// ResourceManager tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceManagerConfig {
    /// Default sampling interval for newly configured connections
    pub monitor_interval_ms: u64,
    /// Usage samples retained per connection
    pub history_size: usize,
    /// SIGTERM to SIGKILL grace for the terminate action
    pub terminate_grace_ms: u64,
}

impl Default for ResourceManagerConfig {
    fn default() -> Self {
        Self {
            monitor_interval_ms: 1000,
            history_size: 100,
            terminate_grace_ms: 5000,
        }
    }
}

/// Async event bus tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct EventConfig {
    /// Global pending queue capacity
    pub max_pending_events: usize,
    /// Per-connection queue capacity
    pub max_connection_events: usize,
    /// Events older than this are discarded by `cleanup_old_events`
    pub max_event_age_secs: u64,
    /// Timeout suggested to idle pollers (milliseconds)
    pub idle_timeout_ms: u64,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            max_pending_events: 500,
            max_connection_events: 100,
            max_event_age_secs: 60,
            idle_timeout_ms: 100,
        }
    }
}

/// File watch tuning
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct FileMonitorConfig {
    /// Maximum distinct kernel watches
    pub max_watches: usize,
    /// Events parsed per drain
    pub max_events_per_drain: usize,
    /// Per-connection FileEvent queue capacity
    pub max_connection_events: usize,
    /// Prefixes a watch target must live under
    pub safe_prefixes: Vec<String>,
}

impl Default for FileMonitorConfig {
    fn default() -> Self {
        Self {
            max_watches: 1000,
            max_events_per_drain: 100,
            max_connection_events: 1000,
            safe_prefixes: vec![
                "/tmp".to_string(),
                "/var/tmp".to_string(),
                "/home".to_string(),
                "/usr/local".to_string(),
            ],
        }
    }
}

/// Aggregate configuration handed to `Supervisor::init`
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub process: ProcessManagerConfig,
    pub executor: ExecutorConfig,
    pub resources: ResourceManagerConfig,
    pub events: EventConfig,
    pub files: FileMonitorConfig,
    /// JSON-lines audit log destination; `None` logs through `log` only
    pub audit_log_path: Option<String>,
}

impl SupervisorConfig {
    /// Load a configuration from a JSON file; missing fields take their defaults
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| {
            SupervisorError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }
}

/// Result type for procwarden operations
pub type Result<T> = std::result::Result<T, SupervisorError>;

/// Error types for procwarden
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Security violation: {0}")]
    Security(String),

    #[error("Spawn error: {0}")]
    Spawn(String),

    #[error("Process error: {0}")]
    Process(String),

    #[error("Resource limit error: {0}")]
    ResourceLimit(String),

    #[error("Redirection error: {0}")]
    Redirect(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Event error: {0}")]
    Event(String),

    #[error("Watch error: {0}")]
    Watch(String),
}

impl From<nix::errno::Errno> for SupervisorError {
    fn from(err: nix::errno::Errno) -> Self {
        SupervisorError::Process(err.to_string())
    }
}

/// Small string map used for environments and template parameters
pub type StringMap = HashMap<String, String>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_classes_are_distinct() {
        assert_eq!(ExitClass::from_code(0), ExitClass::Success);
        assert_eq!(ExitClass::from_code(3), ExitClass::Exited(3));
        assert_eq!(ExitClass::from_code(-9), ExitClass::Signaled(9));
        assert_eq!(ExitClass::from_code(-1), ExitClass::Signaled(1));
        assert_eq!(ExitClass::from_code(EXIT_TIMEOUT), ExitClass::Timeout);
        assert_eq!(
            ExitClass::from_code(EXIT_INTERNAL_FAILURE),
            ExitClass::InternalFailure
        );
        assert_eq!(ExitClass::from_code(EXIT_NOT_FOUND), ExitClass::NotFound);
        assert_eq!(ExitClass::from_code(EXIT_PENDING), ExitClass::Pending);
    }

    #[test]
    fn test_security_context_defaults() {
        let ctx = SecurityContext::default();
        assert!(ctx.sandbox_enabled);
        assert!(ctx.drop_privileges);
        assert_eq!(ctx.max_memory, 100 * 1024 * 1024);
        assert_eq!(ctx.max_cpu_time, 30);
        assert_eq!(ctx.max_processes, 0);
        assert_eq!(ctx.max_open_files, 64);
    }

    #[test]
    fn test_executor_worker_derivation() {
        let mut config = ExecutorConfig::default();
        assert_eq!(config.effective_workers(), 4);
        config.max_concurrent = 2;
        assert_eq!(config.effective_workers(), 2);
        config.worker_threads = 7;
        assert_eq!(config.effective_workers(), 7);
    }

    #[test]
    fn test_partial_json_config_uses_defaults() {
        let config: SupervisorConfig =
            serde_json::from_str(r#"{"executor": {"max_queue_size": 5}}"#).unwrap();
        assert_eq!(config.executor.max_queue_size, 5);
        assert_eq!(config.executor.max_history_size, 1000);
        assert_eq!(config.process.max_processes, 100);
        assert_eq!(config.events.max_pending_events, 500);
    }
}
