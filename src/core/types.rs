use crate::config::types::{ConnectionId, EXIT_PENDING};
use serde::{Deserialize, Serialize};
use std::os::fd::RawFd;
use std::time::{Duration, SystemTime};

/// Live process record and spawn request in one.
///
/// Callers fill in command, args, env, working directory and timeout and
/// hand it to `ProcessManager::spawn`, which fills in pid, descriptors and
/// timestamps (or `error_message` on failure). Snapshots returned by
/// `process_info` carry the current running state and exit code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExternalProcessInfo {
    pub pid: i32,
    pub connection_id: ConnectionId,
    pub command: String,
    pub args: Vec<String>,
    /// Empty inherits the supervisor's environment
    pub env: Vec<(String, String)>,
    pub working_dir: String,
    /// Wall-clock limit; 0 takes the manager's default
    pub timeout_seconds: u64,
    pub running: bool,
    pub exit_code: i32,
    pub timed_out: bool,
    pub error_message: String,
    /// Parent-side descriptors, -1 when the stream is not a pipe
    pub stdin_fd: RawFd,
    pub stdout_fd: RawFd,
    pub stderr_fd: RawFd,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,
}

impl Default for ExternalProcessInfo {
    fn default() -> Self {
        Self {
            pid: -1,
            connection_id: -1,
            command: String::new(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: String::new(),
            timeout_seconds: 0,
            running: false,
            exit_code: EXIT_PENDING,
            timed_out: false,
            error_message: String::new(),
            stdin_fd: -1,
            stdout_fd: -1,
            stderr_fd: -1,
            start_time: None,
            end_time: None,
        }
    }
}

impl ExternalProcessInfo {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Wall time between spawn and exit, or until now while running
    pub fn elapsed(&self) -> Option<Duration> {
        let start = self.start_time?;
        let end = self.end_time.unwrap_or_else(SystemTime::now);
        Some(end.duration_since(start).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_unspawned() {
        let info = ExternalProcessInfo::new("/bin/true", vec![]);
        assert_eq!(info.pid, -1);
        assert_eq!(info.exit_code, EXIT_PENDING);
        assert_eq!(info.stdin_fd, -1);
        assert!(!info.running);
        assert!(info.elapsed().is_none());
    }

    #[test]
    fn test_serde_fills_missing_fields() {
        let info: ExternalProcessInfo =
            serde_json::from_str(r#"{"command":"/bin/echo","args":["x"]}"#).unwrap();
        assert_eq!(info.command, "/bin/echo");
        assert_eq!(info.pid, -1);
        assert_eq!(info.timeout_seconds, 0);
    }
}
