//! Per-connection stdio redirection.
//!
//! The redirector owns configuration only. `prepare` turns a connection's
//! configuration into concrete descriptors: the child ends are consumed by
//! the fork/exec path and closed in the parent right after, the parent ends
//! are handed to `ProcessManager`, which becomes their single owner.

use crate::config::types::{ConnectionId, Result, StreamType, SupervisorError};
use crate::kernel::fd::{self, Readiness};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::OpenOptions;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Mutex;

/// Largest single read performed by `read_nonblocking`
pub const MAX_IO_BUFFER: usize = 64 * 1024;

/// Redirection mode for one stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum IoRedirectMode {
    /// Pipe pair; parent end is non-blocking
    #[default]
    Pipe,
    /// Named file (truncate-create for output, read-only for stdin)
    File,
    /// Leave the supervisor's own descriptor in place
    Console,
    /// /dev/null
    Null,
    /// stderr only: duplicate stdout onto stderr
    Merge,
    /// Same as console
    Inherit,
}

impl IoRedirectMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IoRedirectMode::Pipe => "pipe",
            IoRedirectMode::File => "file",
            IoRedirectMode::Console => "console",
            IoRedirectMode::Null => "null",
            IoRedirectMode::Merge => "merge",
            IoRedirectMode::Inherit => "inherit",
        }
    }

    fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "pipe" => Some(IoRedirectMode::Pipe),
            "file" => Some(IoRedirectMode::File),
            "console" => Some(IoRedirectMode::Console),
            "null" => Some(IoRedirectMode::Null),
            "merge" => Some(IoRedirectMode::Merge),
            "inherit" => Some(IoRedirectMode::Inherit),
            _ => None,
        }
    }
}

impl std::fmt::Display for IoRedirectMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lenient parse: unknown strings fall back to inherit
pub fn parse_mode(name: &str) -> IoRedirectMode {
    IoRedirectMode::from_name(name).unwrap_or(IoRedirectMode::Inherit)
}

pub fn validate_mode_string(name: &str) -> bool {
    IoRedirectMode::from_name(name).is_some()
}

/// Configuration of one stream
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoStreamConfig {
    pub mode: IoRedirectMode,
    pub file_path: Option<String>,
    /// Append instead of truncate for output files
    pub append: bool,
}

impl IoStreamConfig {
    pub fn new(mode: IoRedirectMode, file_path: Option<String>) -> Self {
        Self {
            mode,
            file_path,
            append: false,
        }
    }

    /// Check this configuration is usable for `stream`
    pub fn validate(&self, stream: StreamType) -> Result<()> {
        match self.mode {
            IoRedirectMode::Merge if stream != StreamType::Stderr => {
                Err(SupervisorError::Redirect(format!(
                    "merge mode is only valid for stderr, not {}",
                    stream
                )))
            }
            IoRedirectMode::File
                if self.file_path.as_deref().map_or(true, |p| p.trim().is_empty()) =>
            {
                Err(SupervisorError::Redirect(format!(
                    "file mode for {} requires a path",
                    stream
                )))
            }
            _ => Ok(()),
        }
    }
}

/// Stdio configuration of one connection
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessIoConfig {
    pub stdin: IoStreamConfig,
    pub stdout: IoStreamConfig,
    pub stderr: IoStreamConfig,
    /// Set by `apply` once a process uses this configuration
    pub applied_pid: Option<i32>,
}

impl ProcessIoConfig {
    pub fn stream(&self, stream: StreamType) -> &IoStreamConfig {
        match stream {
            StreamType::Stdin => &self.stdin,
            StreamType::Stdout => &self.stdout,
            StreamType::Stderr => &self.stderr,
        }
    }

    fn stream_mut(&mut self, stream: StreamType) -> &mut IoStreamConfig {
        match stream {
            StreamType::Stdin => &mut self.stdin,
            StreamType::Stdout => &mut self.stdout,
            StreamType::Stderr => &mut self.stderr,
        }
    }

    pub fn merges_stderr(&self) -> bool {
        self.stderr.mode == IoRedirectMode::Merge
    }

    pub fn validate(&self) -> Result<()> {
        for stream in StreamType::all() {
            self.stream(stream).validate(stream)?;
        }
        Ok(())
    }
}

/// Descriptors produced by `prepare`, indexed by target fd (0, 1, 2)
#[derive(Debug, Default)]
pub struct PreparedStdio {
    /// Installed in the child with dup2; `None` leaves the slot inherited
    pub child: [Option<OwnedFd>; 3],
    /// Kept by the parent; only present for pipe mode
    pub parent: [Option<OwnedFd>; 3],
    pub merge_stderr: bool,
}

impl PreparedStdio {
    pub fn child_fds(&self) -> [Option<RawFd>; 3] {
        [
            self.child[0].as_ref().map(|f| f.as_raw_fd()),
            self.child[1].as_ref().map(|f| f.as_raw_fd()),
            self.child[2].as_ref().map(|f| f.as_raw_fd()),
        ]
    }

    /// Close the child ends after fork, keep the parent ends
    pub fn into_parent(self) -> [Option<OwnedFd>; 3] {
        drop(self.child);
        self.parent
    }
}

/// Outcome of one non-blocking read or write
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoResult {
    pub success: bool,
    pub bytes_processed: usize,
    /// No data or space right now; retry later
    pub would_block: bool,
    pub error: Option<String>,
}

impl IoResult {
    pub fn ok(bytes: usize) -> Self {
        Self {
            success: true,
            bytes_processed: bytes,
            would_block: false,
            error: None,
        }
    }

    pub fn would_block() -> Self {
        Self {
            success: false,
            bytes_processed: 0,
            would_block: true,
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            success: false,
            bytes_processed: 0,
            would_block: false,
            error: Some(message.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Per-connection I/O counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoStats {
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub write_operations: u64,
    pub read_operations: u64,
    pub would_block_count: u64,
    pub errors: u64,
}

#[derive(Debug, Default)]
pub struct IORedirector {
    configs: Mutex<HashMap<ConnectionId, ProcessIoConfig>>,
    stats: Mutex<HashMap<ConnectionId, IoStats>>,
}

impl IORedirector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the mode of one stream. The whole configuration is validated
    /// before it replaces the previous one.
    pub fn configure(
        &self,
        conn: ConnectionId,
        stream: StreamType,
        mode: IoRedirectMode,
        file_path: Option<&str>,
    ) -> Result<()> {
        let cfg = IoStreamConfig::new(mode, file_path.map(str::to_string));
        cfg.validate(stream)?;

        let mut configs = self.configs.lock().unwrap_or_else(|p| p.into_inner());
        let entry = configs.entry(conn).or_default();
        *entry.stream_mut(stream) = cfg;
        debug!("Connection {}: {} -> {}", conn, stream, mode);
        Ok(())
    }

    /// Replace the full configuration of a connection
    pub fn set_config(&self, conn: ConnectionId, config: ProcessIoConfig) -> Result<()> {
        config.validate()?;
        self.configs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(conn, config);
        Ok(())
    }

    /// Effective configuration; unconfigured connections get pipes on all streams
    pub fn config(&self, conn: ConnectionId) -> ProcessIoConfig {
        self.configs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&conn)
            .cloned()
            .unwrap_or_default()
    }

    pub fn is_configured(&self, conn: ConnectionId) -> bool {
        self.configs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains_key(&conn)
    }

    pub fn validate(&self, conn: ConnectionId) -> Result<()> {
        self.config(conn).validate()
    }

    /// Create the descriptors for one spawn of `conn`
    pub fn prepare(&self, conn: ConnectionId) -> Result<PreparedStdio> {
        let config = self.config(conn);
        config.validate()?;

        let mut prepared = PreparedStdio {
            merge_stderr: config.merges_stderr(),
            ..PreparedStdio::default()
        };

        for stream in StreamType::all() {
            let idx = stream.target_fd() as usize;
            let (child, parent) = open_stream(stream, config.stream(stream))?;
            prepared.child[idx] = match child {
                Some(fd) => Some(fd::move_above_stdio(fd)?),
                None => None,
            };
            prepared.parent[idx] = parent;
        }
        Ok(prepared)
    }

    /// Record that `pid` now runs with this connection's configuration
    pub fn apply(&self, conn: ConnectionId, pid: i32) -> Result<()> {
        let mut configs = self.configs.lock().unwrap_or_else(|p| p.into_inner());
        configs.entry(conn).or_default().applied_pid = Some(pid);
        Ok(())
    }

    /// Non-blocking write to a parent-side descriptor
    pub fn write_nonblocking(&self, conn: ConnectionId, fd: RawFd, data: &[u8]) -> IoResult {
        let result = if data.is_empty() {
            IoResult::ok(0)
        } else {
            match fd::poll_writable(fd, 0) {
                Ok(Readiness::Ready) => match fd::raw_write(fd, data) {
                    Ok(n) => IoResult::ok(n),
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => IoResult::would_block(),
                    Err(e) => IoResult::error(format!("write failed: {}", e)),
                },
                Ok(Readiness::TimedOut) => IoResult::would_block(),
                Ok(Readiness::HangUp) => IoResult::error("pipe closed"),
                Err(e) => IoResult::error(format!("poll failed: {}", e)),
            }
        };
        self.record(conn, &result, true);
        result
    }

    /// Non-blocking read from a parent-side descriptor, at most `MAX_IO_BUFFER` bytes
    pub fn read_nonblocking(&self, conn: ConnectionId, fd: RawFd, buf: &mut [u8]) -> IoResult {
        let len = buf.len().min(MAX_IO_BUFFER);
        let result = if len == 0 {
            IoResult::ok(0)
        } else {
            match fd::poll_readable(fd, 0) {
                // HangUp still needs a read to drain buffered data
                Ok(Readiness::Ready) | Ok(Readiness::HangUp) => {
                    match fd::raw_read(fd, &mut buf[..len]) {
                        Ok(0) => IoResult::error("pipe closed"),
                        Ok(n) => IoResult::ok(n),
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            IoResult::would_block()
                        }
                        Err(e) => IoResult::error(format!("read failed: {}", e)),
                    }
                }
                Ok(Readiness::TimedOut) => IoResult::would_block(),
                Err(e) => IoResult::error(format!("poll failed: {}", e)),
            }
        };
        self.record(conn, &result, false);
        result
    }

    fn record(&self, conn: ConnectionId, result: &IoResult, write: bool) {
        let mut stats = self.stats.lock().unwrap_or_else(|p| p.into_inner());
        let entry = stats.entry(conn).or_default();
        if result.would_block {
            entry.would_block_count += 1;
        } else if result.is_error() {
            entry.errors += 1;
        } else if write {
            entry.write_operations += 1;
            entry.bytes_written += result.bytes_processed as u64;
        } else {
            entry.read_operations += 1;
            entry.bytes_read += result.bytes_processed as u64;
        }
    }

    pub fn stats(&self, conn: ConnectionId) -> IoStats {
        self.stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&conn)
            .cloned()
            .unwrap_or_default()
    }

    /// Forget configuration and counters for `conn`
    pub fn cleanup(&self, conn: ConnectionId) {
        let had_config = self
            .configs
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&conn)
            .is_some();
        self.stats
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&conn);
        if had_config {
            debug!("Cleaned up I/O configuration for connection {}", conn);
        }
    }
}

/// (child end, parent end) for one stream
fn open_stream(
    stream: StreamType,
    cfg: &IoStreamConfig,
) -> Result<(Option<OwnedFd>, Option<OwnedFd>)> {
    match cfg.mode {
        IoRedirectMode::Pipe => {
            let (read_end, write_end) = fd::cloexec_pipe()
                .map_err(|e| SupervisorError::Redirect(format!("{} pipe: {}", stream, e)))?;
            let (child, parent) = match stream {
                StreamType::Stdin => (read_end, write_end),
                StreamType::Stdout | StreamType::Stderr => (write_end, read_end),
            };
            fd::set_nonblocking(parent.as_raw_fd(), true)?;
            Ok((Some(child), Some(parent)))
        }
        IoRedirectMode::File => {
            let path = cfg.file_path.as_deref().unwrap_or_default();
            let file = match stream {
                StreamType::Stdin => OpenOptions::new().read(true).open(path),
                StreamType::Stdout | StreamType::Stderr => {
                    let mut opts = OpenOptions::new();
                    opts.write(true).create(true);
                    if cfg.append {
                        opts.append(true);
                    } else {
                        opts.truncate(true);
                    }
                    opts.open(path)
                }
            }
            .map_err(|e| {
                warn!("Failed to open {} for {}: {}", path, stream, e);
                SupervisorError::Redirect(format!("{}: cannot open {}: {}", stream, path, e))
            })?;
            Ok((Some(OwnedFd::from(file)), None))
        }
        IoRedirectMode::Null => {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open("/dev/null")
                .map_err(|e| SupervisorError::Redirect(format!("/dev/null: {}", e)))?;
            Ok((Some(OwnedFd::from(file)), None))
        }
        IoRedirectMode::Console | IoRedirectMode::Inherit | IoRedirectMode::Merge => {
            Ok((None, None))
        }
    }
}
