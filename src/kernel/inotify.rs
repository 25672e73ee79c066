//! inotify(7) instance with raw event-buffer parsing.

use crate::config::types::{Result, SupervisorError};
use crate::kernel::fd::raw_read;
use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Size of the fixed `struct inotify_event` header
const EVENT_HEADER_SIZE: usize = std::mem::size_of::<libc::inotify_event>();

/// Read buffer: room for many events with names up to NAME_MAX
pub const EVENT_BUFFER_SIZE: usize = 64 * (EVENT_HEADER_SIZE + 256);

/// One parsed kernel event
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawWatchEvent {
    pub wd: i32,
    pub mask: u32,
    pub cookie: u32,
    /// Entry name inside a watched directory; empty for the watched path itself
    pub name: String,
}

/// Non-blocking, close-on-exec inotify instance
#[derive(Debug)]
pub struct InotifyHandle {
    fd: OwnedFd,
}

impl InotifyHandle {
    pub fn new() -> Result<Self> {
        // SAFETY: no pointer arguments; return value checked.
        let raw = unsafe { libc::inotify_init1(libc::IN_NONBLOCK | libc::IN_CLOEXEC) };
        if raw < 0 {
            return Err(SupervisorError::Watch(format!(
                "inotify_init1 failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: raw is a fresh descriptor we now own.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self { fd })
    }

    /// Register `path`; returns the watch descriptor
    pub fn add_watch(&self, path: &str, mask: u32) -> Result<i32> {
        let c_path = CString::new(path)
            .map_err(|_| SupervisorError::Watch(format!("path contains NUL: {:?}", path)))?;
        // SAFETY: c_path is a valid NUL-terminated string for the call duration.
        let wd = unsafe { libc::inotify_add_watch(self.fd.as_raw_fd(), c_path.as_ptr(), mask) };
        if wd < 0 {
            return Err(SupervisorError::Watch(format!(
                "inotify_add_watch({}) failed: {}",
                path,
                std::io::Error::last_os_error()
            )));
        }
        Ok(wd)
    }

    pub fn rm_watch(&self, wd: i32) -> Result<()> {
        // SAFETY: value arguments only.
        let rc = unsafe { libc::inotify_rm_watch(self.fd.as_raw_fd(), wd) };
        if rc < 0 {
            return Err(SupervisorError::Watch(format!(
                "inotify_rm_watch({}) failed: {}",
                wd,
                std::io::Error::last_os_error()
            )));
        }
        Ok(())
    }

    /// Read whatever is queued; returns 0 when nothing is pending
    pub fn read_into(&self, buf: &mut [u8]) -> Result<usize> {
        match raw_read(self.fd.as_raw_fd(), buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(SupervisorError::Watch(format!("inotify read failed: {}", e))),
        }
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

/// Parse up to `max_events` records out of `buf[..len]`
pub fn parse_events(buf: &[u8], len: usize, max_events: usize) -> Vec<RawWatchEvent> {
    let mut events = Vec::new();
    let mut offset = 0usize;
    let len = len.min(buf.len());

    while offset + EVENT_HEADER_SIZE <= len && events.len() < max_events {
        // SAFETY: bounds checked above; read_unaligned tolerates any alignment.
        let header: libc::inotify_event = unsafe {
            std::ptr::read_unaligned(buf[offset..].as_ptr() as *const libc::inotify_event)
        };
        let name_start = offset + EVENT_HEADER_SIZE;
        let name_end = name_start + header.len as usize;
        if name_end > len {
            break;
        }
        let name = if header.len > 0 {
            let raw = &buf[name_start..name_end];
            let trimmed = raw.split(|b| *b == 0).next().unwrap_or(&[]);
            String::from_utf8_lossy(trimmed).into_owned()
        } else {
            String::new()
        };
        events.push(RawWatchEvent {
            wd: header.wd,
            mask: header.mask,
            cookie: header.cookie,
            name,
        });
        offset = name_end;
    }

    events
}
