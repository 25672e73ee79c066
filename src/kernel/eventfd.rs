//! Counting wake primitive backed by eventfd(2).

use crate::config::types::{Result, SupervisorError};
use crate::kernel::fd::{poll_readable, raw_read, raw_write, Readiness};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Non-blocking, close-on-exec eventfd.
///
/// `signal` adds to the kernel counter; `drain` reads and resets it.
#[derive(Debug)]
pub struct WakeFd {
    fd: OwnedFd,
}

impl WakeFd {
    pub fn new() -> Result<Self> {
        // SAFETY: eventfd has no pointer arguments; a negative return is checked below.
        let raw = unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) };
        if raw < 0 {
            return Err(SupervisorError::Event(format!(
                "eventfd failed: {}",
                std::io::Error::last_os_error()
            )));
        }
        // SAFETY: raw is a freshly created descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self { fd })
    }

    /// Bump the counter by `value`
    pub fn signal(&self, value: u64) -> Result<()> {
        let bytes = value.max(1).to_ne_bytes();
        match raw_write(self.fd.as_raw_fd(), &bytes) {
            Ok(_) => Ok(()),
            // Counter saturated: readers are already guaranteed a wake-up
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(SupervisorError::Event(format!("eventfd write failed: {}", e))),
        }
    }

    /// Read and reset the counter; 0 when nothing was pending
    pub fn drain(&self) -> Result<u64> {
        let mut bytes = [0u8; 8];
        match raw_read(self.fd.as_raw_fd(), &mut bytes) {
            Ok(8) => Ok(u64::from_ne_bytes(bytes)),
            Ok(n) => Err(SupervisorError::Event(format!(
                "short eventfd read: {} bytes",
                n
            ))),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(SupervisorError::Event(format!("eventfd read failed: {}", e))),
        }
    }

    /// Block up to `timeout_ms` for the counter to become non-zero
    pub fn wait(&self, timeout_ms: i32) -> Result<bool> {
        Ok(poll_readable(self.fd.as_raw_fd(), timeout_ms)? == Readiness::Ready)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}
