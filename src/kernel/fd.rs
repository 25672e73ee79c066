//! Descriptor helpers: pipes, non-blocking mode, readiness polling, raw I/O.

use crate::config::types::{Result, SupervisorError};
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

/// Readiness result of a single-descriptor poll
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    /// Peer closed (POLLHUP without POLLIN/POLLOUT)
    HangUp,
    TimedOut,
}

/// Create a close-on-exec pipe, returning (read, write)
pub fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(OFlag::O_CLOEXEC)
        .map_err(|e| SupervisorError::Spawn(format!("pipe2 failed: {}", e)))
}

/// Set or clear O_NONBLOCK
pub fn set_nonblocking(fd: RawFd, enabled: bool) -> Result<()> {
    let bits = fcntl(fd, FcntlArg::F_GETFL)?;
    let mut flags = OFlag::from_bits_truncate(bits);
    flags.set(OFlag::O_NONBLOCK, enabled);
    fcntl(fd, FcntlArg::F_SETFL(flags))?;
    Ok(())
}

pub fn is_nonblocking(fd: RawFd) -> Result<bool> {
    let bits = fcntl(fd, FcntlArg::F_GETFL)?;
    Ok(OFlag::from_bits_truncate(bits).contains(OFlag::O_NONBLOCK))
}

fn poll_one(fd: RawFd, events: libc::c_short, timeout_ms: i32) -> Result<Readiness> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    loop {
        // SAFETY: one valid pollfd entry that lives for the duration of the call.
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
        if rc < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                continue;
            }
            return Err(SupervisorError::Io(err));
        }
        if rc == 0 {
            return Ok(Readiness::TimedOut);
        }
        if pfd.revents & events != 0 {
            return Ok(Readiness::Ready);
        }
        if pfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0 {
            return Ok(Readiness::HangUp);
        }
        return Ok(Readiness::TimedOut);
    }
}

/// Wait up to `timeout_ms` for `fd` to become readable. Negative waits forever.
pub fn poll_readable(fd: RawFd, timeout_ms: i32) -> Result<Readiness> {
    poll_one(fd, libc::POLLIN, timeout_ms)
}

/// Wait up to `timeout_ms` for `fd` to become writable
pub fn poll_writable(fd: RawFd, timeout_ms: i32) -> Result<Readiness> {
    poll_one(fd, libc::POLLOUT, timeout_ms)
}

/// read(2) returning the raw io::Error so callers can tell EAGAIN apart
pub fn raw_read(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    loop {
        // SAFETY: buf is a valid writable region of buf.len() bytes.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// write(2) returning the raw io::Error
pub fn raw_write(fd: RawFd, data: &[u8]) -> std::io::Result<usize> {
    loop {
        // SAFETY: data is a valid readable region of data.len() bytes.
        let n = unsafe { libc::write(fd, data.as_ptr() as *const libc::c_void, data.len()) };
        if n >= 0 {
            return Ok(n as usize);
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// Move `fd` to a number above 2 so it can never alias a stdio slot
/// while the child rearranges descriptors. Keeps close-on-exec.
pub fn move_above_stdio(fd: OwnedFd) -> Result<OwnedFd> {
    if fd.as_raw_fd() > libc::STDERR_FILENO {
        return Ok(fd);
    }
    let raw = fcntl(fd.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(libc::STDERR_FILENO + 1))?;
    // SAFETY: F_DUPFD_CLOEXEC returned a new descriptor that nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// Raw descriptor of an optional owned fd, or -1
pub fn raw_or_invalid(fd: &Option<OwnedFd>) -> RawFd {
    fd.as_ref().map(|f| f.as_raw_fd()).unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonblocking_toggle() {
        let (read_end, _write_end) = cloexec_pipe().unwrap();
        let fd = read_end.as_raw_fd();
        assert!(!is_nonblocking(fd).unwrap());
        set_nonblocking(fd, true).unwrap();
        assert!(is_nonblocking(fd).unwrap());
        set_nonblocking(fd, false).unwrap();
        assert!(!is_nonblocking(fd).unwrap());
    }

    #[test]
    fn test_empty_pipe_would_block() {
        let (read_end, _write_end) = cloexec_pipe().unwrap();
        set_nonblocking(read_end.as_raw_fd(), true).unwrap();
        let mut buf = [0u8; 16];
        let err = raw_read(read_end.as_raw_fd(), &mut buf).unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::WouldBlock);
    }

    #[test]
    fn test_poll_sees_data_and_hangup() {
        let (read_end, write_end) = cloexec_pipe().unwrap();
        assert_eq!(
            poll_readable(read_end.as_raw_fd(), 0).unwrap(),
            Readiness::TimedOut
        );
        raw_write(write_end.as_raw_fd(), b"x").unwrap();
        assert_eq!(
            poll_readable(read_end.as_raw_fd(), 100).unwrap(),
            Readiness::Ready
        );
        let mut buf = [0u8; 4];
        assert_eq!(raw_read(read_end.as_raw_fd(), &mut buf).unwrap(), 1);
        drop(write_end);
        assert_eq!(
            poll_readable(read_end.as_raw_fd(), 100).unwrap(),
            Readiness::HangUp
        );
    }
}
