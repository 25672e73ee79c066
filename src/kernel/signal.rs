//! Signal delivery and termination escalation for supervised processes
//!
//! Every helper here addresses a single pid; process groups are never
//! signalled because children are not placed in their own groups.

use log::{debug, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Outcome of a graceful termination attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    /// Process was already gone when termination started
    pub already_exited: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// Map a numeric signal to `Signal`, rejecting unknown numbers
pub fn signal_from_number(signum: i32) -> Option<Signal> {
    Signal::try_from(signum).ok()
}

/// Send `sig` to `pid`. ESRCH is reported as `Ok(false)`.
pub fn send_signal(pid: i32, sig: Signal) -> Result<bool, Errno> {
    if pid <= 0 {
        return Err(Errno::EINVAL);
    }
    match signal::kill(Pid::from_raw(pid), sig) {
        Ok(()) => {
            debug!("Sent {:?} to pid {}", sig, pid);
            Ok(true)
        }
        Err(Errno::ESRCH) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Probe liveness with signal 0
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    match signal::kill(Pid::from_raw(pid), None::<Signal>) {
        Ok(()) => true,
        // EPERM means the pid exists but belongs to someone else
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Stop a process (SIGSTOP). Used by throttle and suspend enforcement.
pub fn stop_process(pid: i32) -> Result<bool, Errno> {
    send_signal(pid, Signal::SIGSTOP)
}

/// Resume a stopped process (SIGCONT)
pub fn continue_process(pid: i32) -> Result<bool, Errno> {
    send_signal(pid, Signal::SIGCONT)
}

/// SIGTERM, poll for exit every `poll` up to `grace`, then SIGKILL.
///
/// `still_running` decides liveness; callers that own the child pass a
/// closure that reaps it, so a zombie does not count as alive.
pub fn terminate_gracefully<F>(
    pid: i32,
    grace: Duration,
    poll: Duration,
    mut still_running: F,
) -> KillReport
where
    F: FnMut() -> bool,
{
    let mut report = KillReport::default();
    let start = Instant::now();

    if !still_running() {
        report.already_exited = true;
        return report;
    }

    match send_signal(pid, Signal::SIGTERM) {
        Ok(true) => report.term_sent = true,
        Ok(false) => {
            report.already_exited = true;
            return report;
        }
        Err(e) => report.notes.push(format!("SIGTERM failed: {}", e)),
    }

    let deadline = start + grace;
    while Instant::now() < deadline {
        if !still_running() {
            report.waited_ms = start.elapsed().as_millis() as u64;
            return report;
        }
        std::thread::sleep(poll);
    }

    if still_running() {
        match send_signal(pid, Signal::SIGKILL) {
            Ok(sent) => {
                report.kill_sent = sent;
                if sent {
                    info!("Escalated to SIGKILL for pid {} after {:?}", pid, grace);
                }
            }
            Err(e) => {
                warn!("SIGKILL failed for pid {}: {}", pid, e);
                report.notes.push(format!("SIGKILL failed: {}", e));
            }
        }
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}
