//! Resource limits and scheduling priority.
//!
//! `RlimitSetting` is computed in the parent and handed to the child setup
//! path, which applies it with a bare `setrlimit` call. Live processes are
//! adjusted with `prlimit`.

use crate::config::types::{Result, SupervisorError};
use serde::{Deserialize, Serialize};

#[cfg(all(target_os = "linux", target_env = "gnu"))]
type RawResource = libc::__rlimit_resource_t;
#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
type RawResource = libc::c_int;

/// Limitable resources
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RlimitResource {
    /// CPU seconds (RLIMIT_CPU)
    Cpu,
    /// Address space bytes (RLIMIT_AS)
    AddressSpace,
    /// Open descriptors (RLIMIT_NOFILE)
    OpenFiles,
    /// Processes for the real uid (RLIMIT_NPROC)
    Processes,
    /// Largest file the process may create (RLIMIT_FSIZE)
    FileSize,
    /// Core dump size (RLIMIT_CORE)
    Core,
}

impl RlimitResource {
    /// libc resource constant
    pub(crate) fn as_raw(&self) -> RawResource {
        match self {
            RlimitResource::Cpu => libc::RLIMIT_CPU,
            RlimitResource::AddressSpace => libc::RLIMIT_AS,
            RlimitResource::OpenFiles => libc::RLIMIT_NOFILE,
            RlimitResource::Processes => libc::RLIMIT_NPROC,
            RlimitResource::FileSize => libc::RLIMIT_FSIZE,
            RlimitResource::Core => libc::RLIMIT_CORE,
        }
    }
}

/// One soft/hard pair
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RlimitSetting {
    pub resource: RlimitResource,
    pub soft: u64,
    pub hard: u64,
}

impl RlimitSetting {
    pub fn new(resource: RlimitResource, soft: u64, hard: u64) -> Self {
        // The kernel rejects soft > hard
        Self {
            resource,
            soft: soft.min(hard),
            hard,
        }
    }

    /// Same value for soft and hard
    pub fn fixed(resource: RlimitResource, value: u64) -> Self {
        Self::new(resource, value, value)
    }

    fn as_rlimit(&self) -> libc::rlimit {
        libc::rlimit {
            rlim_cur: self.soft as libc::rlim_t,
            rlim_max: self.hard as libc::rlim_t,
        }
    }
}

/// Apply a setting to the calling process.
///
/// Async-signal-safe: called between fork and exec. Returns the errno on failure.
pub fn apply_in_child(setting: &RlimitSetting) -> std::result::Result<(), i32> {
    let limit = setting.as_rlimit();
    // SAFETY: setrlimit only reads the provided struct; no allocation happens here.
    let rc = unsafe { libc::setrlimit(setting.resource.as_raw(), &limit) };
    if rc != 0 {
        return Err(last_errno());
    }
    Ok(())
}

/// Apply a setting to another live process (Linux prlimit)
pub fn apply_to_process(pid: i32, setting: &RlimitSetting) -> Result<()> {
    let limit = setting.as_rlimit();
    // SAFETY: prlimit reads `limit` and writes nothing because old_limit is null.
    let rc = unsafe {
        libc::prlimit(
            pid as libc::pid_t,
            setting.resource.as_raw(),
            &limit,
            std::ptr::null_mut(),
        )
    };
    if rc != 0 {
        return Err(SupervisorError::ResourceLimit(format!(
            "prlimit({:?}) on pid {} failed: {}",
            setting.resource,
            pid,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// Read a live process's current soft/hard pair
pub fn read_process_limit(pid: i32, resource: RlimitResource) -> Result<RlimitSetting> {
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    // SAFETY: new_limit is null so nothing is changed; `current` is a valid out pointer.
    let rc = unsafe {
        libc::prlimit(
            pid as libc::pid_t,
            resource.as_raw(),
            std::ptr::null(),
            &mut current,
        )
    };
    if rc != 0 {
        return Err(SupervisorError::ResourceLimit(format!(
            "prlimit read({:?}) on pid {} failed: {}",
            resource,
            pid,
            std::io::Error::last_os_error()
        )));
    }
    Ok(RlimitSetting {
        resource,
        soft: current.rlim_cur as u64,
        hard: current.rlim_max as u64,
    })
}

/// setpriority(PRIO_PROCESS, pid, nice)
pub fn set_priority(pid: i32, nice: i32) -> Result<()> {
    // SAFETY: plain syscall wrapper with value arguments.
    let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, pid as libc::id_t, nice) };
    if rc != 0 {
        return Err(SupervisorError::ResourceLimit(format!(
            "setpriority({}) on pid {} failed: {}",
            nice,
            pid,
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

/// getpriority(PRIO_PROCESS, pid)
pub fn get_priority(pid: i32) -> Result<i32> {
    // getpriority can legitimately return -1, so errno has to be cleared first
    // SAFETY: __errno_location returns this thread's errno slot.
    unsafe { *libc::__errno_location() = 0 };
    // SAFETY: plain syscall wrapper with value arguments.
    let value = unsafe { libc::getpriority(libc::PRIO_PROCESS, pid as libc::id_t) };
    if value == -1 && last_errno() != 0 {
        return Err(SupervisorError::Process(format!(
            "getpriority on pid {} failed: {}",
            pid,
            std::io::Error::last_os_error()
        )));
    }
    Ok(value)
}

pub(crate) fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_clamped_to_hard() {
        let setting = RlimitSetting::new(RlimitResource::Cpu, 20, 10);
        assert_eq!(setting.soft, 10);
        assert_eq!(setting.hard, 10);
    }

    #[test]
    fn test_read_own_nofile_limit() {
        let pid = std::process::id() as i32;
        let limit = read_process_limit(pid, RlimitResource::OpenFiles).unwrap();
        assert!(limit.soft <= limit.hard);
        assert!(limit.soft > 0);
    }

    #[test]
    fn test_get_own_priority() {
        let pid = std::process::id() as i32;
        let nice = get_priority(pid).unwrap();
        assert!((-20..=19).contains(&nice));
    }

    #[test]
    fn test_prlimit_on_child() {
        let mut child = std::process::Command::new("sleep")
            .arg("5")
            .spawn()
            .expect("spawn sleep");
        let pid = child.id() as i32;
        let setting = RlimitSetting::new(RlimitResource::Cpu, 3, 4);
        apply_to_process(pid, &setting).unwrap();
        let read_back = read_process_limit(pid, RlimitResource::Cpu).unwrap();
        assert_eq!(read_back.soft, 3);
        assert_eq!(read_back.hard, 4);
        let _ = child.kill();
        let _ = child.wait();
    }
}
