//! Child-side setup between fork and exec.
//!
//! Everything the child needs is materialised in the parent first
//! (`ChildSpec::new`): C strings, pointer arrays, descriptor numbers. After
//! fork the child only issues raw syscalls, so no allocator or lock held by
//! another parent thread can deadlock it. Any failure writes a 5-byte record
//! (stage, errno) to the close-on-exec status pipe and calls `_exit(127)`.

use crate::config::types::{Result, SupervisorError};
use crate::kernel::fd::raw_read;
use crate::kernel::rlimit::{self, RlimitSetting};
use std::ffi::CString;
use std::os::fd::RawFd;
use std::os::raw::c_char;

const CLOSE_RANGE_CLOEXEC: libc::c_uint = 1 << 2;

/// Exit status used when setup fails before exec
pub const CHILD_SETUP_FAILURE: i32 = 127;

/// Setup step that failed in the child
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChildStage {
    Signals = 1,
    Stdio = 2,
    Chroot = 3,
    Chdir = 4,
    Rlimit = 5,
    NoNewPrivs = 6,
    Groups = 7,
    Setgid = 8,
    Setuid = 9,
    Exec = 10,
}

impl ChildStage {
    fn from_byte(b: u8) -> Option<Self> {
        Some(match b {
            1 => ChildStage::Signals,
            2 => ChildStage::Stdio,
            3 => ChildStage::Chroot,
            4 => ChildStage::Chdir,
            5 => ChildStage::Rlimit,
            6 => ChildStage::NoNewPrivs,
            7 => ChildStage::Groups,
            8 => ChildStage::Setgid,
            9 => ChildStage::Setuid,
            10 => ChildStage::Exec,
            _ => return None,
        })
    }

    pub fn describe(&self) -> &'static str {
        match self {
            ChildStage::Signals => "signal reset",
            ChildStage::Stdio => "stdio redirection",
            ChildStage::Chroot => "chroot",
            ChildStage::Chdir => "chdir",
            ChildStage::Rlimit => "setrlimit",
            ChildStage::NoNewPrivs => "no_new_privs",
            ChildStage::Groups => "setgroups",
            ChildStage::Setgid => "setgid",
            ChildStage::Setuid => "setuid",
            ChildStage::Exec => "exec",
        }
    }
}

/// Fully materialised child setup.
///
/// Holds raw pointers into its own `CString`s, so it is neither `Send` nor
/// `Sync`; build it on the thread that forks.
pub struct ChildSpec {
    program: CString,
    _argv: Vec<CString>,
    argv_ptrs: Vec<*const c_char>,
    _envp: Vec<CString>,
    envp_ptrs: Vec<*const c_char>,
    /// Source descriptor for each of stdin/stdout/stderr; -1 leaves the slot inherited
    stdio: [RawFd; 3],
    merge_stderr: bool,
    chroot_dir: Option<CString>,
    working_dir: Option<CString>,
    rlimits: Vec<RlimitSetting>,
    no_new_privs: bool,
    uid: Option<u32>,
    gid: Option<u32>,
    status_fd: RawFd,
}

/// Parent-side inputs for `ChildSpec::new`
#[derive(Debug, Clone, Default)]
pub struct ChildOptions {
    pub stdio: [Option<RawFd>; 3],
    pub merge_stderr: bool,
    pub chroot_dir: Option<String>,
    pub working_dir: Option<String>,
    pub rlimits: Vec<RlimitSetting>,
    pub no_new_privs: bool,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

fn to_cstring(label: &str, value: &str) -> Result<CString> {
    CString::new(value)
        .map_err(|_| SupervisorError::Spawn(format!("{} contains NUL byte: {:?}", label, value)))
}

impl ChildSpec {
    pub fn new(
        program: &str,
        args: &[String],
        env: &[(String, String)],
        options: &ChildOptions,
        status_fd: RawFd,
    ) -> Result<Self> {
        let program_c = to_cstring("command", program)?;

        // argv[0] is the program path as given
        let mut argv = Vec::with_capacity(args.len() + 1);
        argv.push(program_c.clone());
        for arg in args {
            argv.push(to_cstring("argument", arg)?);
        }
        let mut argv_ptrs: Vec<*const c_char> = argv.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());

        let mut envp = Vec::with_capacity(env.len());
        for (key, value) in env {
            if key.is_empty() || key.contains('=') {
                return Err(SupervisorError::Spawn(format!(
                    "invalid environment variable name: {:?}",
                    key
                )));
            }
            envp.push(to_cstring("environment", &format!("{}={}", key, value))?);
        }
        let mut envp_ptrs: Vec<*const c_char> = envp.iter().map(|e| e.as_ptr()).collect();
        envp_ptrs.push(std::ptr::null());

        let chroot_dir = match options.chroot_dir {
            Some(ref dir) => Some(to_cstring("chroot", dir)?),
            None => None,
        };
        let working_dir = match options.working_dir {
            Some(ref dir) => Some(to_cstring("working directory", dir)?),
            None => None,
        };

        Ok(Self {
            program: program_c,
            _argv: argv,
            argv_ptrs,
            _envp: envp,
            envp_ptrs,
            stdio: [
                options.stdio[0].unwrap_or(-1),
                options.stdio[1].unwrap_or(-1),
                options.stdio[2].unwrap_or(-1),
            ],
            merge_stderr: options.merge_stderr,
            chroot_dir,
            working_dir,
            rlimits: options.rlimits.clone(),
            no_new_privs: options.no_new_privs,
            uid: options.uid,
            gid: options.gid,
            status_fd,
        })
    }

    fn fail(&self, stage: ChildStage, errno: i32) -> ! {
        let mut record = [0u8; 5];
        record[0] = stage as u8;
        record[1..].copy_from_slice(&errno.to_ne_bytes());
        // SAFETY: write and _exit are async-signal-safe; record outlives the call.
        unsafe {
            libc::write(
                self.status_fd,
                record.as_ptr() as *const libc::c_void,
                record.len(),
            );
            libc::_exit(CHILD_SETUP_FAILURE)
        }
    }

    /// Run in the forked child. Never returns.
    ///
    /// Must only be called in a freshly forked child of a possibly
    /// multi-threaded parent.
    pub fn exec(&self) -> ! {
        // SAFETY: every call below is an async-signal-safe syscall wrapper
        // operating on data prepared before fork.
        unsafe {
            // Rust runtimes ignore SIGPIPE; exec would inherit that disposition
            if libc::signal(libc::SIGPIPE, libc::SIG_DFL) == libc::SIG_ERR {
                self.fail(ChildStage::Signals, rlimit::last_errno());
            }
            let mut empty: libc::sigset_t = std::mem::zeroed();
            libc::sigemptyset(&mut empty);
            if libc::pthread_sigmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut()) != 0 {
                self.fail(ChildStage::Signals, rlimit::last_errno());
            }

            for (target, source) in self.stdio.iter().enumerate() {
                if *source >= 0 && libc::dup2(*source, target as i32) < 0 {
                    self.fail(ChildStage::Stdio, rlimit::last_errno());
                }
            }
            if self.merge_stderr
                && libc::dup2(libc::STDOUT_FILENO, libc::STDERR_FILENO) < 0
            {
                self.fail(ChildStage::Stdio, rlimit::last_errno());
            }

            // Mark everything above stdio close-on-exec; the status pipe is
            // already cloexec. Kernels before 5.11 lack the flag, and the
            // descriptors we create are cloexec anyway.
            libc::syscall(
                libc::SYS_close_range,
                3 as libc::c_uint,
                libc::c_uint::MAX,
                CLOSE_RANGE_CLOEXEC,
            );

            if let Some(ref root) = self.chroot_dir {
                if libc::chroot(root.as_ptr()) != 0 {
                    self.fail(ChildStage::Chroot, rlimit::last_errno());
                }
                if self.working_dir.is_none() && libc::chdir(b"/\0".as_ptr() as *const c_char) != 0 {
                    self.fail(ChildStage::Chdir, rlimit::last_errno());
                }
            }
            if let Some(ref dir) = self.working_dir {
                if libc::chdir(dir.as_ptr()) != 0 {
                    self.fail(ChildStage::Chdir, rlimit::last_errno());
                }
            }

            for setting in &self.rlimits {
                if let Err(errno) = rlimit::apply_in_child(setting) {
                    self.fail(ChildStage::Rlimit, errno);
                }
            }

            if self.no_new_privs && libc::prctl(libc::PR_SET_NO_NEW_PRIVS, 1, 0, 0, 0) != 0 {
                self.fail(ChildStage::NoNewPrivs, rlimit::last_errno());
            }

            // gid before uid: after setuid we may no longer change groups
            if let Some(gid) = self.gid {
                if libc::geteuid() == 0 && libc::setgroups(0, std::ptr::null()) != 0 {
                    self.fail(ChildStage::Groups, rlimit::last_errno());
                }
                if libc::setgid(gid as libc::gid_t) != 0 {
                    self.fail(ChildStage::Setgid, rlimit::last_errno());
                }
            }
            if let Some(uid) = self.uid {
                if libc::setuid(uid as libc::uid_t) != 0 {
                    self.fail(ChildStage::Setuid, rlimit::last_errno());
                }
            }

            libc::execve(
                self.program.as_ptr(),
                self.argv_ptrs.as_ptr(),
                self.envp_ptrs.as_ptr(),
            );
            self.fail(ChildStage::Exec, rlimit::last_errno())
        }
    }
}

/// Failure reported by a child through the status pipe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildFailure {
    pub stage: ChildStage,
    pub errno: i32,
}

impl std::fmt::Display for ChildFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} failed: {}",
            self.stage.describe(),
            std::io::Error::from_raw_os_error(self.errno)
        )
    }
}

/// Block until the child either execs (EOF) or reports a failure.
///
/// The parent must have closed its copy of the write end first.
pub fn read_child_status(status_read: RawFd) -> Result<Option<ChildFailure>> {
    let mut record = [0u8; 5];
    let mut filled = 0usize;
    while filled < record.len() {
        match raw_read(status_read, &mut record[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) => return Err(SupervisorError::Spawn(format!("status pipe read failed: {}", e))),
        }
    }
    if filled == 0 {
        return Ok(None);
    }
    if filled < record.len() {
        return Err(SupervisorError::Spawn(format!(
            "truncated child status record ({} bytes)",
            filled
        )));
    }
    let stage = ChildStage::from_byte(record[0]).ok_or_else(|| {
        SupervisorError::Spawn(format!("unknown child setup stage {}", record[0]))
    })?;
    let mut errno_bytes = [0u8; 4];
    errno_bytes.copy_from_slice(&record[1..]);
    Ok(Some(ChildFailure {
        stage,
        errno: i32::from_ne_bytes(errno_bytes),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_rejects_nul_bytes() {
        let opts = ChildOptions::default();
        assert!(ChildSpec::new("/bin/echo", &["a\0b".to_string()], &[], &opts, -1).is_err());
        assert!(ChildSpec::new("/bin/\0echo", &[], &[], &opts, -1).is_err());
    }

    #[test]
    fn test_spec_rejects_bad_env_names() {
        let opts = ChildOptions::default();
        let env = vec![("A=B".to_string(), "x".to_string())];
        assert!(ChildSpec::new("/bin/echo", &[], &env, &opts, -1).is_err());
        let env = vec![(String::new(), "x".to_string())];
        assert!(ChildSpec::new("/bin/echo", &[], &env, &opts, -1).is_err());
    }

    #[test]
    fn test_argv_is_null_terminated() {
        let opts = ChildOptions::default();
        let spec = ChildSpec::new(
            "/bin/echo",
            &["one".to_string(), "two".to_string()],
            &[("K".to_string(), "V".to_string())],
            &opts,
            -1,
        )
        .unwrap();
        assert_eq!(spec.argv_ptrs.len(), 4);
        assert!(spec.argv_ptrs[3].is_null());
        assert_eq!(spec.envp_ptrs.len(), 2);
        assert!(spec.envp_ptrs[1].is_null());
    }

    #[test]
    fn test_status_record_roundtrip() {
        let (read_end, write_end) = crate::kernel::fd::cloexec_pipe().unwrap();
        let mut record = vec![ChildStage::Exec as u8];
        record.extend_from_slice(&libc::ENOENT.to_ne_bytes());
        crate::kernel::fd::raw_write(std::os::fd::AsRawFd::as_raw_fd(&write_end), &record)
            .unwrap();
        drop(write_end);
        let failure = read_child_status(std::os::fd::AsRawFd::as_raw_fd(&read_end))
            .unwrap()
            .unwrap();
        assert_eq!(failure.stage, ChildStage::Exec);
        assert_eq!(failure.errno, libc::ENOENT);
        assert!(failure.to_string().starts_with("exec failed"));
    }

    #[test]
    fn test_status_eof_means_exec_succeeded() {
        let (read_end, write_end) = crate::kernel::fd::cloexec_pipe().unwrap();
        drop(write_end);
        let status = read_child_status(std::os::fd::AsRawFd::as_raw_fd(&read_end)).unwrap();
        assert!(status.is_none());
    }
}
