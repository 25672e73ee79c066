/// Security validation for spawned processes: command allow/block lists,
/// shell-injection screening, path safety, and the rlimit/identity plan
/// applied in the child before exec.
use crate::config::types::{ConnectionId, Result, SecurityContext, SupervisorError};
use crate::kernel::rlimit::{RlimitResource, RlimitSetting};
use crate::observability::audit::{AuditLog, SecurityEvent, SecurityEventType};
use std::sync::Arc;

/// Security error types for validation failures
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SecurityError {
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Command not allowed: {0}")]
    CommandNotAllowed(String),

    #[error("Command blocked: {0}")]
    CommandBlocked(String),

    #[error("Shell injection pattern in {0}")]
    ShellInjection(String),

    #[error("Path traversal detected: {0}")]
    PathTraversal(String),

    #[error("Unsafe path: {0}")]
    UnsafePath(String),

    #[error("Blocked path: {0}")]
    BlockedPath(String),

    #[error("Invalid security context: {0}")]
    InvalidContext(String),
}

impl From<SecurityError> for SupervisorError {
    fn from(err: SecurityError) -> Self {
        SupervisorError::Security(err.to_string())
    }
}

/// Command validation with allow/block lists and metacharacter screening
pub mod command_validation {
    use super::*;

    /// Characters that never appear in a legitimate command path
    pub const SHELL_METACHARACTERS: &[char] = &[
        ';', '|', '&', '`', '$', '(', ')', '{', '}', '[', ']', '<', '>', '"', '\'', '\\',
    ];

    /// Substrings rejected in arguments and environment values
    pub const INJECTION_PATTERNS: &[&str] = &[
        ";", "&", "|", "`", "$", "$(", "${", "&&", "||", ">>", "<<", "../",
    ];

    pub fn contains_shell_metacharacters(command: &str) -> bool {
        command.chars().any(|c| SHELL_METACHARACTERS.contains(&c))
    }

    pub fn contains_shell_injection(value: &str) -> bool {
        INJECTION_PATTERNS.iter().any(|p| value.contains(p))
    }

    /// Non-empty, no NUL, no shell metacharacters
    pub fn validate_command_syntax(command: &str) -> std::result::Result<(), SecurityError> {
        if command.trim().is_empty() {
            return Err(SecurityError::InvalidCommand("empty command".to_string()));
        }
        if command.contains('\0') {
            return Err(SecurityError::InvalidCommand(format!(
                "NUL byte in command {:?}",
                command
            )));
        }
        if contains_shell_metacharacters(command) {
            return Err(SecurityError::ShellInjection(format!("command {:?}", command)));
        }
        Ok(())
    }

    /// Allow-list (when non-empty) then block-list. Any of `names`
    /// (given and resolved forms) satisfies the allow-list; any of them
    /// on the block-list rejects.
    pub fn check_command_lists(
        names: &[&str],
        ctx: &SecurityContext,
    ) -> std::result::Result<(), SecurityError> {
        let display = names.first().copied().unwrap_or_default().to_string();
        if !ctx.allowed_commands.is_empty()
            && !names
                .iter()
                .any(|n| ctx.allowed_commands.iter().any(|a| a == n))
        {
            return Err(SecurityError::CommandNotAllowed(display));
        }
        if names
            .iter()
            .any(|n| ctx.blocked_commands.iter().any(|b| b == n))
        {
            return Err(SecurityError::CommandBlocked(display));
        }
        Ok(())
    }
}

/// Path validation for working directories and watch targets
pub mod path_validation {
    use super::*;

    /// Sensitive locations that are never acceptable as watch targets
    pub const BLOCKED_PATHS: &[&str] = &["/etc/passwd", "/etc/shadow", "/proc", "/sys", "/dev"];

    /// Absolute prefixes an absolute working directory must live under
    pub const SAFE_WORKING_DIR_PREFIXES: &[&str] = &["/tmp/", "/var/tmp/", "/home/", "/usr/local/"];

    /// `../`, `..\`, or a bare `..` component
    pub fn has_traversal(path: &str) -> bool {
        path.contains("../") || path.contains("..\\") || path.split('/').any(|c| c == "..")
    }

    /// `path` equals `prefix` or lives below it on a component boundary
    pub fn is_under(path: &str, prefix: &str) -> bool {
        let prefix = prefix.trim_end_matches('/');
        if prefix.is_empty() {
            return path.starts_with('/');
        }
        path == prefix
            || (path.starts_with(prefix) && path.as_bytes().get(prefix.len()) == Some(&b'/'))
    }

    pub fn is_blocked(path: &str, blocked: &[&str]) -> bool {
        blocked.iter().any(|b| is_under(path, b))
    }

    /// Working-directory rule: no traversal; absolute paths only under the
    /// safe prefixes; relative paths are accepted.
    pub fn is_safe_working_dir(path: &str) -> bool {
        if has_traversal(path) {
            return false;
        }
        if path.is_empty() || path.starts_with('/') {
            return SAFE_WORKING_DIR_PREFIXES
                .iter()
                .any(|prefix| path.starts_with(prefix) || path == prefix.trim_end_matches('/'));
        }
        true
    }

    /// Watch-target rule: absolute, no `..`, no `//`, not on the deny-list,
    /// under one of `safe_prefixes`.
    pub fn validate_watch_path(
        path: &str,
        safe_prefixes: &[String],
    ) -> std::result::Result<(), SecurityError> {
        if path.is_empty() || !path.starts_with('/') {
            return Err(SecurityError::UnsafePath(format!(
                "{} (must be absolute)",
                path
            )));
        }
        if path.contains("..") {
            return Err(SecurityError::PathTraversal(path.to_string()));
        }
        if path.contains("//") {
            return Err(SecurityError::UnsafePath(format!("{} (empty component)", path)));
        }
        if is_blocked(path, BLOCKED_PATHS) {
            return Err(SecurityError::BlockedPath(path.to_string()));
        }
        if !safe_prefixes.iter().any(|p| is_under(path, p)) {
            return Err(SecurityError::UnsafePath(format!(
                "{} (outside safe prefixes)",
                path
            )));
        }
        Ok(())
    }

    pub fn is_safe_watch_path(path: &str, safe_prefixes: &[String]) -> bool {
        validate_watch_path(path, safe_prefixes).is_ok()
    }
}

/// Identity the child switches to before exec
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentityPlan {
    pub uid: Option<u32>,
    pub gid: Option<u32>,
}

/// Validates process requests against a `SecurityContext` and derives the
/// child-side rlimit and identity plan.
#[derive(Debug)]
pub struct ProcessSecurityManager {
    audit: Arc<AuditLog>,
}

impl ProcessSecurityManager {
    pub fn new(audit: Arc<AuditLog>) -> Self {
        Self { audit }
    }

    fn reject(&self, conn: ConnectionId, err: SecurityError) -> SupervisorError {
        let event_type = match err {
            SecurityError::ShellInjection(_) => SecurityEventType::CommandInjectionAttempt,
            SecurityError::PathTraversal(_) => SecurityEventType::PathTraversalAttempt,
            SecurityError::UnsafePath(_) | SecurityError::BlockedPath(_) => {
                SecurityEventType::UnauthorizedPathAccess
            }
            SecurityError::InvalidContext(_) => SecurityEventType::InvalidSecurityContext,
            _ => SecurityEventType::CommandRejected,
        };
        self.audit
            .record(SecurityEvent::new(event_type, err.to_string()).with_connection(conn));
        err.into()
    }

    /// Non-zero memory and CPU budgets
    pub fn validate_context(&self, conn: ConnectionId, ctx: &SecurityContext) -> Result<()> {
        if ctx.max_memory == 0 {
            return Err(self.reject(
                conn,
                SecurityError::InvalidContext("max_memory is zero".to_string()),
            ));
        }
        if ctx.max_cpu_time == 0 {
            return Err(self.reject(
                conn,
                SecurityError::InvalidContext("max_cpu_time is zero".to_string()),
            ));
        }
        Ok(())
    }

    /// Syntax always; allow/block lists only when the sandbox is enabled
    pub fn validate_command(
        &self,
        conn: ConnectionId,
        command: &str,
        ctx: &SecurityContext,
    ) -> Result<()> {
        command_validation::validate_command_syntax(command).map_err(|e| self.reject(conn, e))?;
        if ctx.sandbox_enabled {
            command_validation::check_command_lists(&[command], ctx)
                .map_err(|e| self.reject(conn, e))?;
        }
        Ok(())
    }

    pub fn validate_arguments(&self, conn: ConnectionId, args: &[String]) -> Result<()> {
        for (i, arg) in args.iter().enumerate() {
            if arg.contains('\0') || command_validation::contains_shell_injection(arg) {
                return Err(self.reject(
                    conn,
                    SecurityError::ShellInjection(format!("argument {}: {:?}", i, arg)),
                ));
            }
        }
        Ok(())
    }

    pub fn validate_environment(
        &self,
        conn: ConnectionId,
        env: &[(String, String)],
    ) -> Result<()> {
        for (key, value) in env {
            if key.is_empty() || key.contains('=') || key.contains('\0') {
                return Err(self.reject(
                    conn,
                    SecurityError::InvalidCommand(format!("bad environment name {:?}", key)),
                ));
            }
            if value.contains('\0') || command_validation::contains_shell_injection(value) {
                return Err(self.reject(
                    conn,
                    SecurityError::ShellInjection(format!("environment {}", key)),
                ));
            }
        }
        Ok(())
    }

    /// Traversal check plus the context's allowed/blocked path prefixes
    pub fn validate_working_directory(
        &self,
        conn: ConnectionId,
        dir: &str,
        ctx: &SecurityContext,
    ) -> Result<()> {
        if dir.is_empty() {
            return Ok(());
        }
        if path_validation::has_traversal(dir) {
            return Err(self.reject(conn, SecurityError::PathTraversal(dir.to_string())));
        }
        let blocked: Vec<&str> = ctx.blocked_paths.iter().map(String::as_str).collect();
        if path_validation::is_blocked(dir, &blocked) {
            return Err(self.reject(conn, SecurityError::BlockedPath(dir.to_string())));
        }
        if !ctx.allowed_paths.is_empty()
            && !ctx
                .allowed_paths
                .iter()
                .any(|p| path_validation::is_under(dir, p))
        {
            return Err(self.reject(
                conn,
                SecurityError::UnsafePath(format!("{} (not in allowed paths)", dir)),
            ));
        }
        Ok(())
    }

    /// Full pre-spawn check of one process request
    pub fn validate_process(
        &self,
        conn: ConnectionId,
        command: &str,
        args: &[String],
        env: &[(String, String)],
        working_dir: &str,
        ctx: &SecurityContext,
    ) -> Result<()> {
        self.validate_context(conn, ctx)?;
        self.validate_command(conn, command, ctx)?;
        if ctx.sandbox_enabled {
            self.validate_arguments(conn, args)?;
            self.validate_environment(conn, env)?;
        }
        self.validate_working_directory(conn, working_dir, ctx)?;
        Ok(())
    }

    /// AS/CPU/NPROC/NOFILE limits; zero values are skipped
    pub fn child_rlimits(&self, ctx: &SecurityContext) -> Vec<RlimitSetting> {
        let mut limits = Vec::new();
        if ctx.max_memory > 0 {
            limits.push(RlimitSetting::fixed(RlimitResource::AddressSpace, ctx.max_memory));
        }
        if ctx.max_cpu_time > 0 {
            limits.push(RlimitSetting::fixed(RlimitResource::Cpu, ctx.max_cpu_time));
        }
        if ctx.max_processes > 0 {
            limits.push(RlimitSetting::fixed(RlimitResource::Processes, ctx.max_processes));
        }
        if ctx.max_open_files > 0 {
            limits.push(RlimitSetting::fixed(RlimitResource::OpenFiles, ctx.max_open_files));
        }
        limits
    }

    /// setgid/setuid targets; 0 means "leave unchanged"
    pub fn identity_plan(&self, ctx: &SecurityContext) -> IdentityPlan {
        if !ctx.drop_privileges {
            return IdentityPlan::default();
        }
        IdentityPlan {
            uid: (ctx.uid != 0).then_some(ctx.uid),
            gid: (ctx.gid != 0).then_some(ctx.gid),
        }
    }

    pub fn audit(&self) -> &Arc<AuditLog> {
        &self.audit
    }
}
