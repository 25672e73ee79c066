/// Security presets
///
/// Immutable starting points for `SecurityContext`. Callers clone a preset and
/// widen it explicitly rather than starting from a permissive default.
use crate::config::types::SecurityContext;

/// Commands the restricted preset allows
pub const RESTRICTED_COMMANDS: &[&str] = &[
    "/bin/echo",
    "/bin/cat",
    "/bin/ls",
    "/bin/pwd",
    "/usr/bin/wc",
    "/usr/bin/head",
    "/usr/bin/tail",
];

/// Tight policy for untrusted callers: a handful of read-only utilities,
/// small memory and CPU budgets, sandbox on.
pub fn restricted_security_context() -> SecurityContext {
    SecurityContext {
        sandbox_enabled: true,
        allowed_commands: RESTRICTED_COMMANDS.iter().map(|c| c.to_string()).collect(),
        drop_privileges: true,
        max_memory: 50 * 1024 * 1024, // 50MB
        max_cpu_time: 10,
        max_processes: 5,
        max_open_files: 32,
        ..SecurityContext::default()
    }
}

/// Policy for trusted in-process tooling: no allow-list, generous limits
pub fn trusted_security_context() -> SecurityContext {
    SecurityContext {
        sandbox_enabled: false,
        drop_privileges: false,
        max_memory: 1024 * 1024 * 1024, // 1GB
        max_cpu_time: 3600,
        max_processes: 256,
        max_open_files: 1024,
        ..SecurityContext::default()
    }
}

/// Look up a preset by name
pub fn get_preset(name: &str) -> Option<SecurityContext> {
    match name {
        "restricted" => Some(restricted_security_context()),
        "trusted" => Some(trusted_security_context()),
        "default" => Some(SecurityContext::default()),
        _ => None,
    }
}

/// Names accepted by `get_preset`
pub fn list_presets() -> Vec<&'static str> {
    vec!["default", "restricted", "trusted"]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_restricted_preset() {
        let ctx = restricted_security_context();
        assert_eq!(ctx.max_memory, 50 * 1024 * 1024);
        assert_eq!(ctx.max_cpu_time, 10);
        assert_eq!(ctx.max_processes, 5);
        assert_eq!(ctx.max_open_files, 32);
        assert!(ctx.allowed_commands.contains(&"/bin/echo".to_string()));
        assert_eq!(ctx.allowed_commands.len(), 7);
    }

    #[test]
    fn test_preset_lookup() {
        for name in list_presets() {
            assert!(get_preset(name).is_some(), "missing preset {}", name);
        }
        assert!(get_preset("nonexistent").is_none());
    }
}
