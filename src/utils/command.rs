//! Command-line helpers: PATH lookup, executable checks, splitting and quoting.

use std::path::{Path, PathBuf};

/// True when `path` names a file the caller may execute (access X_OK)
pub fn is_executable_file(path: &Path) -> bool {
    if !path.is_file() {
        return false;
    }
    nix::unistd::access(path, nix::unistd::AccessFlags::X_OK).is_ok()
}

/// Resolve a bare command name against a PATH-style list
pub fn find_command_in(command: &str, search_path: &str) -> Option<PathBuf> {
    if command.is_empty() || command.contains('/') {
        return None;
    }
    search_path
        .split(':')
        .filter(|dir| !dir.is_empty())
        .map(|dir| Path::new(dir).join(command))
        .find(|candidate| is_executable_file(candidate))
}

/// Resolve a bare command name against the current `PATH`
pub fn find_command_in_path(command: &str) -> Option<PathBuf> {
    let search_path = std::env::var("PATH").ok()?;
    find_command_in(command, &search_path)
}

/// Resolve `command` to an executable path.
///
/// Commands containing '/' are taken as given; bare names go through `PATH`.
pub fn resolve_command(command: &str) -> Option<PathBuf> {
    if command.contains('/') {
        let path = PathBuf::from(command);
        if is_executable_file(&path) {
            Some(path)
        } else {
            None
        }
    } else {
        find_command_in_path(command)
    }
}

/// Whitespace split; no quoting rules
pub fn parse_command_line(cmdline: &str) -> Vec<String> {
    cmdline.split_whitespace().map(str::to_string).collect()
}

/// Backslash-escape characters a POSIX shell treats specially in double quotes
pub fn escape_argument(arg: &str) -> String {
    let mut escaped = String::with_capacity(arg.len());
    for c in arg.chars() {
        if matches!(c, '\\' | '"' | '\'' | '`' | '$') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Join a command and its arguments for display in logs
pub fn format_command(command: &str, args: &[String]) -> String {
    let mut out = command.to_string();
    for arg in args {
        out.push(' ');
        if arg.is_empty() || arg.chars().any(char::is_whitespace) {
            out.push('"');
            out.push_str(&escape_argument(arg));
            out.push('"');
        } else {
            out.push_str(arg);
        }
    }
    out
}

/// Prefix `base_dir` onto a relative path; absolute paths pass through
pub fn resolve_relative_path(path: &str, base_dir: &str) -> String {
    if path.is_empty() || path.starts_with('/') {
        return path.to_string();
    }
    let mut result = base_dir.to_string();
    if !result.is_empty() && !result.ends_with('/') {
        result.push('/');
    }
    result.push_str(path);
    result
}
