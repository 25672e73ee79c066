// Config Validation
// Startup validation for SupervisorConfig: errors are fatal for init, warnings are logged.

use crate::config::types::{
    EventConfig, ExecutorConfig, FileMonitorConfig, ProcessManagerConfig, ResourceManagerConfig,
    Result, SecurityContext, SupervisorConfig, SupervisorError,
};
use std::path::Path;

/// Validation result with detailed errors
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn add_error(&mut self, error: String) {
        self.valid = false;
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }
}

/// Validate the aggregate config; any error fails the call
pub fn validate_config(config: &SupervisorConfig) -> Result<ValidationResult> {
    let mut result = ValidationResult::new();

    validate_process(&config.process, &mut result);
    validate_executor(&config.executor, &mut result);
    validate_resources(&config.resources, &mut result);
    validate_events(&config.events, &mut result);
    validate_files(&config.files, &mut result);

    if let Some(ref path) = config.audit_log_path {
        if let Some(parent) = Path::new(path).parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                result.add_warning(format!(
                    "audit log directory does not exist and will be created: {}",
                    parent.display()
                ));
            }
        }
    }

    for warning in &result.warnings {
        log::warn!("config: {}", warning);
    }

    if !result.is_valid() {
        return Err(SupervisorError::Config(format!(
            "Config validation failed:\n{}",
            result.errors.join("\n")
        )));
    }

    Ok(result)
}

fn validate_process(config: &ProcessManagerConfig, result: &mut ValidationResult) {
    if config.max_processes == 0 {
        result.add_error("process.max_processes cannot be zero".to_string());
    }
    if config.default_timeout_secs == 0 {
        result.add_error("process.default_timeout_secs cannot be zero".to_string());
    }
    if config.buffer_size == 0 {
        result.add_error("process.buffer_size cannot be zero".to_string());
    }
    if config.monitor_interval_ms == 0 || config.fast_monitor_interval_ms == 0 {
        result.add_error("process monitor intervals cannot be zero".to_string());
    }
    if config.fast_monitor_interval_ms > config.monitor_interval_ms {
        result.add_warning(format!(
            "process.fast_monitor_interval_ms ({}) exceeds monitor_interval_ms ({})",
            config.fast_monitor_interval_ms, config.monitor_interval_ms
        ));
    }
}

fn validate_executor(config: &ExecutorConfig, result: &mut ValidationResult) {
    if config.max_concurrent == 0 {
        result.add_error("executor.max_concurrent cannot be zero".to_string());
    }
    if config.max_queue_size == 0 {
        result.add_error("executor.max_queue_size cannot be zero".to_string());
    }
    if config.max_history_size == 0 {
        result.add_error("executor.max_history_size cannot be zero".to_string());
    }
    if config.min_timeout_secs == 0 {
        result.add_error("executor.min_timeout_secs cannot be zero".to_string());
    }
    if config.max_timeout_secs < config.min_timeout_secs {
        result.add_error(format!(
            "executor.max_timeout_secs ({}) must be >= min_timeout_secs ({})",
            config.max_timeout_secs, config.min_timeout_secs
        ));
    }
    if config.worker_threads > config.max_concurrent {
        result.add_warning(format!(
            "executor.worker_threads ({}) exceeds max_concurrent ({}); extra workers stay idle",
            config.worker_threads, config.max_concurrent
        ));
    }
    validate_security_context(&config.default_security, "executor.default_security", result);
}

/// Validate a security context in isolation
pub fn validate_security_context(ctx: &SecurityContext, label: &str, result: &mut ValidationResult) {
    if ctx.max_memory == 0 {
        result.add_error(format!("{}.max_memory cannot be zero", label));
    } else if ctx.max_memory < 1024 * 1024 {
        result.add_warning(format!(
            "{}.max_memory {} is very low (< 1MB), most programs will fail to start",
            label, ctx.max_memory
        ));
    }
    if ctx.max_cpu_time == 0 {
        result.add_error(format!("{}.max_cpu_time cannot be zero", label));
    }
    for command in ctx.allowed_commands.iter().chain(ctx.blocked_commands.iter()) {
        if !command.starts_with('/') {
            result.add_warning(format!(
                "{} lists non-absolute command '{}'; it will never match a resolved path",
                label, command
            ));
        }
    }
    if ctx.drop_privileges && (ctx.uid == 0 || ctx.gid == 0) {
        result.add_warning(format!(
            "{}.drop_privileges is set but uid/gid is 0; identity will not change",
            label
        ));
    }
}

fn validate_resources(config: &ResourceManagerConfig, result: &mut ValidationResult) {
    if config.monitor_interval_ms == 0 {
        result.add_error("resources.monitor_interval_ms cannot be zero".to_string());
    }
    if config.history_size == 0 {
        result.add_error("resources.history_size cannot be zero".to_string());
    }
}

fn validate_events(config: &EventConfig, result: &mut ValidationResult) {
    if config.max_pending_events == 0 {
        result.add_error("events.max_pending_events cannot be zero".to_string());
    }
    if config.max_connection_events == 0 {
        result.add_error("events.max_connection_events cannot be zero".to_string());
    }
}

fn validate_files(config: &FileMonitorConfig, result: &mut ValidationResult) {
    if config.max_watches == 0 {
        result.add_error("files.max_watches cannot be zero".to_string());
    }
    if config.max_events_per_drain == 0 {
        result.add_error("files.max_events_per_drain cannot be zero".to_string());
    }
    for prefix in &config.safe_prefixes {
        if !prefix.starts_with('/') {
            result.add_error(format!("files.safe_prefixes entry must be absolute: {}", prefix));
        }
    }
}

/// Report kernel facilities that are missing on this host
pub fn check_system_capabilities() -> Vec<String> {
    let mut missing = Vec::new();

    #[cfg(target_os = "linux")]
    {
        if !Path::new("/proc/self/stat").exists() {
            missing.push("procfs not mounted; resource sampling disabled".to_string());
        }
        if !Path::new("/proc/sys/fs/inotify").exists() {
            missing.push("inotify not available; file watches disabled".to_string());
        }
    }

    #[cfg(not(target_os = "linux"))]
    {
        missing.push("Linux-only features not available on this platform".to_string());
    }

    missing
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_default_config() {
        let config = SupervisorConfig::default();
        let result = validate_config(&config);
        assert!(result.is_ok());
        assert!(result.unwrap().is_valid());
    }

    #[test]
    fn test_zero_queue_rejected() {
        let mut config = SupervisorConfig::default();
        config.executor.max_queue_size = 0;
        let err = validate_config(&config).unwrap_err();
        assert!(err.to_string().contains("max_queue_size"));
    }

    #[test]
    fn test_inverted_timeout_bounds_rejected() {
        let mut config = SupervisorConfig::default();
        config.executor.min_timeout_secs = 10;
        config.executor.max_timeout_secs = 5;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_zero_memory_context_rejected() {
        let mut result = ValidationResult::new();
        let ctx = SecurityContext {
            max_memory: 0,
            ..SecurityContext::default()
        };
        validate_security_context(&ctx, "ctx", &mut result);
        assert!(!result.is_valid());
        assert!(result.errors[0].contains("max_memory"));
    }

    #[test]
    fn test_relative_safe_prefix_rejected() {
        let mut config = SupervisorConfig::default();
        config.files.safe_prefixes.push("tmp".to_string());
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_low_memory_is_warning_only() {
        let mut config = SupervisorConfig::default();
        config.executor.default_security.max_memory = 4096;
        let result = validate_config(&config).unwrap();
        assert!(result.is_valid());
        assert!(!result.warnings.is_empty());
    }
}
