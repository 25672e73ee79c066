/// Security audit log for procwarden
/// Structured record of policy decisions: rejected commands, unsafe paths,
/// limit enforcement, timeouts. Each event is mirrored to the `log` facade
/// and, when a path is configured, appended as one JSON line to the audit file.
use crate::config::types::{ConnectionId, Result, SupervisorError};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::SystemTime;

/// Security event severity levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecuritySeverity {
    Critical,
    High,
    Medium,
    Low,
}

/// Types of security events we track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityEventType {
    // Validation
    CommandRejected,
    CommandInjectionAttempt,
    PathTraversalAttempt,
    UnauthorizedPathAccess,
    InvalidSecurityContext,

    // Runtime enforcement
    SoftLimitExceeded,
    HardLimitEnforced,
    ProcessTimedOut,
    ForcedKill,
    PrivilegeDropFailed,
}

impl SecurityEventType {
    pub fn default_severity(&self) -> SecuritySeverity {
        match self {
            SecurityEventType::CommandInjectionAttempt
            | SecurityEventType::PathTraversalAttempt => SecuritySeverity::High,
            SecurityEventType::PrivilegeDropFailed => SecuritySeverity::Critical,
            SecurityEventType::CommandRejected
            | SecurityEventType::UnauthorizedPathAccess
            | SecurityEventType::HardLimitEnforced
            | SecurityEventType::ForcedKill => SecuritySeverity::Medium,
            SecurityEventType::InvalidSecurityContext
            | SecurityEventType::SoftLimitExceeded
            | SecurityEventType::ProcessTimedOut => SecuritySeverity::Low,
        }
    }
}

/// One audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub timestamp: SystemTime,
    pub event_type: SecurityEventType,
    pub severity: SecuritySeverity,
    pub details: String,
    pub connection_id: Option<ConnectionId>,
    pub request_id: Option<String>,
    pub pid: Option<i32>,
    pub command: Option<String>,
    pub path: Option<String>,
}

impl SecurityEvent {
    pub fn new(event_type: SecurityEventType, details: impl Into<String>) -> Self {
        Self {
            timestamp: SystemTime::now(),
            event_type,
            severity: event_type.default_severity(),
            details: details.into(),
            connection_id: None,
            request_id: None,
            pid: None,
            command: None,
            path: None,
        }
    }

    pub fn with_connection(mut self, conn: ConnectionId) -> Self {
        self.connection_id = Some(conn);
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    pub fn with_pid(mut self, pid: i32) -> Self {
        self.pid = Some(pid);
        self
    }

    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_severity(mut self, severity: SecuritySeverity) -> Self {
        self.severity = severity;
        self
    }
}

/// Audit sink shared by every subsystem of one supervisor
#[derive(Debug)]
pub struct AuditLog {
    audit_file: Option<Mutex<File>>,
    audit_path: Option<PathBuf>,
    recorded: Mutex<Vec<SecurityEvent>>,
    retain: usize,
}

impl AuditLog {
    /// Log through `log` only
    pub fn disabled() -> Self {
        Self {
            audit_file: None,
            audit_path: None,
            recorded: Mutex::new(Vec::new()),
            retain: 256,
        }
    }

    /// Also append JSON lines to `audit_path`
    pub fn with_file(audit_path: PathBuf) -> Result<Self> {
        if let Some(parent) = audit_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    SupervisorError::Config(format!("Failed to create audit log directory: {}", e))
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&audit_path)
            .map_err(|e| SupervisorError::Config(format!("Failed to open audit log: {}", e)))?;

        Ok(Self {
            audit_file: Some(Mutex::new(file)),
            audit_path: Some(audit_path),
            recorded: Mutex::new(Vec::new()),
            retain: 256,
        })
    }

    pub fn record(&self, event: SecurityEvent) {
        let mut entry = serde_json::json!({
            "timestamp": event.timestamp
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs(),
            "event_type": event.event_type,
            "severity": event.severity,
            "details": event.details,
            "process_id": std::process::id(),
        });
        if let Some(conn) = event.connection_id {
            entry["connection_id"] = serde_json::json!(conn);
        }
        if let Some(ref request_id) = event.request_id {
            entry["request_id"] = serde_json::json!(request_id);
        }
        if let Some(pid) = event.pid {
            entry["pid"] = serde_json::json!(pid);
        }
        if let Some(ref command) = event.command {
            entry["command"] = serde_json::json!(command);
        }
        if let Some(ref path) = event.path {
            entry["path"] = serde_json::json!(path);
        }

        match event.severity {
            SecuritySeverity::Critical | SecuritySeverity::High => {
                error!("SECURITY {:?}: {:?} - {}", event.severity, event.event_type, event.details)
            }
            SecuritySeverity::Medium => {
                warn!("SECURITY {:?}: {:?} - {}", event.severity, event.event_type, event.details)
            }
            SecuritySeverity::Low => {
                info!("SECURITY {:?}: {:?} - {}", event.severity, event.event_type, event.details)
            }
        }

        if let Some(ref file) = self.audit_file {
            let mut file = file.lock().unwrap_or_else(|p| p.into_inner());
            if let Err(e) = writeln!(file, "{}", entry) {
                error!("Failed to write to audit log: {}", e);
            }
            if let Err(e) = file.flush() {
                error!("Failed to flush audit log: {}", e);
            }
        }

        let mut recorded = self.recorded.lock().unwrap_or_else(|p| p.into_inner());
        if recorded.len() >= self.retain {
            recorded.remove(0);
        }
        recorded.push(event);
    }

    /// Most recent events, oldest first
    pub fn recent(&self) -> Vec<SecurityEvent> {
        self.recorded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn count_of(&self, event_type: SecurityEventType) -> usize {
        self.recorded
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }

    pub fn audit_path(&self) -> Option<&PathBuf> {
        self.audit_path.as_ref()
    }
}

impl Default for AuditLog {
    fn default() -> Self {
        Self::disabled()
    }
}
