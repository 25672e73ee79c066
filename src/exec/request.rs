//! Command requests and results exchanged with the executor.

use crate::config::types::{
    ConnectionId, ExitClass, SecurityContext, StringMap, EXIT_INTERNAL_FAILURE, EXIT_PENDING,
};
use crate::resource::accounting::ResourceUsage;
use crate::utils::output::OutputIntegrity;
use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Default per-request timeout (seconds)
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// `cmd_` followed by 16 lowercase hex characters
pub fn generate_request_id() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    format!("cmd_{}", &simple[..16])
}

pub fn is_request_id(id: &str) -> bool {
    id.strip_prefix("cmd_").map_or(false, |hex| {
        hex.len() == 16 && hex.chars().all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
    })
}

/// One execution ask. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandRequest {
    pub request_id: String,
    pub connection_id: ConnectionId,
    pub command: String,
    pub args: Vec<String>,
    pub env: StringMap,
    pub working_dir: String,
    /// Written to stdin, which is then closed
    pub input_data: Option<String>,
    pub timeout_seconds: u64,
    pub capture_output: bool,
    pub async_exec: bool,
    /// Carried for callers; the queue itself is FIFO
    pub priority: i32,
    pub success_callback: Option<String>,
    pub error_callback: Option<String>,
    pub progress_callback: Option<String>,
    /// `None` uses the executor's default context
    pub security: Option<SecurityContext>,
    pub requester: Option<String>,
    pub created_at: SystemTime,
}

impl Default for CommandRequest {
    fn default() -> Self {
        Self {
            request_id: generate_request_id(),
            connection_id: 0,
            command: String::new(),
            args: Vec::new(),
            env: StringMap::new(),
            working_dir: String::new(),
            input_data: None,
            timeout_seconds: DEFAULT_TIMEOUT_SECS,
            capture_output: true,
            async_exec: false,
            priority: 0,
            success_callback: None,
            error_callback: None,
            progress_callback: None,
            security: None,
            requester: None,
            created_at: SystemTime::now(),
        }
    }
}

impl CommandRequest {
    pub fn new(connection_id: ConnectionId, command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            connection_id,
            command: command.into(),
            args,
            ..Self::default()
        }
    }

    /// Environment as sorted pairs, the shape the spawn path consumes
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        let mut pairs: Vec<(String, String)> =
            self.env.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        pairs.sort();
        pairs
    }
}

/// Outcome of one request. Created exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub request_id: String,
    pub connection_id: ConnectionId,
    pub command: String,
    pub pid: i32,
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub stdout_integrity: OutputIntegrity,
    pub stderr_integrity: OutputIntegrity,
    pub error_message: String,
    pub start_time: SystemTime,
    pub end_time: SystemTime,
    pub execution_time_ms: u64,
    pub resource_usage: Option<ResourceUsage>,
    /// Success or error callback name, whichever applies
    pub callback: Option<String>,
    pub progress_callback: Option<String>,
    pub timed_out: bool,
    pub cancelled: bool,
}

impl CommandResult {
    /// Empty result for `request`, started now
    pub fn started(request: &CommandRequest) -> Self {
        let now = SystemTime::now();
        Self {
            request_id: request.request_id.clone(),
            connection_id: request.connection_id,
            command: request.command.clone(),
            pid: -1,
            success: false,
            exit_code: EXIT_PENDING,
            stdout: String::new(),
            stderr: String::new(),
            stdout_integrity: OutputIntegrity::NotCaptured,
            stderr_integrity: OutputIntegrity::NotCaptured,
            error_message: String::new(),
            start_time: now,
            end_time: now,
            execution_time_ms: 0,
            resource_usage: None,
            callback: None,
            progress_callback: request.progress_callback.clone(),
            timed_out: false,
            cancelled: false,
        }
    }

    /// Stamp the end time, derive duration and pick the callback
    pub fn finish(&mut self, request: &CommandRequest) {
        self.end_time = SystemTime::now();
        self.execution_time_ms = self
            .end_time
            .duration_since(self.start_time)
            .unwrap_or_default()
            .as_millis() as u64;
        self.callback = if self.success {
            request.success_callback.clone()
        } else {
            request.error_callback.clone()
        };
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.success = false;
        self.error_message = message.into();
        if self.exit_code == EXIT_PENDING {
            self.exit_code = EXIT_INTERNAL_FAILURE;
        }
    }

    pub fn exit_class(&self) -> ExitClass {
        ExitClass::from_code(self.exit_code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_ids_are_unique_and_well_formed() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_ne!(a, b);
        assert!(is_request_id(&a), "{}", a);
        assert!(!is_request_id("cmd_XYZ"));
        assert!(!is_request_id("job_0123456789abcdef"));
    }

    #[test]
    fn test_env_pairs_sorted() {
        let mut req = CommandRequest::new(1, "/bin/env", vec![]);
        req.env.insert("B".into(), "2".into());
        req.env.insert("A".into(), "1".into());
        assert_eq!(
            req.env_pairs(),
            vec![("A".to_string(), "1".to_string()), ("B".to_string(), "2".to_string())]
        );
    }

    #[test]
    fn test_finish_picks_callback() {
        let mut req = CommandRequest::new(1, "/bin/true", vec![]);
        req.success_callback = Some("on_done".into());
        req.error_callback = Some("on_fail".into());

        let mut ok = CommandResult::started(&req);
        ok.success = true;
        ok.exit_code = 0;
        ok.finish(&req);
        assert_eq!(ok.callback.as_deref(), Some("on_done"));

        let mut failed = CommandResult::started(&req);
        failed.fail("boom");
        failed.finish(&req);
        assert_eq!(failed.callback.as_deref(), Some("on_fail"));
        assert_eq!(failed.exit_class(), ExitClass::InternalFailure);
    }
}
