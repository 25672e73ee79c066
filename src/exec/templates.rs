//! Named command templates with `${param}` expansion.

use crate::config::types::{ConnectionId, Result, SecurityContext, StringMap, SupervisorError};
use crate::exec::request::{CommandRequest, DEFAULT_TIMEOUT_SECS};
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommandTemplate {
    pub name: String,
    /// Command path, may contain `${param}` placeholders
    pub command_pattern: String,
    pub default_args: Vec<String>,
    pub default_env: StringMap,
    pub security: Option<SecurityContext>,
    pub default_timeout: u64,
    pub description: String,
}

impl Default for CommandTemplate {
    fn default() -> Self {
        Self {
            name: String::new(),
            command_pattern: String::new(),
            default_args: Vec::new(),
            default_env: StringMap::new(),
            security: None,
            default_timeout: DEFAULT_TIMEOUT_SECS,
            description: String::new(),
        }
    }
}

fn placeholder_regex() -> Result<&'static Regex> {
    static RE: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{(\w+)\}"))
        .as_ref()
        .map_err(|e| SupervisorError::Config(format!("placeholder pattern: {}", e)))
}

/// Replace `${name}` with `params[name]`; unknown names stay literal
pub fn expand_params(pattern: &str, params: &StringMap) -> Result<String> {
    let re = placeholder_regex()?;
    Ok(re
        .replace_all(pattern, |caps: &Captures| match params.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned())
}

impl CommandTemplate {
    pub fn new(name: impl Into<String>, command_pattern: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command_pattern: command_pattern.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(SupervisorError::Validation("template name is empty".to_string()));
        }
        if self.command_pattern.trim().is_empty() {
            return Err(SupervisorError::Validation(format!(
                "template {} has an empty command",
                self.name
            )));
        }
        Ok(())
    }

    /// Build a request for `conn` with `params` substituted into the
    /// command and default arguments
    pub fn instantiate(&self, conn: ConnectionId, params: &StringMap) -> Result<CommandRequest> {
        let command = expand_params(&self.command_pattern, params)?;
        let args = self
            .default_args
            .iter()
            .map(|arg| expand_params(arg, params))
            .collect::<Result<Vec<_>>>()?;
        let mut request = CommandRequest::new(conn, command, args);
        request.env = self.default_env.clone();
        request.security = self.security.clone();
        request.timeout_seconds = self.default_timeout;
        request.requester = Some(format!("template:{}", self.name));
        Ok(request)
    }
}
