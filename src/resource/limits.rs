//! Resource limit vocabulary: limit types, sandbox modes, enforcement
//! actions, and the `soft:hard:action` specification grammar.

use crate::config::types::{Result, SupervisorError};
use crate::kernel::rlimit::{RlimitResource, RlimitSetting};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ResourceLimitType {
    /// Seconds of CPU time
    CpuTime = 0,
    /// Percent of one CPU over the last sampling interval
    CpuPercent = 1,
    /// Bytes of virtual address space
    MemoryVirtual = 2,
    /// Bytes of resident memory
    MemoryRss = 3,
    FileDescriptors = 4,
    /// Largest file the process may write, in bytes
    FileSize = 5,
    /// Scheduling priority; the hard value is the nice level
    NiceValue = 6,
    /// Seconds since limits were applied
    WallTime = 7,
}

impl ResourceLimitType {
    pub fn code(&self) -> u8 {
        *self as u8
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceLimitType::CpuTime => "cpu_time",
            ResourceLimitType::CpuPercent => "cpu_percent",
            ResourceLimitType::MemoryVirtual => "memory_virtual",
            ResourceLimitType::MemoryRss => "memory_rss",
            ResourceLimitType::FileDescriptors => "file_descriptors",
            ResourceLimitType::FileSize => "file_size",
            ResourceLimitType::NiceValue => "nice_value",
            ResourceLimitType::WallTime => "wall_time",
        }
    }

    pub fn all() -> [ResourceLimitType; 8] {
        [
            ResourceLimitType::CpuTime,
            ResourceLimitType::CpuPercent,
            ResourceLimitType::MemoryVirtual,
            ResourceLimitType::MemoryRss,
            ResourceLimitType::FileDescriptors,
            ResourceLimitType::FileSize,
            ResourceLimitType::NiceValue,
            ResourceLimitType::WallTime,
        ]
    }

    /// Kernel rlimit backing this type, if any
    pub fn rlimit_resource(&self) -> Option<RlimitResource> {
        match self {
            ResourceLimitType::CpuTime => Some(RlimitResource::Cpu),
            ResourceLimitType::MemoryVirtual => Some(RlimitResource::AddressSpace),
            ResourceLimitType::FileDescriptors => Some(RlimitResource::OpenFiles),
            ResourceLimitType::FileSize => Some(RlimitResource::FileSize),
            _ => None,
        }
    }
}

impl std::fmt::Display for ResourceLimitType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ResourceLimitType {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cpu" | "cpu_time" => Ok(ResourceLimitType::CpuTime),
            "cpu_percent" => Ok(ResourceLimitType::CpuPercent),
            "memory" | "memory_virtual" => Ok(ResourceLimitType::MemoryVirtual),
            "rss" | "memory_rss" => Ok(ResourceLimitType::MemoryRss),
            "fds" | "file_descriptors" => Ok(ResourceLimitType::FileDescriptors),
            "file_size" => Ok(ResourceLimitType::FileSize),
            "nice" | "nice_value" => Ok(ResourceLimitType::NiceValue),
            "wall" | "wall_time" => Ok(ResourceLimitType::WallTime),
            other => Err(SupervisorError::Validation(format!(
                "unknown resource limit type: {}",
                other
            ))),
        }
    }
}

/// Process isolation level, each mode including the ones below it
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub enum SandboxMode {
    #[default]
    None,
    /// Path allow/block checks
    Basic,
    /// Adds no_new_privs
    Restricted,
    /// Adds chroot
    Isolated,
    /// Adds core-dump suppression and a mandatory path allow-list
    Strict,
}

impl SandboxMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxMode::None => "none",
            SandboxMode::Basic => "basic",
            SandboxMode::Restricted => "restricted",
            SandboxMode::Isolated => "isolated",
            SandboxMode::Strict => "strict",
        }
    }
}

impl std::fmt::Display for SandboxMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SandboxMode {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "none" => Ok(SandboxMode::None),
            "basic" => Ok(SandboxMode::Basic),
            "restricted" => Ok(SandboxMode::Restricted),
            "isolated" => Ok(SandboxMode::Isolated),
            "strict" => Ok(SandboxMode::Strict),
            other => Err(SupervisorError::Validation(format!(
                "unknown sandbox mode: {}",
                other
            ))),
        }
    }
}

/// What happens when a hard limit is crossed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EnforcementAction {
    #[default]
    Warn,
    /// SIGSTOP
    Throttle,
    /// SIGSTOP, recorded so `resume` can undo it
    Suspend,
    /// SIGTERM, then SIGKILL after the grace period
    Terminate,
}

impl EnforcementAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnforcementAction::Warn => "warn",
            EnforcementAction::Throttle => "throttle",
            EnforcementAction::Suspend => "suspend",
            EnforcementAction::Terminate => "terminate",
        }
    }
}

impl std::fmt::Display for EnforcementAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EnforcementAction {
    type Err = SupervisorError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "warn" => Ok(EnforcementAction::Warn),
            "throttle" => Ok(EnforcementAction::Throttle),
            "suspend" => Ok(EnforcementAction::Suspend),
            "terminate" => Ok(EnforcementAction::Terminate),
            other => Err(SupervisorError::Validation(format!(
                "unknown enforcement action: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceLimit {
    pub limit_type: ResourceLimitType,
    /// Warning threshold; 0 disables the warning
    pub soft_limit: f64,
    pub hard_limit: f64,
    pub action: EnforcementAction,
    pub enabled: bool,
    pub description: String,
}

impl ResourceLimit {
    pub fn new(
        limit_type: ResourceLimitType,
        soft_limit: f64,
        hard_limit: f64,
        action: EnforcementAction,
    ) -> Result<Self> {
        validate_limit(limit_type, soft_limit, hard_limit)?;
        Ok(Self {
            limit_type,
            soft_limit,
            hard_limit,
            action,
            enabled: true,
            description: describe_limit(limit_type, hard_limit),
        })
    }

    /// Kernel rlimit equivalent. The hard value is used for both the soft
    /// and hard rlimit; the soft threshold is only a monitoring warning.
    pub fn to_rlimit(&self) -> Option<RlimitSetting> {
        if !self.enabled {
            return None;
        }
        let resource = self.limit_type.rlimit_resource()?;
        Some(RlimitSetting::fixed(resource, self.hard_limit.ceil() as u64))
    }
}

fn validate_limit(limit_type: ResourceLimitType, soft: f64, hard: f64) -> Result<()> {
    if !soft.is_finite() || !hard.is_finite() {
        return Err(SupervisorError::Validation(format!(
            "{} limit must be finite",
            limit_type
        )));
    }
    if limit_type == ResourceLimitType::NiceValue {
        if !(-20.0..=19.0).contains(&hard) {
            return Err(SupervisorError::Validation(format!(
                "nice value {} outside -20..=19",
                hard
            )));
        }
        return Ok(());
    }
    if hard <= 0.0 {
        return Err(SupervisorError::Validation(format!(
            "{} hard limit must be positive",
            limit_type
        )));
    }
    if soft < 0.0 || soft > hard {
        return Err(SupervisorError::Validation(format!(
            "{} soft limit {} must be within 0..={}",
            limit_type, soft, hard
        )));
    }
    Ok(())
}

/// Human-readable summary of a limit
pub fn describe_limit(limit_type: ResourceLimitType, value: f64) -> String {
    match limit_type {
        ResourceLimitType::CpuTime => format!("CPU time limit: {} seconds", value),
        ResourceLimitType::CpuPercent => format!("CPU usage limit: {}%", value),
        ResourceLimitType::MemoryVirtual => {
            format!("Virtual memory limit: {} MB", value / (1024.0 * 1024.0))
        }
        ResourceLimitType::MemoryRss => {
            format!("Resident memory limit: {} MB", value / (1024.0 * 1024.0))
        }
        ResourceLimitType::FileDescriptors => {
            format!("File descriptor limit: {}", value as i64)
        }
        ResourceLimitType::FileSize => format!("File size limit: {} bytes", value as u64),
        ResourceLimitType::NiceValue => format!("Nice value: {}", value as i32),
        ResourceLimitType::WallTime => format!("Wall time limit: {} seconds", value),
    }
}

/// Parsed `soft:hard:action`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitSpec {
    pub soft: f64,
    pub hard: f64,
    pub action: EnforcementAction,
}

fn limit_spec_regex() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, regex::Error>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^(?:(\d+(?:\.\d+)?):)?(\d+(?:\.\d+)?):?(\w+)?$"))
        .as_ref()
        .map_err(|e| SupervisorError::Config(format!("limit spec pattern: {}", e)))
}

/// Parse `hard`, `hard:action`, `soft:hard` or `soft:hard:action`.
///
/// Soft defaults to 0 and action to warn. The result is valid only when
/// hard > 0 and soft <= hard.
pub fn parse_limit_spec(spec: &str) -> Result<LimitSpec> {
    let caps = limit_spec_regex()?
        .captures(spec.trim())
        .ok_or_else(|| SupervisorError::Validation(format!("malformed limit spec: {:?}", spec)))?;

    let number = |s: &str| {
        s.parse::<f64>()
            .map_err(|e| SupervisorError::Validation(format!("bad number {:?}: {}", s, e)))
    };
    let soft = match caps.get(1) {
        Some(m) => number(m.as_str())?,
        None => 0.0,
    };
    let hard = match caps.get(2) {
        Some(m) => number(m.as_str())?,
        None => {
            return Err(SupervisorError::Validation(format!(
                "limit spec {:?} has no hard value",
                spec
            )))
        }
    };
    let action = match caps.get(3) {
        Some(m) => m.as_str().parse::<EnforcementAction>()?,
        None => EnforcementAction::Warn,
    };

    if hard <= 0.0 || soft > hard {
        return Err(SupervisorError::Validation(format!(
            "limit spec {:?} requires hard > 0 and soft <= hard",
            spec
        )));
    }
    Ok(LimitSpec { soft, hard, action })
}

pub fn is_valid_limit_spec(spec: &str) -> bool {
    parse_limit_spec(spec).is_ok()
}
