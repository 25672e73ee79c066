//! Resource limits, usage accounting and sandbox path policy

pub mod accounting;
pub mod limits;
pub mod manager;

pub use accounting::{AccountingReader, ProcAccountingReader, ResourceUsage};
pub use limits::{
    is_valid_limit_spec, parse_limit_spec, EnforcementAction, LimitSpec, ResourceLimit,
    ResourceLimitType, SandboxMode,
};
pub use manager::{ChildResourcePlan, ProcessResourceConfig, ResourceManager};
