//! Observability
//!
//! Security audit trail and supervisor counters.

pub mod audit;
pub mod metrics;
