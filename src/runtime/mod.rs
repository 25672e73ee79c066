//! Runtime policy
//!
//! Security validation applied to every process before it is spawned.

pub mod security;
