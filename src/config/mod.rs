//! Configuration and policy
//!
//! Shared types, configuration structs, startup validation, and security presets.

pub mod presets;
pub mod types;
pub mod validator;
