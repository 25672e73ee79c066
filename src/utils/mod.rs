//! Utilities
//!
//! Command-line helpers and bounded output capture.

pub mod command;
pub mod output;
