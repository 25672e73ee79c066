//! Process supervision core: the process table, spawn path and reaper.

pub mod process;
pub mod types;

pub use process::{terminate_process_gracefully, ProcessManager};
pub use types::ExternalProcessInfo;
