//! Command execution
//!
//! Request validation, queueing, templating and result retention on top of
//! the process table.

pub mod builder;
pub mod executor;
pub mod history;
pub mod request;
pub mod templates;

pub use builder::CommandBuilder;
pub use executor::{CommandExecutor, ExecutorStatus, SLOT_BASE};
pub use history::{CommandHistory, ResultStore};
pub use request::{generate_request_id, is_request_id, CommandRequest, CommandResult};
pub use templates::{expand_params, CommandTemplate};
