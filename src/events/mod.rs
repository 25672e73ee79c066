//! Async event delivery: the eventfd-backed bus and filesystem watches feeding it

pub mod file_monitor;
pub mod notifier;

pub use file_monitor::{FileEvent, FileEventType, FileMonitor, FileMonitorManager, WatchInfo};
pub use notifier::{AsyncEvent, AsyncEventManager, AsyncEventType, EventNotifier, EventStats};
