//! procwarden: external process supervision for many logical connections
//!
//! A single-node supervisor that spawns child processes on behalf of
//! connections, bounds their resources, redirects their stdio and reports
//! what happens to them on an event bus.
//!
//! # Architecture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::child`]: Child-side fork/exec setup (stdio, chroot, rlimits, credential drop)
//! - [`kernel::signal`]: Signal delivery and graceful termination
//! - [`kernel::rlimit`]: Resource limit wrappers for self and live processes
//! - [`kernel::eventfd`]: Counter-backed wakeup descriptor
//! - [`kernel::inotify`]: Filesystem watch descriptor
//! - [`kernel::fd`]: Descriptor flags and polling
//!
//! ## Process Supervision ([`core`], [`exec`])
//! - [`core::process`]: Process table, spawn path and reaper
//! - [`exec::executor`]: Validated request queue, worker pool and result store
//! - [`exec::templates`]: Parameterised command templates
//!
//! ## Policy ([`runtime`], [`resource`])
//! - [`runtime::security`]: Pre-spawn command, argument, environment and path checks
//! - [`resource::manager`]: Per-connection limits, sandbox modes and the sampling loop
//! - [`resource::accounting`]: `/proc` usage reader
//!
//! ## I/O and Events ([`io`], [`events`])
//! - [`io::redirector`]: Per-stream redirection plans and non-blocking pipe I/O
//! - [`events::notifier`]: eventfd-backed event bus with per-connection queues
//! - [`events::file_monitor`]: inotify watches fanned out to connections
//!
//! ## Observability ([`observability`])
//! - [`observability::audit`]: Structured security audit events
//! - [`observability::metrics`]: Atomic counters and gauges
//!
//! ## Configuration ([`config`])
//! - [`config::types`]: Shared types, error enum and configuration structs
//! - [`config::validator`]: Startup validation
//! - [`config::presets`]: Security context presets
//!
//! ## Service Container ([`supervisor`])
//! - [`supervisor::Supervisor`]: Builds, wires and tears down every subsystem
//!
//! # Design Principles
//!
//! 1. **Kernel as truth** - Exit status from `waitpid`, usage from `/proc`
//! 2. **Explicit wiring** - No globals; every manager receives its collaborators
//! 3. **Contracts over panics** - Public calls report failure through results and sentinels
//! 4. **Minimal unsafe** - Confined to [`kernel`] with explicit preconditions

// Kernel Primitives
pub mod kernel;

// Process Supervision
pub mod core;
pub mod exec;

// Policy
pub mod resource;
pub mod runtime;

// I/O and Events
pub mod events;
pub mod io;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// Service Container
pub mod supervisor;

// CLI entrypoint wiring for the procwarden binary
pub mod cli;

// Re-export commonly used types for convenience
pub use config::types::*;
pub use supervisor::{Supervisor, SupervisorStatus};
