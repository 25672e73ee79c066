//! Thin wrappers around Linux kernel primitives.
//!
//! All `unsafe` code is concentrated here with explicit SAFETY comments.
//! Dependency direction: fd -> rlimit -> signal -> child; eventfd and inotify stand alone.

pub mod child;
pub mod eventfd;
pub mod fd;
pub mod inotify;
pub mod rlimit;
pub mod signal;
