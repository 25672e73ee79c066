//! Stdio redirection for supervised processes

pub mod redirector;

pub use redirector::{
    parse_mode, validate_mode_string, IORedirector, IoRedirectMode, IoResult, IoStats,
    IoStreamConfig, PreparedStdio, ProcessIoConfig, MAX_IO_BUFFER,
};
