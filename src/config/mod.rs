//! Configuration module for the launcher.
//!
//! Handles loading, validation, and environment overrides of the launch
//! configuration: which processes to start, how long to wait between them,
//! and how to prepare the Python environment they run in.

mod launch;
mod settings;

pub use launch::{BootstrapConfig, LaunchConfig, ProcessRole, ProcessSpec, ValidationError};
pub use settings::LauncherSettings;

/// Seconds to wait after starting the background process before starting
/// the foreground one.
pub const DEFAULT_STARTUP_DELAY_SECS: u64 = 3;

/// Seconds a process group gets to exit after SIGTERM before SIGKILL.
pub const DEFAULT_TERMINATION_GRACE_SECS: u64 = 5;

/// Default configuration file name.
pub const DEFAULT_CONFIG_PATH: &str = "launcher.json";
