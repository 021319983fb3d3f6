//! Python environment bootstrap.
//!
//! Creates the virtual environment the bot and main script run in and
//! installs their requirements before anything is launched.

mod venv;

pub use venv::{BootstrapError, VirtualEnv, prepare};
