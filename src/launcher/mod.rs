//! Background/foreground launch sequencing.
//!
//! Starts the bot in the background, waits, runs the main script in the
//! foreground, and always stops the bot afterwards.

mod runner;
mod state;

pub use runner::{
    ForegroundExit, INTERRUPTED_EXIT_CODE, LaunchError, LaunchPhase, LaunchReport, Launcher,
    shutdown_signal,
};
pub use state::{LaunchRecord, reap_stale};
