//! Bot Launcher Library
//!
//! Runs a messaging bot in the background next to a foreground script.
//!
//! This crate provides the core functionality for:
//! - Loading and validating launch configurations
//! - Preparing a Python virtual environment and installing requirements
//! - Spawning the bot in its own process group and the script in the foreground
//! - Terminating the bot once the script exits, including after an interrupt

pub mod bootstrap;
pub mod config;
pub mod launcher;
pub mod process;
