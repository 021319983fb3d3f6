//! Persisted record of the running background process.
//!
//! The record exists on disk only while a background process is alive. If
//! the launcher is killed before it can clean up, the next run finds the
//! record and terminates the orphan before starting a new one.

use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::process;

/// Background process details written while it runs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchRecord {
    /// Name of the background process.
    pub name: String,
    /// Pid, which is also its process group id.
    pub background_pid: u32,
    /// When it was started.
    pub launched_at: DateTime<Utc>,
}

impl LaunchRecord {
    /// Creates a record stamped with the current time.
    #[must_use]
    pub fn new(name: impl Into<String>, background_pid: u32) -> Self {
        Self {
            name: name.into(),
            background_pid,
            launched_at: Utc::now(),
        }
    }

    /// Loads a record from a JSON file. Missing or unreadable files yield `None`.
    pub fn load(path: impl AsRef<Path>) -> Option<Self> {
        std::fs::read_to_string(path)
            .ok()
            .and_then(|s| serde_json::from_str(&s).ok())
    }

    /// Saves the record to a JSON file.
    pub fn save(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
    }

    /// Removes the record file. A missing file is not an error.
    pub fn clear(path: impl AsRef<Path>) -> std::io::Result<()> {
        match std::fs::remove_file(path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Terminates the background process recorded at `path`, if it is still
/// running, and removes the record. Returns the record that was found.
pub async fn reap_stale(path: &Path, grace: Duration) -> Option<LaunchRecord> {
    let record = LaunchRecord::load(path)?;

    if process::group_alive(record.background_pid) {
        warn!(
            "Found '{}' ({}) left running since {}, terminating it",
            record.name, record.background_pid, record.launched_at
        );
        match process::terminate_detached_group(record.background_pid, grace).await {
            Ok(true) => info!("Stale process group {} killed", record.background_pid),
            Ok(false) => info!("Stale process group {} terminated", record.background_pid),
            Err(e) => warn!("Failed to terminate stale process group: {}", e),
        }
    } else {
        debug!(
            "Recorded process {} is no longer running",
            record.background_pid
        );
    }

    if let Err(e) = LaunchRecord::clear(path) {
        warn!("Failed to remove launch record {}: {}", path.display(), e);
    }

    Some(record)
}
