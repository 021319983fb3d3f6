//! Launcher settings read from environment variables.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Overrides taken from the environment (and `.env`).
///
/// Every field is optional; unset or unparseable variables leave the
/// configuration file's value in place.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LauncherSettings {
    /// `LAUNCHER_STARTUP_DELAY`, in seconds.
    pub startup_delay_secs: Option<u64>,

    /// `LAUNCHER_TERMINATION_GRACE`, in seconds.
    pub termination_grace_secs: Option<u64>,

    /// `LAUNCHER_STATE_PATH`.
    pub state_path: Option<PathBuf>,

    /// `LAUNCHER_SKIP_BOOTSTRAP` (`1`, `true` or `yes`).
    pub skip_bootstrap: bool,

    /// `LAUNCHER_PYTHON`, the interpreter used to create the environment.
    pub python: Option<String>,
}

impl LauncherSettings {
    /// Creates launcher settings from environment variables.
    #[must_use]
    pub fn from_env_with_defaults() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Creates launcher settings from an arbitrary variable lookup.
    #[must_use]
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Self {
            startup_delay_secs: lookup("LAUNCHER_STARTUP_DELAY").and_then(|s| s.trim().parse().ok()),
            termination_grace_secs: lookup("LAUNCHER_TERMINATION_GRACE")
                .and_then(|s| s.trim().parse().ok()),
            state_path: lookup("LAUNCHER_STATE_PATH")
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            skip_bootstrap: lookup("LAUNCHER_SKIP_BOOTSTRAP").is_some_and(|s| is_truthy(&s)),
            python: lookup("LAUNCHER_PYTHON").filter(|s| !s.trim().is_empty()),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_owned(), (*v).to_owned()))
            .collect();
        move |key: &str| vars.get(key).cloned()
    }

    #[test]
    fn test_empty_environment() {
        let settings = LauncherSettings::from_lookup(|_| None);
        assert_eq!(settings, LauncherSettings::default());
    }

    #[test]
    fn test_all_variables_set() {
        let settings = LauncherSettings::from_lookup(lookup_from(&[
            ("LAUNCHER_STARTUP_DELAY", "7"),
            ("LAUNCHER_TERMINATION_GRACE", " 2 "),
            ("LAUNCHER_STATE_PATH", "run/state.json"),
            ("LAUNCHER_SKIP_BOOTSTRAP", "Yes"),
            ("LAUNCHER_PYTHON", "python3.11"),
        ]));

        assert_eq!(settings.startup_delay_secs, Some(7));
        assert_eq!(settings.termination_grace_secs, Some(2));
        assert_eq!(settings.state_path, Some(PathBuf::from("run/state.json")));
        assert!(settings.skip_bootstrap);
        assert_eq!(settings.python.as_deref(), Some("python3.11"));
    }

    #[test]
    fn test_unparseable_values_are_ignored() {
        let settings = LauncherSettings::from_lookup(lookup_from(&[
            ("LAUNCHER_STARTUP_DELAY", "three"),
            ("LAUNCHER_SKIP_BOOTSTRAP", "nope"),
            ("LAUNCHER_PYTHON", ""),
        ]));

        assert_eq!(settings.startup_delay_secs, None);
        assert!(!settings.skip_bootstrap);
        assert_eq!(settings.python, None);
    }
}
