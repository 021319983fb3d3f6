//! Launch configuration and validation.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::{DEFAULT_STARTUP_DELAY_SECS, DEFAULT_TERMINATION_GRACE_SECS, LauncherSettings};

/// Errors that can occur while loading or validating a launch configuration.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("The {role} process has an empty name")]
    EmptyName { role: ProcessRole },

    #[error("The {role} process '{name}' has no program to run")]
    EmptyProgram { role: ProcessRole, name: String },

    #[error("Background and foreground processes share the name '{name}'")]
    DuplicateName { name: String },

    #[error("Bootstrap is enabled but no virtual environment directory is set")]
    EmptyVenvDir,

    #[error("Bootstrap is enabled but no Python interpreter is set")]
    EmptyPython,

    #[error("State path must not be empty")]
    EmptyStatePath,

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse configuration file: {0}")]
    ParseError(#[from] serde_json::Error),
}

/// Which side of the launch a process is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessRole {
    /// Started first, left running, terminated at the end.
    Background,
    /// Started after the delay; the launch ends when it exits.
    Foreground,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Background => f.write_str("background"),
            Self::Foreground => f.write_str("foreground"),
        }
    }
}

/// A single external process to start.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessSpec {
    /// Human-readable name used in logs.
    pub name: String,

    /// Program to execute. Resolved through `PATH` unless it contains a slash.
    pub program: String,

    /// Arguments passed to the program.
    #[serde(default)]
    pub args: Vec<String>,

    /// Working directory; the launcher's own directory when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables, applied on top of the inherited ones.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl ProcessSpec {
    /// Creates a process spec with no working directory or extra environment.
    #[must_use]
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            working_dir: None,
            env: BTreeMap::new(),
        }
    }

    /// Renders the program and arguments as a single line for display.
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn check(&self, role: ProcessRole, problems: &mut Vec<ValidationError>) {
        if self.name.trim().is_empty() {
            problems.push(ValidationError::EmptyName { role });
        }
        if self.program.trim().is_empty() {
            problems.push(ValidationError::EmptyProgram {
                role,
                name: self.name.clone(),
            });
        }
    }
}

/// Python virtual environment preparation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BootstrapConfig {
    /// Whether to prepare the environment at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interpreter used to create the virtual environment.
    #[serde(default = "default_python")]
    pub python: String,

    /// Directory of the virtual environment.
    #[serde(default = "default_venv_dir")]
    pub venv_dir: PathBuf,

    /// Requirements file passed to `pip install -r`.
    #[serde(default = "default_requirements")]
    pub requirements: PathBuf,

    /// Run `pip install` on every launch.
    #[serde(default = "default_true")]
    pub install_dependencies: bool,

    /// Abort the launch when a bootstrap step fails instead of carrying on.
    #[serde(default)]
    pub strict: bool,
}

fn default_true() -> bool {
    true
}

fn default_python() -> String {
    "python3".to_owned()
}

fn default_venv_dir() -> PathBuf {
    PathBuf::from("venv")
}

fn default_requirements() -> PathBuf {
    PathBuf::from("requirements.txt")
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            python: default_python(),
            venv_dir: default_venv_dir(),
            requirements: default_requirements(),
            install_dependencies: true,
            strict: false,
        }
    }
}

/// Full launch configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchConfig {
    /// Process started first and terminated last (the bot).
    #[serde(default = "default_background")]
    pub background: ProcessSpec,

    /// Process whose exit ends the launch (the main script).
    #[serde(default = "default_foreground")]
    pub foreground: ProcessSpec,

    /// Blind wait between starting the background and foreground processes.
    #[serde(default = "default_startup_delay")]
    pub startup_delay_secs: u64,

    /// Time the background process group gets to exit after SIGTERM.
    #[serde(default = "default_termination_grace")]
    pub termination_grace_secs: u64,

    /// Terminate a background process left behind by an earlier run.
    #[serde(default = "default_true")]
    pub reap_stale: bool,

    /// Where the running background process is recorded.
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,

    #[serde(default)]
    pub bootstrap: BootstrapConfig,
}

fn default_background() -> ProcessSpec {
    ProcessSpec::new("telegram-bot", "python", vec!["tg_bot_core.py".to_owned()])
}

fn default_foreground() -> ProcessSpec {
    ProcessSpec::new("main", "python", vec!["main.py".to_owned()])
}

fn default_startup_delay() -> u64 {
    DEFAULT_STARTUP_DELAY_SECS
}

fn default_termination_grace() -> u64 {
    DEFAULT_TERMINATION_GRACE_SECS
}

fn default_state_path() -> PathBuf {
    PathBuf::from(".bot_launcher.json")
}

impl Default for LaunchConfig {
    fn default() -> Self {
        Self {
            background: default_background(),
            foreground: default_foreground(),
            startup_delay_secs: default_startup_delay(),
            termination_grace_secs: default_termination_grace(),
            reap_stale: true,
            state_path: default_state_path(),
            bootstrap: BootstrapConfig::default(),
        }
    }
}

impl LaunchConfig {
    /// Loads configuration from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)?;
        Ok(config)
    }

    /// Loads configuration from a JSON file, falling back to the built-in
    /// defaults when the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ValidationError> {
        let path = path.as_ref();
        if path.exists() {
            Self::load_from_file(path)
        } else {
            debug!("No configuration at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Saves configuration to a JSON file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> Result<(), ValidationError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns the first validation error encountered.
    pub fn validate(&self) -> Result<(), ValidationError> {
        match self.validate_all().into_iter().next() {
            Some(problem) => Err(problem),
            None => Ok(()),
        }
    }

    /// Returns every problem found in the configuration.
    #[must_use]
    pub fn validate_all(&self) -> Vec<ValidationError> {
        let mut problems = Vec::new();

        self.background.check(ProcessRole::Background, &mut problems);
        self.foreground.check(ProcessRole::Foreground, &mut problems);

        if !self.background.name.trim().is_empty() && self.background.name == self.foreground.name {
            problems.push(ValidationError::DuplicateName {
                name: self.background.name.clone(),
            });
        }

        if self.bootstrap.enabled {
            if self.bootstrap.venv_dir.as_os_str().is_empty() {
                problems.push(ValidationError::EmptyVenvDir);
            }
            if self.bootstrap.python.trim().is_empty() {
                problems.push(ValidationError::EmptyPython);
            }
        }

        if self.state_path.as_os_str().is_empty() {
            problems.push(ValidationError::EmptyStatePath);
        }

        problems
    }

    /// Applies environment overrides on top of the file values.
    pub fn apply_settings(&mut self, settings: &LauncherSettings) {
        if let Some(delay) = settings.startup_delay_secs {
            self.startup_delay_secs = delay;
        }
        if let Some(grace) = settings.termination_grace_secs {
            self.termination_grace_secs = grace;
        }
        if let Some(ref path) = settings.state_path {
            self.state_path.clone_from(path);
        }
        if let Some(ref python) = settings.python {
            self.bootstrap.python.clone_from(python);
        }
        if settings.skip_bootstrap {
            self.bootstrap.enabled = false;
        }
    }

    /// Returns the spec for the given role.
    #[must_use]
    pub const fn process(&self, role: ProcessRole) -> &ProcessSpec {
        match role {
            ProcessRole::Background => &self.background,
            ProcessRole::Foreground => &self.foreground,
        }
    }

    /// Returns the startup delay as a duration.
    #[must_use]
    pub const fn startup_delay(&self) -> Duration {
        Duration::from_secs(self.startup_delay_secs)
    }

    /// Returns the termination grace period as a duration.
    #[must_use]
    pub const fn termination_grace(&self) -> Duration {
        Duration::from_secs(self.termination_grace_secs)
    }

    /// Creates an example configuration for users to reference.
    #[must_use]
    pub fn example() -> Self {
        let mut config = Self::default();
        config
            .foreground
            .env
            .insert("PYTHONUNBUFFERED".to_owned(), "1".to_owned());
        config
            .background
            .env
            .insert("PYTHONUNBUFFERED".to_owned(), "1".to_owned());
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_original_scripts() {
        let config = LaunchConfig::default();
        assert_eq!(config.background.command_line(), "python tg_bot_core.py");
        assert_eq!(config.foreground.command_line(), "python main.py");
        assert_eq!(config.startup_delay(), Duration::from_secs(3));
        assert!(config.bootstrap.enabled);
        assert!(!config.bootstrap.strict);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let json = r#"{ "startup_delay_secs": 10, "bootstrap": { "enabled": false } }"#;
        let config: LaunchConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.startup_delay_secs, 10);
        assert!(!config.bootstrap.enabled);
        assert_eq!(config.bootstrap.venv_dir, PathBuf::from("venv"));
        assert_eq!(config.background.name, "telegram-bot");
        assert_eq!(config.termination_grace_secs, DEFAULT_TERMINATION_GRACE_SECS);
    }

    #[test]
    fn test_validation_empty_program() {
        let mut config = LaunchConfig::default();
        config.foreground.program = "  ".to_owned();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::EmptyProgram {
                role: ProcessRole::Foreground,
                ..
            })
        ));
    }

    #[test]
    fn test_validation_duplicate_names() {
        let mut config = LaunchConfig::default();
        config.foreground.name = config.background.name.clone();
        assert!(matches!(
            config.validate(),
            Err(ValidationError::DuplicateName { .. })
        ));
    }

    #[test]
    fn test_validate_all_collects_every_problem() {
        let mut config = LaunchConfig::default();
        config.background.name = String::new();
        config.background.program = String::new();
        config.bootstrap.venv_dir = PathBuf::new();
        config.state_path = PathBuf::new();

        let problems = config.validate_all();
        assert_eq!(problems.len(), 4);
    }

    #[test]
    fn test_bootstrap_fields_ignored_when_disabled() {
        let mut config = LaunchConfig::default();
        config.bootstrap.enabled = false;
        config.bootstrap.python = String::new();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_apply_settings_overrides() {
        let mut config = LaunchConfig::default();
        let settings = LauncherSettings {
            startup_delay_secs: Some(0),
            termination_grace_secs: None,
            state_path: Some(PathBuf::from("/tmp/launcher-state.json")),
            skip_bootstrap: true,
            python: Some("python3.12".to_owned()),
        };
        config.apply_settings(&settings);

        assert_eq!(config.startup_delay_secs, 0);
        assert_eq!(config.termination_grace_secs, DEFAULT_TERMINATION_GRACE_SECS);
        assert_eq!(config.state_path, PathBuf::from("/tmp/launcher-state.json"));
        assert!(!config.bootstrap.enabled);
        assert_eq!(config.bootstrap.python, "python3.12");
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launcher.json");

        let example = LaunchConfig::example();
        example.save_to_file(&path).unwrap();

        let loaded = LaunchConfig::load_or_default(&path).unwrap();
        assert_eq!(loaded, example);
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = LaunchConfig::load_or_default(dir.path().join("absent.json")).unwrap();
        assert_eq!(config, LaunchConfig::default());
    }

    #[test]
    fn test_load_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("launcher.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            LaunchConfig::load_or_default(&path),
            Err(ValidationError::ParseError(_))
        ));
    }
}
