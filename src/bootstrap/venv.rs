//! Virtual environment creation and activation.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::BootstrapConfig;

/// Errors that can occur while preparing the environment.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("Failed to run {step} ({program}): {source}")]
    Spawn {
        step: &'static str,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{step} failed with {status}")]
    StepFailed {
        step: &'static str,
        status: ExitStatus,
    },

    #[error("Virtual environment at {0} has no interpreter")]
    MissingInterpreter(PathBuf),

    #[error("Failed to resolve {path}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to build PATH: {0}")]
    SearchPath(#[from] std::env::JoinPathsError),
}

/// A Python virtual environment on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualEnv {
    root: PathBuf,
}

impl VirtualEnv {
    /// Wraps an environment directory as given.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Wraps an environment directory, made absolute against the current
    /// directory so children with another working directory still find it.
    pub fn resolve(root: impl AsRef<Path>) -> Result<Self, BootstrapError> {
        let root = root.as_ref();
        std::path::absolute(root)
            .map(Self::new)
            .map_err(|source| BootstrapError::Resolve {
                path: root.to_path_buf(),
                source,
            })
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn bin_dir(&self) -> PathBuf {
        self.root.join("bin")
    }

    /// The environment's interpreter.
    #[must_use]
    pub fn python(&self) -> PathBuf {
        self.bin_dir().join("python")
    }

    /// Whether the environment has been created.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.python().exists()
    }

    /// Returns `current` with the environment's `bin` directory in front.
    pub fn search_path(&self, current: Option<&OsString>) -> Result<OsString, BootstrapError> {
        let mut dirs = vec![self.bin_dir()];
        if let Some(current) = current {
            dirs.extend(std::env::split_paths(current));
        }
        Ok(std::env::join_paths(dirs)?)
    }

    /// Sets up `command` the way `source bin/activate` would.
    pub fn activate(&self, command: &mut Command) -> Result<(), BootstrapError> {
        let path = self.search_path(std::env::var_os("PATH").as_ref())?;
        command
            .env("VIRTUAL_ENV", &self.root)
            .env("PATH", path)
            .env_remove("PYTHONHOME");
        Ok(())
    }
}

/// Prepares the environment described by `config`.
///
/// Returns `None` when bootstrap is disabled. An existing environment is
/// reused; dependencies are installed on every call when enabled.
pub async fn prepare(config: &BootstrapConfig) -> Result<Option<VirtualEnv>, BootstrapError> {
    if !config.enabled {
        debug!("Environment bootstrap disabled");
        return Ok(None);
    }

    let venv = VirtualEnv::resolve(&config.venv_dir)?;

    if venv.exists() {
        debug!("Reusing virtual environment at {}", venv.root().display());
    } else {
        info!("Creating virtual environment at {}", venv.root().display());
        let mut command = Command::new(&config.python);
        command.arg("-m").arg("venv").arg(venv.root());
        run_step("virtual environment creation", &config.python, command).await?;

        if !venv.exists() {
            return Err(BootstrapError::MissingInterpreter(venv.root().to_path_buf()));
        }
    }

    if config.install_dependencies {
        if config.requirements.exists() {
            info!(
                "Installing dependencies from {}",
                config.requirements.display()
            );
            let python = venv.python();
            let mut command = Command::new(&python);
            command
                .arg("-m")
                .arg("pip")
                .arg("install")
                .arg("-r")
                .arg(&config.requirements);
            run_step(
                "dependency installation",
                &python.display().to_string(),
                command,
            )
            .await?;
        } else {
            warn!(
                "Requirements file {} not found, skipping installation",
                config.requirements.display()
            );
        }
    }

    Ok(Some(venv))
}

async fn run_step(
    step: &'static str,
    program: &str,
    mut command: Command,
) -> Result<(), BootstrapError> {
    debug!("Running {}: {:?}", step, command.as_std());

    let status = command
        .stdin(Stdio::null())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .status()
        .await
        .map_err(|source| BootstrapError::Spawn {
            step,
            program: program.to_owned(),
            source,
        })?;

    if status.success() {
        Ok(())
    } else {
        Err(BootstrapError::StepFailed { step, status })
    }
}
