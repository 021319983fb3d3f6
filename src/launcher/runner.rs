//! Launch sequence runner.
//!
//! The launcher walks a fixed sequence:
//! 1. Prepare the Python environment (optional)
//! 2. Start the background process and record its pid
//! 3. Wait the startup delay (blind, nothing is probed)
//! 4. Run the foreground process until it exits
//! 5. Terminate the background process group, whatever happened in 4
//!
//! An interrupt during 3 or 4 skips straight to 5. Step 5 runs exactly once
//! for every launch that got past step 2.

use std::future::Future;
use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::state::{LaunchRecord, reap_stale};
use crate::bootstrap::{self, BootstrapError, VirtualEnv};
use crate::config::{LaunchConfig, ProcessRole};
use crate::process::{self, ManagedChild, ProcessError, SpawnMode, Termination};

/// Exit code reported when the launcher itself was interrupted.
pub const INTERRUPTED_EXIT_CODE: u8 = 130;

/// Errors that abort a launch.
#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("Environment bootstrap failed: {0}")]
    Bootstrap(#[from] BootstrapError),

    #[error("Failed to start background process: {0}")]
    Background(#[source] ProcessError),

    #[error("Foreground process failed (background process {background_pid} was terminated): {source}")]
    Foreground {
        background_pid: u32,
        #[source]
        source: ProcessError,
    },
}

/// Where a launch currently is. Phases only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LaunchPhase {
    NotStarted,
    BackgroundRunning,
    ForegroundRunning,
    BackgroundTerminated,
}

/// How the foreground process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForegroundExit {
    /// Ran to completion with this status.
    Exited(ExitStatus),
    /// The launcher was interrupted; the foreground process was stopped or
    /// never started.
    Interrupted,
}

/// Outcome of a completed launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchReport {
    /// Pid captured when the background process started.
    pub background_pid: u32,
    /// How the foreground process ended.
    pub foreground: ForegroundExit,
    /// How the background process ended; `None` if signalling it failed.
    pub background: Option<Termination>,
    /// Every phase the launch passed through, in order.
    pub phases: Vec<LaunchPhase>,
}

impl LaunchReport {
    /// Exit code for the launcher: the foreground process's own code,
    /// 128 + signal number if it was killed by a signal, or 130 when the
    /// launcher was interrupted.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        match self.foreground {
            ForegroundExit::Exited(status) => {
                u8::try_from(process::exit_code_of(status)).unwrap_or(1)
            }
            ForegroundExit::Interrupted => INTERRUPTED_EXIT_CODE,
        }
    }
}

/// Runs the background/foreground pair described by a [`LaunchConfig`].
pub struct Launcher {
    config: LaunchConfig,
    startup_delay: Duration,
    termination_grace: Duration,
    phases: Vec<LaunchPhase>,
}

impl Launcher {
    /// Creates a launcher from a validated configuration.
    #[must_use]
    pub fn new(config: LaunchConfig) -> Self {
        Self {
            startup_delay: config.startup_delay(),
            termination_grace: config.termination_grace(),
            config,
            phases: vec![LaunchPhase::NotStarted],
        }
    }

    /// Overrides the startup delay from the configuration.
    #[must_use]
    pub const fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    /// Overrides the termination grace period from the configuration.
    #[must_use]
    pub const fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.termination_grace = grace;
        self
    }

    /// Gets a reference to the configuration.
    #[must_use]
    pub fn config(&self) -> &LaunchConfig {
        &self.config
    }

    /// Runs the launch, treating Ctrl+C or SIGTERM as an interrupt.
    pub async fn run(self) -> Result<LaunchReport, LaunchError> {
        self.run_until(shutdown_signal()).await
    }

    /// Runs the launch, treating completion of `shutdown` as an interrupt.
    pub async fn run_until<F>(mut self, shutdown: F) -> Result<LaunchReport, LaunchError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let venv = self.bootstrap().await?;

        if self.config.reap_stale {
            reap_stale(&self.config.state_path, self.termination_grace).await;
        }

        // Step 2: start the background process
        let mut background = self.start_background(venv.as_ref())?;
        let background_pid = background.pid();

        // Step 3: blind delay
        debug!("Waiting {:?} before starting the foreground process", self.startup_delay);
        let interrupted = tokio::select! {
            () = tokio::time::sleep(self.startup_delay) => false,
            () = &mut shutdown => true,
        };

        // Step 4: foreground process
        let foreground = if interrupted {
            info!("Interrupted before the foreground process started");
            Ok(ForegroundExit::Interrupted)
        } else {
            // Reaping the leader here is fine: termination still sweeps the group.
            if let Ok(Some(status)) = background.try_wait() {
                warn!(
                    "Background process '{}' already exited with {}",
                    background.name(),
                    status
                );
            }
            self.run_foreground(venv.as_ref(), &mut shutdown).await
        };

        // Step 5: terminate the background process, exactly once
        let termination = self.stop_background(&mut background).await;

        match foreground {
            Ok(foreground) => Ok(LaunchReport {
                background_pid,
                foreground,
                background: termination,
                phases: self.phases,
            }),
            Err(source) => Err(LaunchError::Foreground {
                background_pid,
                source,
            }),
        }
    }

    async fn bootstrap(&self) -> Result<Option<VirtualEnv>, LaunchError> {
        let config = &self.config.bootstrap;
        match bootstrap::prepare(config).await {
            Ok(venv) => Ok(venv),
            Err(e) if config.strict => {
                error!("Environment bootstrap failed: {}", e);
                Err(e.into())
            }
            Err(e) => {
                warn!("Environment bootstrap failed, continuing: {}", e);
                // Keep whatever environment made it to disk.
                Ok(VirtualEnv::resolve(&config.venv_dir)
                    .ok()
                    .filter(VirtualEnv::exists))
            }
        }
    }

    fn start_background(&mut self, venv: Option<&VirtualEnv>) -> Result<ManagedChild, LaunchError> {
        let spec = self.config.process(ProcessRole::Background);
        let command = self
            .prepare_command(ProcessRole::Background, venv)
            .map_err(LaunchError::Bootstrap)?;
        let child = process::spawn(spec, command, SpawnMode::Background)
            .map_err(LaunchError::Background)?;

        info!(
            "Started background process '{}' (pid {})",
            child.name(),
            child.pid()
        );
        self.advance(LaunchPhase::BackgroundRunning);

        if let Err(e) =
            LaunchRecord::new(child.name(), child.pid()).save(&self.config.state_path)
        {
            warn!("Failed to save launch record: {}", e);
        }

        Ok(child)
    }

    async fn run_foreground<F>(
        &mut self,
        venv: Option<&VirtualEnv>,
        shutdown: &mut std::pin::Pin<&mut F>,
    ) -> Result<ForegroundExit, ProcessError>
    where
        F: Future<Output = ()>,
    {
        let spec = self.config.process(ProcessRole::Foreground);
        let command = match self.prepare_command(ProcessRole::Foreground, venv) {
            Ok(command) => command,
            Err(e) => {
                error!("Could not activate environment for '{}': {}", spec.name, e);
                process::build_command(spec)
            }
        };
        let mut foreground = process::spawn(spec, command, SpawnMode::Foreground)?;

        info!(
            "Started foreground process '{}' (pid {})",
            foreground.name(),
            foreground.pid()
        );
        self.advance(LaunchPhase::ForegroundRunning);

        let finished = tokio::select! {
            status = foreground.wait() => Some(status),
            () = shutdown.as_mut() => None,
        };

        if let Some(status) = finished {
            let status = status?;
            info!(
                "Foreground process '{}' exited with {}",
                foreground.name(),
                status
            );
            return Ok(ForegroundExit::Exited(status));
        }

        info!(
            "Interrupted, stopping foreground process '{}'",
            foreground.name()
        );
        if let Err(e) = foreground.terminate(self.termination_grace).await {
            error!("Failed to stop foreground process: {}", e);
        }
        Ok(ForegroundExit::Interrupted)
    }

    async fn stop_background(&mut self, background: &mut ManagedChild) -> Option<Termination> {
        info!(
            "Terminating background process '{}' (pid {})",
            background.name(),
            background.pid()
        );

        let termination = match background.terminate(self.termination_grace).await {
            Ok(termination) => {
                info!(
                    "Background process '{}' stopped ({}{})",
                    background.name(),
                    termination.status(),
                    if termination.was_forced() { ", forced" } else { "" }
                );
                Some(termination)
            }
            Err(e) => {
                error!("Failed to terminate background process: {}", e);
                None
            }
        };
        self.advance(LaunchPhase::BackgroundTerminated);

        if termination.is_some()
            && let Err(e) = LaunchRecord::clear(&self.config.state_path)
        {
            warn!("Failed to remove launch record: {}", e);
        }

        termination
    }

    /// Builds the command for `role` inside the environment. Activation
    /// failures are fatal only in strict mode; otherwise the plain command
    /// is used.
    fn prepare_command(
        &self,
        role: ProcessRole,
        venv: Option<&VirtualEnv>,
    ) -> Result<Command, BootstrapError> {
        let spec = self.config.process(role);
        let mut command = process::build_command(spec);
        let Some(venv) = venv else {
            return Ok(command);
        };

        match venv.activate(&mut command) {
            Ok(()) => Ok(command),
            Err(e) if self.config.bootstrap.strict => Err(e),
            Err(e) => {
                warn!(
                    "Could not activate environment for '{}', running without it: {}",
                    spec.name, e
                );
                Ok(process::build_command(spec))
            }
        }
    }

    fn advance(&mut self, next: LaunchPhase) {
        debug_assert!(self.phases.last().is_none_or(|last| *last < next));
        debug!("Launch phase: {:?}", next);
        self.phases.push(next);
    }
}

impl std::fmt::Debug for Launcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Launcher")
            .field("startup_delay", &self.startup_delay)
            .field("termination_grace", &self.termination_grace)
            .field("phases", &self.phases)
            .finish_non_exhaustive()
    }
}

/// Resolves on Ctrl+C or SIGTERM. A handler that cannot be installed never
/// fires.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C, shutting down..."),
        () = terminate => info!("Received SIGTERM, shutting down..."),
    }
}
