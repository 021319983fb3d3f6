//! Spawning and signalling child processes.
//!
//! A background child is made leader of a new process group at spawn time,
//! so `killpg` on its pid reaches the whole tree it starts (a Python bot
//! typically forks workers). Signalling a group that no longer exists is
//! not an error: the process already did what we were about to ask.

use std::os::unix::process::ExitStatusExt;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::{Instant, sleep, timeout, timeout_at};
use tracing::{debug, error, warn};

use crate::config::ProcessSpec;

/// How long to wait for a child to be reaped after SIGKILL.
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval when watching a process group drain.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors that can occur while managing a child process.
#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Failed to spawn '{name}' ({program}): {source}")]
    Spawn {
        name: String,
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Spawned process '{0}' did not report a pid")]
    MissingPid(String),

    #[error("Refusing to signal pid {0}")]
    InvalidPid(u32),

    #[error("Failed to wait for process {pid}: {source}")]
    Wait {
        pid: i32,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to send {signal} to process {pid}: {source}")]
    Signal {
        signal: &'static str,
        pid: i32,
        #[source]
        source: Errno,
    },

    #[error("Process {pid} did not exit within {timeout:?} after SIGKILL")]
    Unkillable { pid: i32, timeout: Duration },
}

/// Where a child runs relative to the launcher's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnMode {
    /// New process group, stdin from `/dev/null`; signals go to the group.
    Background,
    /// Launcher's process group, inherited stdin; signals go to the pid.
    Foreground,
}

/// How a terminated child ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// Exited within the grace period after SIGTERM, or had already exited.
    Graceful(ExitStatus),
    /// Still running after the grace period and was sent SIGKILL.
    Forced(ExitStatus),
}

impl Termination {
    /// Returns the final exit status.
    #[must_use]
    pub const fn status(&self) -> ExitStatus {
        match self {
            Self::Graceful(status) | Self::Forced(status) => *status,
        }
    }

    /// Whether SIGKILL was needed.
    #[must_use]
    pub const fn was_forced(&self) -> bool {
        matches!(self, Self::Forced(_))
    }
}

/// A spawned child with its captured pid.
#[derive(Debug)]
pub struct ManagedChild {
    name: String,
    pid: Pid,
    mode: SpawnMode,
    child: Child,
    /// Set once the child has been reaped through `wait` or `try_wait`.
    exited: Option<ExitStatus>,
}

impl ManagedChild {
    /// Returns the name the child was spawned under.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the process id (and process group id for background children).
    #[must_use]
    pub fn pid(&self) -> u32 {
        self.pid.as_raw().unsigned_abs()
    }

    /// Returns how the child was spawned.
    #[must_use]
    pub const fn mode(&self) -> SpawnMode {
        self.mode
    }

    /// Returns the exit status if the child has already been reaped.
    #[must_use]
    pub const fn exited(&self) -> Option<ExitStatus> {
        self.exited
    }

    /// Waits for the child to exit.
    pub async fn wait(&mut self) -> Result<ExitStatus, ProcessError> {
        let status = self.child.wait().await.map_err(|source| ProcessError::Wait {
            pid: self.pid.as_raw(),
            source,
        })?;
        self.exited = Some(status);
        Ok(status)
    }

    /// Checks whether the child has exited without blocking. Reaps it if so.
    pub fn try_wait(&mut self) -> Result<Option<ExitStatus>, ProcessError> {
        let status = self.child.try_wait().map_err(|source| ProcessError::Wait {
            pid: self.pid.as_raw(),
            source,
        })?;
        if status.is_some() {
            self.exited = status;
        }
        Ok(status)
    }

    /// Sends a signal to the child (or its group). Returns `false` when the
    /// target no longer exists.
    pub fn signal(&self, signal: Signal) -> Result<bool, ProcessError> {
        let result = match self.mode {
            SpawnMode::Background => killpg(self.pid, signal),
            SpawnMode::Foreground => kill(self.pid, signal),
        };
        deliver(result, self.pid, signal)
    }

    /// Sends SIGTERM once, waits up to `grace` for the child to exit, then
    /// escalates to SIGKILL.
    ///
    /// For a background child the grace period covers the whole group: a
    /// member still alive at the deadline gets SIGKILL even if the leader
    /// exited on SIGTERM.
    ///
    /// A reaped foreground child is not signalled, its pid may belong to
    /// someone else by now. A reaped background leader still gets the group
    /// signal: the kernel does not hand out a pid that is still in use as a
    /// process group id, so `killpg` either reaches surviving members or
    /// fails with ESRCH. The only reuse window is the whole group vanishing
    /// and the pid space wrapping around between the reap and the signal.
    pub async fn terminate(&mut self, grace: Duration) -> Result<Termination, ProcessError> {
        let deadline = Instant::now() + grace;

        if let Some(status) = self.exited
            && self.mode == SpawnMode::Foreground
        {
            debug!("'{}' ({}) already reaped, not signalling", self.name, self.pid);
            return Ok(Termination::Graceful(status));
        }

        debug!("Sending SIGTERM to '{}' ({})", self.name, self.pid);
        self.signal(Signal::SIGTERM)?;

        if let Ok(status) = timeout_at(deadline, self.wait()).await {
            let status = status?;
            debug!("'{}' ({}) exited with {}", self.name, self.pid, status);

            if self.mode == SpawnMode::Background && !wait_group_exit(self.pid, deadline).await {
                warn!(
                    "Process group of '{}' ({}) still alive after {:?}, sending SIGKILL",
                    self.name, self.pid, grace
                );
                self.signal(Signal::SIGKILL)?;
                return Ok(Termination::Forced(status));
            }
            return Ok(Termination::Graceful(status));
        }

        warn!(
            "'{}' ({}) did not exit within {:?}, sending SIGKILL",
            self.name, self.pid, grace
        );
        self.signal(Signal::SIGKILL)?;

        match timeout(KILL_TIMEOUT, self.wait()).await {
            Ok(status) => Ok(Termination::Forced(status?)),
            Err(_) => Err(ProcessError::Unkillable {
                pid: self.pid.as_raw(),
                timeout: KILL_TIMEOUT,
            }),
        }
    }
}

/// Builds the command for a process spec. Callers may add to the
/// environment before handing it to [`spawn`].
#[must_use]
pub fn build_command(spec: &ProcessSpec) -> Command {
    let mut command = Command::new(&spec.program);
    command.args(&spec.args);
    if let Some(ref dir) = spec.working_dir {
        command.current_dir(dir);
    }
    command
}

/// Spawns the process described by `spec` from a prepared command.
///
/// Extra environment from `spec` is applied last so it wins over anything
/// the caller set on `command`.
pub fn spawn(
    spec: &ProcessSpec,
    mut command: Command,
    mode: SpawnMode,
) -> Result<ManagedChild, ProcessError> {
    command.envs(&spec.env);
    command.kill_on_drop(true);
    command.stdout(Stdio::inherit());
    command.stderr(Stdio::inherit());

    match mode {
        SpawnMode::Background => {
            command.process_group(0);
            command.stdin(Stdio::null());
        }
        SpawnMode::Foreground => {
            command.stdin(Stdio::inherit());
        }
    }

    debug!("Spawning '{}': {}", spec.name, spec.command_line());

    let child = command.spawn().map_err(|source| {
        error!("Failed to spawn '{}': {}", spec.name, source);
        ProcessError::Spawn {
            name: spec.name.clone(),
            program: spec.program.clone(),
            source,
        }
    })?;

    let raw_pid = child
        .id()
        .ok_or_else(|| ProcessError::MissingPid(spec.name.clone()))?;
    let pid = to_pid(raw_pid)?;

    Ok(ManagedChild {
        name: spec.name.clone(),
        pid,
        mode,
        child,
        exited: None,
    })
}

/// Checks whether a process group with this id exists and can be signalled.
#[must_use]
pub fn group_alive(pgid: u32) -> bool {
    to_pid(pgid).is_ok_and(|pid| killpg(pid, None).is_ok())
}

/// Terminates a process group we hold no child handle for (left over from
/// an earlier run). Returns whether SIGKILL was needed.
pub async fn terminate_detached_group(pgid: u32, grace: Duration) -> Result<bool, ProcessError> {
    let pid = to_pid(pgid)?;

    if !deliver(killpg(pid, Signal::SIGTERM), pid, Signal::SIGTERM)? {
        return Ok(false);
    }

    if wait_group_exit(pid, Instant::now() + grace).await {
        return Ok(false);
    }

    warn!("Process group {} still alive after {:?}, sending SIGKILL", pid, grace);
    deliver(killpg(pid, Signal::SIGKILL), pid, Signal::SIGKILL)?;
    Ok(true)
}

/// Polls until no process is left in the group or `deadline` passes.
/// Returns whether the group is gone.
async fn wait_group_exit(pgid: Pid, deadline: Instant) -> bool {
    loop {
        if killpg(pgid, None).is_err() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(POLL_INTERVAL).await;
    }
}

/// Converts a raw pid, rejecting values that would signal the launcher's
/// own group or init.
fn to_pid(raw: u32) -> Result<Pid, ProcessError> {
    match i32::try_from(raw) {
        Ok(value) if value > 1 => Ok(Pid::from_raw(value)),
        _ => Err(ProcessError::InvalidPid(raw)),
    }
}

/// Maps a signal result, treating a vanished target as delivered-to-nobody.
fn deliver(result: nix::Result<()>, pid: Pid, signal: Signal) -> Result<bool, ProcessError> {
    match result {
        Ok(()) => Ok(true),
        Err(Errno::ESRCH) => {
            debug!("Process {} already exited before {}", pid, signal.as_str());
            Ok(false)
        }
        Err(Errno::EPERM) => {
            debug!(
                "Permission denied sending {} to {} (likely already exited)",
                signal.as_str(),
                pid
            );
            Ok(false)
        }
        Err(source) => {
            error!("Failed to send {} to {}: {}", signal.as_str(), pid, source);
            Err(ProcessError::Signal {
                signal: signal.as_str(),
                pid: pid.as_raw(),
                source,
            })
        }
    }
}

/// Shell-style exit code: the exit code itself, or 128 + signal number.
#[must_use]
pub fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(name: &str, script: &str) -> ProcessSpec {
        ProcessSpec::new(name, "sh", vec!["-c".to_owned(), script.to_owned()])
    }

    fn spawn_spec(spec: &ProcessSpec, mode: SpawnMode) -> ManagedChild {
        spawn(spec, build_command(spec), mode).expect("spawn")
    }

    /// Writes a script that records its pid, ignores SIGTERM and sleeps.
    fn write_stubborn_worker(dir: &std::path::Path) {
        std::fs::write(
            dir.join("worker.sh"),
            "trap '' TERM\necho $$ > worker.pid\nexec sleep 30\n",
        )
        .unwrap();
    }

    async fn read_worker_pid(dir: &std::path::Path) -> i32 {
        for _ in 0..50 {
            if let Ok(text) = std::fs::read_to_string(dir.join("worker.pid"))
                && let Ok(pid) = text.trim().parse()
            {
                return pid;
            }
            sleep(Duration::from_millis(50)).await;
        }
        panic!("worker never wrote its pid");
    }

    /// Whether a pid is gone or only a zombie, polling for up to two seconds.
    async fn is_dead(pid: i32) -> bool {
        for _ in 0..40 {
            match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
                Err(_) => return true,
                Ok(stat) => {
                    let state = stat.rsplit(')').next().unwrap_or("").trim_start();
                    if state.starts_with('Z') || state.starts_with('X') {
                        return true;
                    }
                }
            }
            sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test]
    async fn test_background_child_leads_its_group() {
        let spec = ProcessSpec::new("sleeper", "sleep", vec!["30".to_owned()]);
        let mut child = spawn_spec(&spec, SpawnMode::Background);
        assert!(child.pid() > 1);
        assert!(group_alive(child.pid()));

        let outcome = child.terminate(Duration::from_secs(2)).await.unwrap();
        assert!(!outcome.was_forced());
        assert_eq!(outcome.status().signal(), Some(Signal::SIGTERM as i32));
        assert!(!group_alive(child.pid()));
    }

    #[tokio::test]
    async fn test_terminate_already_exited() {
        let spec = ProcessSpec::new("quick", "true", vec![]);
        let mut child = spawn_spec(&spec, SpawnMode::Background);
        sleep(Duration::from_millis(200)).await;

        let outcome = child.terminate(Duration::from_secs(1)).await.unwrap();
        assert!(matches!(outcome, Termination::Graceful(status) if status.success()));
    }

    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let spec = sh("stubborn", "trap '' TERM; sleep 30");
        let mut child = spawn_spec(&spec, SpawnMode::Background);
        sleep(Duration::from_millis(300)).await;

        let outcome = child.terminate(Duration::from_millis(200)).await.unwrap();
        assert!(outcome.was_forced());
        assert_eq!(outcome.status().signal(), Some(Signal::SIGKILL as i32));
    }

    #[tokio::test]
    async fn test_terminate_kills_group_member_ignoring_term() {
        let dir = tempfile::tempdir().unwrap();
        write_stubborn_worker(dir.path());
        let mut spec = sh("bot", "sh worker.sh & sleep 30");
        spec.working_dir = Some(dir.path().to_path_buf());

        let mut child = spawn_spec(&spec, SpawnMode::Background);
        let worker = read_worker_pid(dir.path()).await;

        let outcome = child.terminate(Duration::from_millis(500)).await.unwrap();
        assert!(outcome.was_forced());
        assert_eq!(outcome.status().signal(), Some(Signal::SIGTERM as i32));
        assert!(is_dead(worker).await);
    }

    #[tokio::test]
    async fn test_reaped_leader_still_sweeps_group() {
        let dir = tempfile::tempdir().unwrap();
        write_stubborn_worker(dir.path());
        let mut spec = sh("bot", "sh worker.sh & exit 0");
        spec.working_dir = Some(dir.path().to_path_buf());

        let mut child = spawn_spec(&spec, SpawnMode::Background);
        let worker = read_worker_pid(dir.path()).await;
        assert!(child.wait().await.unwrap().success());
        assert!(child.exited().is_some());

        let outcome = child.terminate(Duration::from_millis(300)).await.unwrap();
        assert!(outcome.was_forced());
        assert!(outcome.status().success());
        assert!(is_dead(worker).await);
    }

    #[tokio::test]
    async fn test_reaped_foreground_not_signalled() {
        let spec = ProcessSpec::new("main", "true", vec![]);
        let mut child = spawn_spec(&spec, SpawnMode::Foreground);
        child.wait().await.unwrap();

        let outcome = child.terminate(Duration::from_secs(5)).await.unwrap();
        assert!(matches!(outcome, Termination::Graceful(status) if status.success()));
    }

    #[tokio::test]
    async fn test_foreground_exit_code() {
        let spec = sh("main", "exit 4");
        let mut child = spawn_spec(&spec, SpawnMode::Foreground);
        assert_eq!(child.mode(), SpawnMode::Foreground);

        let status = child.wait().await.unwrap();
        assert_eq!(exit_code_of(status), 4);
    }

    #[tokio::test]
    async fn test_spawn_nonexistent_program() {
        let spec = ProcessSpec::new("ghost", "/nonexistent/program_12345", vec![]);
        let result = spawn(&spec, build_command(&spec), SpawnMode::Background);
        assert!(matches!(result, Err(ProcessError::Spawn { .. })));
    }

    #[tokio::test]
    async fn test_spec_env_and_working_dir_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = sh("env", "test \"$LAUNCHER_TEST_VALUE\" = ok && test -f marker");
        spec.env
            .insert("LAUNCHER_TEST_VALUE".to_owned(), "ok".to_owned());
        spec.working_dir = Some(dir.path().to_path_buf());
        std::fs::write(dir.path().join("marker"), "").unwrap();

        let mut child = spawn_spec(&spec, SpawnMode::Foreground);
        assert!(child.wait().await.unwrap().success());
    }

    #[tokio::test]
    async fn test_detached_group_missing() {
        assert!(!group_alive(4_000_000));
        let forced = terminate_detached_group(4_000_000, Duration::from_millis(50))
            .await
            .unwrap();
        assert!(!forced);
    }

    #[test]
    fn test_refuses_own_group_and_init() {
        assert!(matches!(to_pid(0), Err(ProcessError::InvalidPid(0))));
        assert!(matches!(to_pid(1), Err(ProcessError::InvalidPid(1))));
        assert!(to_pid(u32::MAX).is_err());
        assert!(!group_alive(0));
    }
}
