//! Process handle implementation
//!
//! Owns exactly one OS process: spawns it, watches for an early exit, and
//! terminates it gracefully (then forcefully) on request.

use crate::process::config::ProcessConfig;
use crate::process::error::ProcessError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Number of stderr lines kept for crash diagnostics
const STDERR_TAIL_LINES: usize = 40;

/// How long to wait for the stderr reader to drain after an exit
const STDERR_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Lifecycle state of a [`ProcessHandle`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessState {
    /// Configured but not yet spawned
    NotStarted,
    /// Spawned, still inside the startup grace window
    Starting,
    /// OS confirmed the process is alive past the grace window
    Running,
    /// Terminated on request
    Stopped,
    /// Exited on its own
    Crashed,
}

impl ProcessState {
    /// Whether no further transitions are possible
    pub fn is_terminal(self) -> bool {
        matches!(self, ProcessState::Stopped | ProcessState::Crashed)
    }

    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: ProcessState) -> bool {
        use ProcessState::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (Starting, Running)
                | (Starting, Crashed)
                | (Starting, Stopped)
                | (Running, Stopped)
                | (Running, Crashed)
        )
    }
}

/// Handle to a single spawned OS process
///
/// A handle is single-use: once it reaches `Stopped` or `Crashed` it cannot be
/// restarted, and a fresh handle must be created instead.
pub struct ProcessHandle {
    /// Human-readable label used in logs (usually the stage name)
    label: String,
    config: ProcessConfig,
    state: ProcessState,
    child: Option<Child>,
    pid: Option<u32>,
    started_at: Option<DateTime<Utc>>,
    exit_code: Option<i32>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
    stderr_task: Option<JoinHandle<()>>,
}

impl ProcessHandle {
    /// Create a handle in the `NotStarted` state
    pub fn new(label: impl Into<String>, config: ProcessConfig) -> Self {
        Self {
            label: label.into(),
            config,
            state: ProcessState::NotStarted,
            child: None,
            pid: None,
            started_at: None,
            exit_code: None,
            stderr_tail: Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES))),
            stderr_task: None,
        }
    }

    /// Spawn the configured process
    ///
    /// After the OS creates the process the handle waits up to the configured
    /// startup grace window. An exit inside that window moves the handle to
    /// `Crashed` and returns [`ProcessError::Crashed`] with the exit code and
    /// captured stderr.
    ///
    /// # Errors
    /// * `ExecutableNotFound` - the search policy resolved nothing
    /// * `Spawn` - the OS refused to create the process
    /// * `Crashed` - the process exited during the grace window
    /// * `InvalidTransition` - the handle was already spawned
    pub async fn spawn(&mut self) -> Result<(), ProcessError> {
        if !self.state.can_transition_to(ProcessState::Starting) {
            return Err(ProcessError::InvalidTransition {
                from: self.state,
                to: ProcessState::Starting,
            });
        }

        let program = self.config.executable.resolve()?;

        let mut cmd = Command::new(&program);
        cmd.args(&self.config.args)
            .envs(&self.config.env)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.config.working_dir {
            cmd.current_dir(dir);
        }

        debug!(
            process = %self.label,
            program = %program.display(),
            args = ?self.config.args,
            "Spawning process"
        );

        let mut child = cmd.spawn().map_err(|e| {
            error!(process = %self.label, error = %e, "Failed to spawn process");
            ProcessError::Spawn(e)
        })?;

        self.transition(ProcessState::Starting)?;
        self.pid = child.id();
        self.started_at = Some(Utc::now());

        if let Some(stderr) = child.stderr.take() {
            self.stderr_task = Some(spawn_stderr_reader(
                self.label.clone(),
                stderr,
                self.stderr_tail.clone(),
            ));
        }

        match timeout(self.config.startup_grace, child.wait()).await {
            Ok(Ok(status)) => {
                self.exit_code = status.code();
                self.transition(ProcessState::Crashed)?;
                let stderr = self.drain_stderr().await;
                error!(
                    process = %self.label,
                    pid = ?self.pid,
                    exit_code = ?self.exit_code,
                    stderr = %stderr,
                    "Process exited during startup"
                );
                Err(ProcessError::Crashed {
                    exit_code: self.exit_code,
                    stderr,
                })
            }
            Ok(Err(e)) => {
                let _ = child.start_kill();
                self.transition(ProcessState::Crashed)?;
                Err(ProcessError::Wait(e))
            }
            Err(_) => {
                self.child = Some(child);
                self.transition(ProcessState::Running)?;
                info!(process = %self.label, pid = ?self.pid, "Process running");
                Ok(())
            }
        }
    }

    /// Check whether a running process has exited on its own
    ///
    /// On exit the handle moves to `Crashed` and the matching
    /// [`ProcessError::Crashed`] is returned. Returns `None` while the process
    /// is alive or when the handle is not running.
    pub async fn poll_exit(&mut self) -> Option<ProcessError> {
        if self.state != ProcessState::Running {
            return None;
        }
        let status = match self.child.as_mut()?.try_wait() {
            Ok(Some(status)) => status,
            Ok(None) => return None,
            Err(e) => {
                warn!(process = %self.label, error = %e, "Failed to poll process status");
                return None;
            }
        };

        self.exit_code = status.code();
        self.child = None;
        if let Err(e) = self.transition(ProcessState::Crashed) {
            warn!(process = %self.label, error = %e, "Unexpected state while recording exit");
        }
        let stderr = self.drain_stderr().await;
        warn!(
            process = %self.label,
            pid = ?self.pid,
            exit_code = ?self.exit_code,
            "Process exited unexpectedly"
        );
        Some(ProcessError::Crashed {
            exit_code: self.exit_code,
            stderr,
        })
    }

    /// Non-blocking liveness check
    ///
    /// Does not change the recorded lifecycle state; use [`poll_exit`](Self::poll_exit)
    /// for that.
    pub fn is_alive(&mut self) -> bool {
        match self.child.as_mut() {
            Some(child) => matches!(child.try_wait(), Ok(None)),
            None => false,
        }
    }

    /// Terminate the process
    ///
    /// Requests a graceful shutdown (SIGTERM on Unix), waits up to `grace`,
    /// then kills the process. Terminating a handle that never started or is
    /// already terminal is a no-op.
    pub async fn terminate(&mut self, grace: Duration) -> Result<(), ProcessError> {
        if self.state == ProcessState::NotStarted || self.state.is_terminal() {
            return Ok(());
        }
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            self.exit_code = status.code();
            self.transition(ProcessState::Crashed)?;
            self.abort_stderr_reader();
            info!(
                process = %self.label,
                exit_code = ?self.exit_code,
                "Process had already exited before terminate"
            );
            return Ok(());
        }

        debug!(process = %self.label, pid = ?self.pid, "Requesting graceful shutdown");
        if let Err(e) = request_shutdown(&mut child) {
            warn!(process = %self.label, error = %e, "Graceful shutdown request failed");
        }

        let status = match timeout(grace, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                self.child = Some(child);
                return Err(ProcessError::Wait(e));
            }
            Err(_) => {
                warn!(
                    process = %self.label,
                    pid = ?self.pid,
                    grace_ms = grace.as_millis() as u64,
                    "Process did not exit within grace period, killing"
                );
                child.kill().await.map_err(ProcessError::Wait)?;
                child.wait().await.map_err(ProcessError::Wait)?
            }
        };

        self.exit_code = status.code();
        self.transition(ProcessState::Stopped)?;
        self.abort_stderr_reader();
        info!(
            process = %self.label,
            pid = ?self.pid,
            exit_code = ?self.exit_code,
            "Process stopped"
        );
        Ok(())
    }

    /// Captured stderr tail, joined with newlines
    pub async fn stderr_tail(&self) -> String {
        let tail = self.stderr_tail.lock().await;
        tail.iter().cloned().collect::<Vec<_>>().join("\n")
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// OS process id, once spawned
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// When the process was spawned
    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        self.started_at
    }

    /// Last observed exit code
    pub fn exit_code(&self) -> Option<i32> {
        self.exit_code
    }

    fn transition(&mut self, to: ProcessState) -> Result<(), ProcessError> {
        if !self.state.can_transition_to(to) {
            return Err(ProcessError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        debug!(process = %self.label, from = ?self.state, to = ?to, "Process state transition");
        self.state = to;
        Ok(())
    }

    async fn drain_stderr(&mut self) -> String {
        if let Some(task) = self.stderr_task.take() {
            let _ = timeout(STDERR_DRAIN_TIMEOUT, task).await;
        }
        self.stderr_tail().await
    }

    fn abort_stderr_reader(&mut self) {
        if let Some(task) = self.stderr_task.take() {
            task.abort();
        }
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("label", &self.label)
            .field("state", &self.state)
            .field("pid", &self.pid)
            .field("exit_code", &self.exit_code)
            .finish()
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        // Can't await in Drop; start_kill is synchronous and the child is reaped by tokio.
        if let Some(child) = self.child.as_mut() {
            if let Ok(None) = child.try_wait() {
                let _ = child.start_kill();
            }
        }
        self.abort_stderr_reader();
    }
}

fn spawn_stderr_reader(
    label: String,
    stderr: ChildStderr,
    tail: Arc<Mutex<VecDeque<String>>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(process = %label, line = %line, "stderr");
            let mut tail = tail.lock().await;
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
    })
}

#[cfg(unix)]
#[allow(unsafe_code)]
fn request_shutdown(child: &mut Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    // SAFETY: `pid` belongs to a child we own and have not reaped yet.
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn request_shutdown(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::config::ExecutableSearch;
    use std::time::Instant;

    fn sh(script: &str) -> ProcessConfig {
        ProcessConfig::new(ExecutableSearch::named("sh")).args(["-c", script])
    }

    #[test]
    fn test_state_transitions() {
        use ProcessState::*;
        assert!(NotStarted.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Running));
        assert!(Starting.can_transition_to(Crashed));
        assert!(Running.can_transition_to(Stopped));
        assert!(Running.can_transition_to(Crashed));

        assert!(!NotStarted.can_transition_to(Running));
        assert!(!Running.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Running));
        assert!(!Crashed.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Crashed));

        assert!(Stopped.is_terminal());
        assert!(Crashed.is_terminal());
        assert!(!Running.is_terminal());
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let mut handle = ProcessHandle::new(
            "missing",
            ProcessConfig::new(ExecutableSearch::named(
                "nonexistent-command-that-does-not-exist-12345",
            )),
        );
        match handle.spawn().await {
            Err(ProcessError::ExecutableNotFound(_)) => {}
            other => panic!("Expected ExecutableNotFound, got: {:?}", other),
        }
        assert_eq!(handle.state(), ProcessState::NotStarted);
        assert!(handle.pid().is_none());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_and_terminate() {
        let mut handle = ProcessHandle::new(
            "sleeper",
            ProcessConfig::new(ExecutableSearch::named("sleep"))
                .args(["30"])
                .startup_grace(Duration::from_millis(50)),
        );
        handle.spawn().await.unwrap();
        assert_eq!(handle.state(), ProcessState::Running);
        assert!(handle.pid().is_some());
        assert!(handle.started_at().is_some());
        assert!(handle.is_alive());

        handle.terminate(Duration::from_secs(2)).await.unwrap();
        assert_eq!(handle.state(), ProcessState::Stopped);
        assert!(!handle.is_alive());

        // Idempotent
        handle.terminate(Duration::from_secs(2)).await.unwrap();
        assert_eq!(handle.state(), ProcessState::Stopped);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_immediate_exit_is_crash() {
        let mut handle = ProcessHandle::new(
            "crasher",
            sh("echo 'model file missing' >&2; exit 3").startup_grace(Duration::from_secs(2)),
        );
        match handle.spawn().await {
            Err(ProcessError::Crashed { exit_code, stderr }) => {
                assert_eq!(exit_code, Some(3));
                assert!(stderr.contains("model file missing"), "stderr: {}", stderr);
            }
            other => panic!("Expected Crashed, got: {:?}", other),
        }
        assert_eq!(handle.state(), ProcessState::Crashed);
        assert_eq!(handle.exit_code(), Some(3));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_twice_is_rejected() {
        let mut handle = ProcessHandle::new(
            "sleeper",
            ProcessConfig::new(ExecutableSearch::named("sleep"))
                .args(["30"])
                .startup_grace(Duration::from_millis(20)),
        );
        handle.spawn().await.unwrap();
        assert!(matches!(
            handle.spawn().await,
            Err(ProcessError::InvalidTransition { .. })
        ));
        handle.terminate(Duration::from_secs(2)).await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_poll_exit_detects_late_crash() {
        let mut handle = ProcessHandle::new(
            "late-crasher",
            sh("sleep 0.3; exit 4").startup_grace(Duration::from_millis(20)),
        );
        handle.spawn().await.unwrap();
        assert_eq!(handle.state(), ProcessState::Running);
        assert!(handle.poll_exit().await.is_none());

        tokio::time::sleep(Duration::from_millis(800)).await;
        match handle.poll_exit().await {
            Some(ProcessError::Crashed { exit_code, .. }) => assert_eq!(exit_code, Some(4)),
            other => panic!("Expected Crashed, got: {:?}", other),
        }
        assert_eq!(handle.state(), ProcessState::Crashed);

        // Terminating a crashed handle is a no-op
        handle.terminate(Duration::from_millis(100)).await.unwrap();
        assert_eq!(handle.state(), ProcessState::Crashed);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_terminate_escalates_to_kill() {
        let mut handle = ProcessHandle::new(
            "stubborn",
            sh("trap '' TERM; exec sleep 30").startup_grace(Duration::from_millis(50)),
        );
        handle.spawn().await.unwrap();

        let start = Instant::now();
        handle.terminate(Duration::from_millis(200)).await.unwrap();
        assert_eq!(handle.state(), ProcessState::Stopped);
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_terminate_not_started_is_noop() {
        let mut handle = ProcessHandle::new("idle", sh("true"));
        handle.terminate(Duration::from_millis(10)).await.unwrap();
        assert_eq!(handle.state(), ProcessState::NotStarted);
    }
}
