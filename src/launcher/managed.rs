//! Managed launcher
//!
//! The detect / spawn / poll-until-ready algorithm shared by every runtime kind.
//! Runtime-specific knowledge (ports, executables, arguments, readiness checks)
//! comes from a [`RuntimeProfile`].

use crate::cancel::CancellationToken;
use crate::launcher::error::LaunchError;
use crate::launcher::probe::{HttpProbe, ProbeResult, ReadinessCheck};
use crate::launcher::{
    DetectOutcome, Detection, Endpoint, EndpointInfo, Launcher, ReadyOutcome, RuntimeKind,
};
use crate::process::config::duration_ms;
use crate::process::{ExecutableSearch, ProcessConfig, ProcessHandle, DEFAULT_STARTUP_GRACE};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Lower bound for a single probe request near the deadline
const MIN_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

/// Runtime-specific knowledge plugged into [`ManagedLauncher`]
pub trait RuntimeProfile: Send + Sync + 'static {
    /// Runtime kind
    fn kind(&self) -> RuntimeKind;

    /// Port used when the stage does not configure one
    fn default_port(&self) -> u16;

    /// Path probed for readiness (e.g. "/health")
    fn readiness_path(&self) -> String;

    /// How the probe response is judged
    fn readiness_check(&self) -> ReadinessCheck;

    /// Default executable search policy
    fn executable(&self) -> ExecutableSearch;

    /// Arguments that make the runtime listen on `endpoint`
    fn spawn_args(&self, endpoint: &Endpoint) -> Vec<String>;

    /// Environment needed to make the runtime listen on `endpoint`
    fn spawn_env(&self, _endpoint: &Endpoint) -> Vec<(String, String)> {
        Vec::new()
    }
}

/// Per-stage server settings shared by all runtime kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerSettings {
    /// Host to listen on and probe
    #[serde(default = "default_host")]
    pub host: String,
    /// Port to listen on and probe (None = runtime default)
    #[serde(default)]
    pub port: Option<u16>,
    /// Explicit executable path or name
    #[serde(default)]
    pub executable: Option<PathBuf>,
    /// Extra arguments appended after the runtime's own
    #[serde(default)]
    pub args: Vec<String>,
    /// Extra environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the spawned process
    #[serde(default)]
    pub working_dir: Option<PathBuf>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: None,
            executable: None,
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
        }
    }
}

/// Timing knobs for a launcher
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LauncherSettings {
    /// Timeout of the single detection probe
    #[serde(with = "duration_ms")]
    pub detect_timeout: Duration,
    /// Upper bound of each readiness probe request
    #[serde(with = "duration_ms")]
    pub probe_timeout: Duration,
    /// Grace period given to an owned process on shutdown
    #[serde(with = "duration_ms")]
    pub terminate_grace: Duration,
    /// Early-exit window after spawning
    #[serde(with = "duration_ms")]
    pub startup_grace: Duration,
}

impl Default for LauncherSettings {
    fn default() -> Self {
        Self {
            detect_timeout: Duration::from_secs(2),
            probe_timeout: Duration::from_secs(2),
            terminate_grace: Duration::from_secs(5),
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }
}

/// Who is responsible for the runtime process
enum Ownership {
    /// Nothing detected or spawned yet
    Idle,
    /// An external instance is serving; never stop it
    Attached,
    /// We spawned this process and must stop it
    Owned(ProcessHandle),
}

/// Public view of a launcher's ownership state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OwnershipKind {
    /// Nothing detected or spawned
    Idle,
    /// Attached to an instance we did not start
    Attached,
    /// Owns a spawned process
    Owned,
}

/// Launcher for an HTTP-serving runtime described by a [`RuntimeProfile`]
pub struct ManagedLauncher<R: RuntimeProfile> {
    name: String,
    runtime: R,
    endpoint: Endpoint,
    settings: LauncherSettings,
    process: ProcessConfig,
    probe: HttpProbe,
    ownership: Mutex<Ownership>,
    spawn_count: AtomicUsize,
    last_pid: AtomicU32,
}

impl<R: RuntimeProfile> ManagedLauncher<R> {
    /// Build a launcher for stage `name`
    ///
    /// # Errors
    /// Returns `LaunchError::InvalidConfig` when no executable can ever be
    /// resolved (a runtime without a default program and no explicit path).
    pub fn new(
        name: impl Into<String>,
        runtime: R,
        server: ServerSettings,
        settings: LauncherSettings,
    ) -> Result<Self, LaunchError> {
        let name = name.into();
        let endpoint = Endpoint::new(server.host, server.port.unwrap_or(runtime.default_port()));

        let executable = runtime.executable().with_explicit(server.executable);
        if executable.name.is_empty()
            && executable.explicit.is_none()
            && executable.env_override.is_none()
            && executable.candidates.is_empty()
        {
            return Err(LaunchError::InvalidConfig {
                message: format!(
                    "stage '{}' ({}) has no executable configured",
                    name,
                    runtime.kind().display_name()
                ),
            });
        }

        let mut process = ProcessConfig::new(executable)
            .args(runtime.spawn_args(&endpoint))
            .args(server.args)
            .working_dir(server.working_dir)
            .startup_grace(settings.startup_grace);
        for (key, value) in runtime.spawn_env(&endpoint) {
            process = process.env(key, value);
        }
        for (key, value) in server.env {
            process = process.env(key, value);
        }

        let probe = HttpProbe::new(
            format!("{}{}", endpoint.base_url(), runtime.readiness_path()),
            runtime.readiness_check(),
        );

        Ok(Self {
            name,
            runtime,
            endpoint,
            settings,
            process,
            probe,
            ownership: Mutex::new(Ownership::Idle),
            spawn_count: AtomicUsize::new(0),
            last_pid: AtomicU32::new(0),
        })
    }

    /// Process configuration used when spawning
    pub fn process_config(&self) -> &ProcessConfig {
        &self.process
    }

    /// URL probed for readiness
    pub fn probe_url(&self) -> &str {
        self.probe.url()
    }

    /// Number of process handles this launcher has created
    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }

    /// PID of the most recently spawned process
    pub fn last_spawned_pid(&self) -> Option<u32> {
        match self.last_pid.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid),
        }
    }

    /// Current ownership state
    pub async fn ownership(&self) -> OwnershipKind {
        match &*self.ownership.lock().await {
            Ownership::Idle => OwnershipKind::Idle,
            Ownership::Attached => OwnershipKind::Attached,
            Ownership::Owned(_) => OwnershipKind::Owned,
        }
    }

    fn endpoint_info(&self, detection: Detection, pid: Option<u32>) -> EndpointInfo {
        EndpointInfo {
            url: self.endpoint.base_url(),
            detection,
            pid,
        }
    }

    /// Spawn a fresh process, replacing any stale owned handle
    async fn spawn_process(&self) -> Result<(), LaunchError> {
        let mut ownership = self.ownership.lock().await;
        if let Ownership::Owned(stale) = &mut *ownership {
            if let Err(e) = stale.terminate(self.settings.terminate_grace).await {
                warn!(stage = %self.name, error = %e, "Failed to stop stale process");
            }
        }

        let mut handle = ProcessHandle::new(self.name.clone(), self.process.clone());
        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        let result = handle.spawn().await;
        if let Some(pid) = handle.pid() {
            self.last_pid.store(pid, Ordering::SeqCst);
        }

        match result {
            Ok(()) => {
                info!(
                    stage = %self.name,
                    runtime = self.runtime.kind().display_name(),
                    pid = ?handle.pid(),
                    endpoint = %self.endpoint.base_url(),
                    "Spawned runtime process"
                );
                *ownership = Ownership::Owned(handle);
                Ok(())
            }
            Err(e) => {
                *ownership = Ownership::Idle;
                Err(e.into())
            }
        }
    }

    /// Fail-fast check: has our own process died?
    async fn owned_exit(&self) -> Option<LaunchError> {
        let mut ownership = self.ownership.lock().await;
        match &mut *ownership {
            Ownership::Owned(handle) => handle.poll_exit().await.map(LaunchError::from),
            _ => None,
        }
    }

    async fn owned_pid(&self) -> Option<u32> {
        match &*self.ownership.lock().await {
            Ownership::Owned(handle) => handle.pid(),
            _ => None,
        }
    }

    /// Stop a process we spawned that never became ready
    async fn release_unready(&self) {
        let mut ownership = self.ownership.lock().await;
        if let Ownership::Owned(handle) = &mut *ownership {
            if let Err(e) = handle.terminate(self.settings.terminate_grace).await {
                warn!(stage = %self.name, error = %e, "Failed to stop unready process");
            }
        }
        *ownership = Ownership::Idle;
    }

    /// Poll readiness until ready, crashed, timed out, or cancelled
    async fn poll_until_ready(
        &self,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<(), LaunchError> {
        let deadline = started + timeout;
        let mut probes = 0u32;

        loop {
            if cancel.is_cancelled() {
                return Err(LaunchError::Cancelled);
            }
            if let Some(crash) = self.owned_exit().await {
                return Err(crash);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            let request_timeout = self
                .settings
                .probe_timeout
                .min(remaining)
                .max(MIN_PROBE_TIMEOUT);
            probes += 1;
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(LaunchError::Cancelled),
                result = self.probe.check(request_timeout) => result,
            };
            match result {
                ProbeResult::Ready => {
                    debug!(stage = %self.name, probes, "Readiness probe succeeded");
                    return Ok(());
                }
                ProbeResult::NotReady(detail) | ProbeResult::Unreachable(detail) => {
                    debug!(stage = %self.name, probes, detail = %detail, "Not ready yet");
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(LaunchError::Timeout {
                    after_ms: timeout.as_millis() as u64,
                });
            }
            let nap = poll_interval.min(deadline - now);
            tokio::select! {
                _ = cancel.cancelled() => return Err(LaunchError::Cancelled),
                _ = tokio::time::sleep(nap) => {}
            }
        }
    }
}

#[async_trait]
impl<R: RuntimeProfile> Launcher for ManagedLauncher<R> {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RuntimeKind {
        self.runtime.kind()
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn detect(&self) -> DetectOutcome {
        let result = self.probe.check(self.settings.detect_timeout).await;
        debug!(stage = %self.name, url = %self.probe.url(), result = ?result, "Detection probe");
        if result.is_responding() {
            DetectOutcome::AlreadyRunning(self.endpoint_info(Detection::AlreadyRunning, None))
        } else {
            DetectOutcome::NotRunning
        }
    }

    async fn ensure_ready(
        &self,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> ReadyOutcome {
        let started = Instant::now();
        let detected = tokio::select! {
            _ = cancel.cancelled() => {
                return ReadyOutcome::failed(LaunchError::Cancelled, started.elapsed());
            }
            detected = self.detect() => detected,
        };

        let detection = match detected {
            DetectOutcome::AlreadyRunning(_) => {
                let mut ownership = self.ownership.lock().await;
                // Our own process from an earlier call may still be serving.
                if matches!(*ownership, Ownership::Owned(_)) {
                    Detection::Spawned
                } else {
                    info!(
                        stage = %self.name,
                        endpoint = %self.endpoint.base_url(),
                        "Runtime already running, attaching without ownership"
                    );
                    *ownership = Ownership::Attached;
                    Detection::AlreadyRunning
                }
            }
            DetectOutcome::NotRunning => {
                if let Err(error) = self.spawn_process().await {
                    warn!(stage = %self.name, error = %error, "Failed to start runtime");
                    return ReadyOutcome::failed(error, started.elapsed());
                }
                Detection::Spawned
            }
        };

        match self
            .poll_until_ready(timeout, poll_interval, cancel, started)
            .await
        {
            Ok(()) => {
                let pid = self.owned_pid().await;
                info!(
                    stage = %self.name,
                    detection = ?detection,
                    pid = ?pid,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Runtime ready"
                );
                ReadyOutcome::Ready(self.endpoint_info(detection, pid))
            }
            Err(error) => {
                self.release_unready().await;
                ReadyOutcome::failed(error, started.elapsed())
            }
        }
    }

    async fn shutdown(&self) -> Result<(), LaunchError> {
        let mut ownership = self.ownership.lock().await;
        match std::mem::replace(&mut *ownership, Ownership::Idle) {
            Ownership::Owned(mut handle) => {
                info!(stage = %self.name, pid = ?handle.pid(), "Stopping owned runtime");
                handle
                    .terminate(self.settings.terminate_grace)
                    .await
                    .map_err(|e| LaunchError::Shutdown {
                        message: e.to_string(),
                    })
            }
            Ownership::Attached => {
                info!(
                    stage = %self.name,
                    "Runtime was started externally, leaving it running"
                );
                Ok(())
            }
            Ownership::Idle => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::runtimes::{LlamaCpp, Ollama, Router};
    use mockito::Server;

    fn fast_settings() -> LauncherSettings {
        LauncherSettings {
            detect_timeout: Duration::from_millis(300),
            probe_timeout: Duration::from_millis(300),
            terminate_grace: Duration::from_secs(2),
            startup_grace: Duration::from_millis(50),
        }
    }

    fn unused_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn server_at(url: &str) -> ServerSettings {
        let authority = url.trim_start_matches("http://");
        let (host, port) = authority.split_once(':').unwrap();
        ServerSettings {
            host: host.to_string(),
            port: Some(port.parse().unwrap()),
            ..Default::default()
        }
    }

    #[test]
    fn test_router_without_executable_is_invalid() {
        let result = ManagedLauncher::new(
            "router",
            Router::default(),
            ServerSettings::default(),
            LauncherSettings::default(),
        );
        assert!(matches!(result, Err(LaunchError::InvalidConfig { .. })));
    }

    #[test]
    fn test_process_config_includes_runtime_and_extra_args() {
        let mut server = ServerSettings {
            port: Some(9999),
            args: vec!["--threads".to_string(), "4".to_string()],
            ..Default::default()
        };
        server.env.insert("CUDA_VISIBLE_DEVICES".to_string(), "0".to_string());
        let launcher = ManagedLauncher::new(
            "llama",
            LlamaCpp::new("/models/tiny.gguf"),
            server,
            LauncherSettings::default(),
        )
        .unwrap();

        let args = &launcher.process_config().args;
        assert_eq!(&args[..2], &["--model", "/models/tiny.gguf"]);
        assert!(args.windows(2).any(|w| w == ["--port", "9999"]));
        assert_eq!(&args[args.len() - 2..], &["--threads", "4"]);
        assert_eq!(
            launcher.process_config().env.get("CUDA_VISIBLE_DEVICES").unwrap(),
            "0"
        );
        assert_eq!(launcher.probe_url(), "http://127.0.0.1:9999/health");
    }

    #[tokio::test]
    async fn test_detect_not_running() {
        let launcher = ManagedLauncher::new(
            "ollama",
            Ollama,
            ServerSettings {
                port: Some(unused_port()),
                ..Default::default()
            },
            fast_settings(),
        )
        .unwrap();
        assert_eq!(launcher.detect().await, DetectOutcome::NotRunning);
        assert_eq!(launcher.spawn_count(), 0);
    }

    #[tokio::test]
    async fn test_ensure_ready_attaches_to_running_instance() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/api/tags")
            .with_status(200)
            .with_body(r#"{"models": [{"name": "llama3"}]}"#)
            .expect_at_least(2)
            .create_async()
            .await;

        let launcher =
            ManagedLauncher::new("ollama", Ollama, server_at(&server.url()), fast_settings())
                .unwrap();
        let outcome = launcher
            .ensure_ready(
                Duration::from_secs(5),
                Duration::from_millis(50),
                &CancellationToken::new(),
            )
            .await;

        match outcome {
            ReadyOutcome::Ready(info) => {
                assert_eq!(info.detection, Detection::AlreadyRunning);
                assert!(info.pid.is_none());
            }
            other => panic!("Expected Ready, got: {:?}", other),
        }
        mock.assert_async().await;
        assert_eq!(launcher.spawn_count(), 0);
        assert_eq!(launcher.ownership().await, OwnershipKind::Attached);

        // Never stops what it did not start
        launcher.shutdown().await.unwrap();
        assert_eq!(launcher.ownership().await, OwnershipKind::Idle);
    }

    #[tokio::test]
    async fn test_ensure_ready_times_out_on_never_healthy_endpoint() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/health")
            .with_status(503)
            .with_body(r#"{"error": {"message": "Loading model"}}"#)
            .expect_at_least(1)
            .create_async()
            .await;

        let launcher = ManagedLauncher::new(
            "llama",
            LlamaCpp::new("/models/tiny.gguf"),
            server_at(&server.url()),
            fast_settings(),
        )
        .unwrap();

        let timeout = Duration::from_millis(800);
        let poll = Duration::from_millis(100);
        let start = Instant::now();
        let outcome = launcher
            .ensure_ready(timeout, poll, &CancellationToken::new())
            .await;
        let elapsed = start.elapsed();

        match outcome {
            ReadyOutcome::Failed { error, .. } => {
                assert_eq!(error, LaunchError::Timeout { after_ms: 800 })
            }
            other => panic!("Expected timeout, got: {:?}", other),
        }
        assert!(elapsed >= timeout, "returned early: {:?}", elapsed);
        assert!(
            elapsed < timeout + poll + Duration::from_secs(1),
            "returned late: {:?}",
            elapsed
        );
        mock.assert_async().await;
        assert_eq!(launcher.spawn_count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawn_failure_returns_immediately() {
        let launcher = ManagedLauncher::new(
            "router",
            Router::default(),
            ServerSettings {
                port: Some(unused_port()),
                executable: Some(PathBuf::from("/nonexistent/router-binary-12345")),
                ..Default::default()
            },
            fast_settings(),
        )
        .unwrap();

        let start = Instant::now();
        let outcome = launcher
            .ensure_ready(
                Duration::from_secs(30),
                Duration::from_millis(100),
                &CancellationToken::new(),
            )
            .await;
        assert!(matches!(
            outcome,
            ReadyOutcome::Failed {
                error: LaunchError::Spawn { .. },
                ..
            }
        ));
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(launcher.spawn_count(), 1);
        assert_eq!(launcher.ownership().await, OwnershipKind::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_crash_while_polling_fails_fast() {
        let launcher = ManagedLauncher::new(
            "router",
            Router::default(),
            ServerSettings {
                port: Some(unused_port()),
                executable: Some(PathBuf::from("sh")),
                args: vec!["-c".to_string(), "sleep 0.3; exit 7".to_string()],
                ..Default::default()
            },
            fast_settings(),
        )
        .unwrap();

        let start = Instant::now();
        let outcome = launcher
            .ensure_ready(
                Duration::from_secs(30),
                Duration::from_millis(100),
                &CancellationToken::new(),
            )
            .await;
        match outcome {
            ReadyOutcome::Failed {
                error: LaunchError::Crashed { exit_code, .. },
                ..
            } => assert_eq!(exit_code, Some(7)),
            other => panic!("Expected Crashed, got: {:?}", other),
        }
        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(launcher.ownership().await, OwnershipKind::Idle);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancel_terminates_spawned_process() {
        let launcher = ManagedLauncher::new(
            "router",
            Router::default(),
            ServerSettings {
                port: Some(unused_port()),
                executable: Some(PathBuf::from("sleep")),
                args: vec!["30".to_string()],
                ..Default::default()
            },
            fast_settings(),
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(400)).await;
            trigger.cancel();
        });

        let outcome = launcher
            .ensure_ready(Duration::from_secs(30), Duration::from_millis(100), &cancel)
            .await;
        assert!(matches!(
            outcome,
            ReadyOutcome::Failed {
                error: LaunchError::Cancelled,
                ..
            }
        ));
        assert_eq!(launcher.spawn_count(), 1);
        assert!(launcher.last_spawned_pid().is_some());
        assert_eq!(launcher.ownership().await, OwnershipKind::Idle);
    }

    #[tokio::test]
    async fn test_cancel_interrupts_unanswered_detection() {
        // Accepts connections but never answers them
        let silent = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = silent.local_addr().unwrap().port();
        let settings = LauncherSettings {
            detect_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(10),
            ..fast_settings()
        };
        let launcher = ManagedLauncher::new(
            "ollama",
            Ollama,
            ServerSettings {
                port: Some(port),
                ..Default::default()
            },
            settings,
        )
        .unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let start = Instant::now();
        let outcome = launcher
            .ensure_ready(Duration::from_secs(30), Duration::from_millis(100), &cancel)
            .await;
        assert!(matches!(
            outcome,
            ReadyOutcome::Failed {
                error: LaunchError::Cancelled,
                ..
            }
        ));
        assert!(start.elapsed() < Duration::from_secs(2), "{:?}", start.elapsed());
        assert_eq!(launcher.spawn_count(), 0);
        assert_eq!(launcher.ownership().await, OwnershipKind::Idle);
    }
}
