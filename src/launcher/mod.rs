//! Launcher module
//!
//! A launcher knows how to bring one runtime kind to a ready state: detect an
//! instance that is already serving, spawn a new one otherwise, and poll an
//! application-level probe until it answers.
//!
//! New runtime kinds are added as a [`RuntimeProfile`] implementation plugged
//! into [`ManagedLauncher`]; nothing else branches on the kind.

pub mod error;
pub mod managed;
pub mod probe;
pub mod runtimes;

pub use error::LaunchError;
pub use managed::{LauncherSettings, ManagedLauncher, OwnershipKind, RuntimeProfile, ServerSettings};
pub use probe::{HttpProbe, ProbeResult, ReadinessCheck};
pub use runtimes::{
    LlamaCpp, LlamaCppLauncher, Ollama, OllamaLauncher, OpenAiCompatible, OpenAiCompatibleLauncher,
    Router, RouterLauncher,
};

use crate::cancel::CancellationToken;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Runtime kinds the launcher knows how to start
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuntimeKind {
    /// Ollama server
    Ollama,
    /// llama.cpp `llama-server`
    LlamaCpp,
    /// OpenAI-compatible server (vLLM, LM Studio, ...)
    OpenAiCompatible,
    /// The chat router that depends on the inference runtimes
    Router,
}

impl RuntimeKind {
    /// Display name for logs and reports
    pub fn display_name(&self) -> &'static str {
        match self {
            RuntimeKind::Ollama => "Ollama",
            RuntimeKind::LlamaCpp => "llama.cpp server",
            RuntimeKind::OpenAiCompatible => "OpenAI-compatible server",
            RuntimeKind::Router => "Router",
        }
    }
}

/// Network location of a runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    /// Host name or address
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl Endpoint {
    /// Create an endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Base URL, e.g. `http://127.0.0.1:11434`
    pub fn base_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }

    /// `host:port`
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Whether the runtime was found running or started by us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Detection {
    /// An instance was already serving; we attached without owning it
    AlreadyRunning,
    /// We spawned and own the process
    Spawned,
}

/// Where a ready runtime can be reached, for audit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// Base URL of the runtime
    pub url: String,
    /// How the instance was obtained
    pub detection: Detection,
    /// PID of the spawned process (None when attached)
    pub pid: Option<u32>,
}

/// Outcome of [`Launcher::detect`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectOutcome {
    /// Something is already answering on the endpoint
    AlreadyRunning(EndpointInfo),
    /// Nothing answered
    NotRunning,
}

/// Outcome of [`Launcher::ensure_ready`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadyOutcome {
    /// The runtime passed its readiness probe
    Ready(EndpointInfo),
    /// The runtime could not be made ready
    Failed {
        /// Why
        error: LaunchError,
        /// Time spent in this attempt
        elapsed: Duration,
    },
}

impl ReadyOutcome {
    /// Convenience constructor for a failure
    pub fn failed(error: LaunchError, elapsed: Duration) -> Self {
        ReadyOutcome::Failed { error, elapsed }
    }
}

/// Strategy for bringing one runtime kind up
///
/// Implementations must never report readiness from process existence alone,
/// and `shutdown` must never stop a process the launcher did not spawn.
#[async_trait]
pub trait Launcher: Send + Sync {
    /// Name of the stage this launcher serves
    fn name(&self) -> &str;

    /// Runtime kind
    fn kind(&self) -> RuntimeKind;

    /// Endpoint used for detection and readiness probing
    fn endpoint(&self) -> &Endpoint;

    /// Probe the endpoint once with a short timeout
    ///
    /// Never spawns and never fails: connection errors map to `NotRunning`.
    async fn detect(&self) -> DetectOutcome;

    /// Detect or spawn, then poll until ready, crashed, timed out, or cancelled
    async fn ensure_ready(
        &self,
        timeout: Duration,
        poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> ReadyOutcome;

    /// Stop the runtime if this launcher spawned it; no-op otherwise
    async fn shutdown(&self) -> Result<(), LaunchError>;
}
