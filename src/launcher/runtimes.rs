//! Runtime profiles
//!
//! One profile per runtime kind: where it listens by default, how to start it,
//! and what its readiness endpoint returns once it can serve.

use crate::launcher::managed::{ManagedLauncher, RuntimeProfile};
use crate::launcher::probe::ReadinessCheck;
use crate::launcher::{Endpoint, RuntimeKind};
use crate::process::ExecutableSearch;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;

/// Launcher for an Ollama server
pub type OllamaLauncher = ManagedLauncher<Ollama>;
/// Launcher for a llama.cpp server
pub type LlamaCppLauncher = ManagedLauncher<LlamaCpp>;
/// Launcher for an OpenAI-compatible server
pub type OpenAiCompatibleLauncher = ManagedLauncher<OpenAiCompatible>;
/// Launcher for the chat router
pub type RouterLauncher = ManagedLauncher<Router>;

/// Ollama (`ollama serve`)
///
/// Listens on `OLLAMA_HOST`; ready once `/api/tags` lists models.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ollama;

impl RuntimeProfile for Ollama {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Ollama
    }

    fn default_port(&self) -> u16 {
        11434
    }

    fn readiness_path(&self) -> String {
        "/api/tags".to_string()
    }

    fn readiness_check(&self) -> ReadinessCheck {
        ReadinessCheck::json_field("models")
    }

    fn executable(&self) -> ExecutableSearch {
        ExecutableSearch::named("ollama")
            .with_env_override("OLLAMA_BIN")
            .with_candidates([
                "/usr/local/bin/ollama",
                "/opt/homebrew/bin/ollama",
                "/usr/bin/ollama",
            ])
    }

    fn spawn_args(&self, _endpoint: &Endpoint) -> Vec<String> {
        vec!["serve".to_string()]
    }

    fn spawn_env(&self, endpoint: &Endpoint) -> Vec<(String, String)> {
        vec![("OLLAMA_HOST".to_string(), endpoint.authority())]
    }
}

/// llama.cpp HTTP server (`llama-server`)
///
/// `/health` answers 503 while the model loads and `{"status": "ok"}` after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LlamaCpp {
    /// Path to the GGUF model file
    pub model: PathBuf,
    /// Context size (`--ctx-size`)
    #[serde(default)]
    pub ctx_size: Option<u32>,
}

impl LlamaCpp {
    /// Profile serving `model`
    pub fn new(model: impl Into<PathBuf>) -> Self {
        Self {
            model: model.into(),
            ctx_size: None,
        }
    }
}

impl RuntimeProfile for LlamaCpp {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::LlamaCpp
    }

    fn default_port(&self) -> u16 {
        8080
    }

    fn readiness_path(&self) -> String {
        "/health".to_string()
    }

    fn readiness_check(&self) -> ReadinessCheck {
        ReadinessCheck::json_field_equals("status", json!("ok"))
    }

    fn executable(&self) -> ExecutableSearch {
        ExecutableSearch::named("llama-server")
            .with_env_override("LLAMA_SERVER_BIN")
            .with_candidates(["/usr/local/bin/llama-server", "/opt/homebrew/bin/llama-server"])
    }

    fn spawn_args(&self, endpoint: &Endpoint) -> Vec<String> {
        let mut args = vec![
            "--model".to_string(),
            self.model.display().to_string(),
            "--host".to_string(),
            endpoint.host.clone(),
            "--port".to_string(),
            endpoint.port.to_string(),
        ];
        if let Some(ctx) = self.ctx_size {
            args.push("--ctx-size".to_string());
            args.push(ctx.to_string());
        }
        args
    }
}

/// OpenAI-compatible server (`vllm serve` by default)
///
/// Ready once `/v1/models` returns a `data` list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenAiCompatible {
    /// Model name or path passed to the server
    pub model: String,
}

impl OpenAiCompatible {
    /// Profile serving `model`
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
        }
    }
}

impl RuntimeProfile for OpenAiCompatible {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::OpenAiCompatible
    }

    fn default_port(&self) -> u16 {
        8000
    }

    fn readiness_path(&self) -> String {
        "/v1/models".to_string()
    }

    fn readiness_check(&self) -> ReadinessCheck {
        ReadinessCheck::json_field("data")
    }

    fn executable(&self) -> ExecutableSearch {
        ExecutableSearch::named("vllm").with_env_override("VLLM_BIN")
    }

    fn spawn_args(&self, endpoint: &Endpoint) -> Vec<String> {
        vec![
            "serve".to_string(),
            self.model.clone(),
            "--host".to_string(),
            endpoint.host.clone(),
            "--port".to_string(),
            endpoint.port.to_string(),
        ]
    }
}

/// The chat router process
///
/// Has no default executable; the stage must configure one. The router reads
/// `HOST`/`PORT` from its environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    /// Health endpoint path
    #[serde(default = "default_router_health_path")]
    pub health_path: String,
}

fn default_router_health_path() -> String {
    "/api/health".to_string()
}

impl Default for Router {
    fn default() -> Self {
        Self {
            health_path: default_router_health_path(),
        }
    }
}

impl RuntimeProfile for Router {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Router
    }

    fn default_port(&self) -> u16 {
        4000
    }

    fn readiness_path(&self) -> String {
        self.health_path.clone()
    }

    fn readiness_check(&self) -> ReadinessCheck {
        ReadinessCheck::Status2xx
    }

    fn executable(&self) -> ExecutableSearch {
        ExecutableSearch::default()
    }

    fn spawn_args(&self, _endpoint: &Endpoint) -> Vec<String> {
        Vec::new()
    }

    fn spawn_env(&self, endpoint: &Endpoint) -> Vec<(String, String)> {
        vec![
            ("HOST".to_string(), endpoint.host.clone()),
            ("PORT".to_string(), endpoint.port.to_string()),
        ]
    }
}
