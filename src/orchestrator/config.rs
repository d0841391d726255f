//! Plan file format
//!
//! JSON description of a launch plan. Unset per-stage fields fall back to
//! [`LaunchDefaults`], which the binaries populate from the environment.

use crate::launcher::{
    LaunchError, Launcher, LauncherSettings, LlamaCpp, LlamaCppLauncher, Ollama, OllamaLauncher,
    OpenAiCompatible, OpenAiCompatibleLauncher, Router, RouterLauncher, ServerSettings,
};
use crate::orchestrator::plan::{Backoff, LaunchPlan, PlanError, Stage};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Values used for anything a plan file leaves unset
#[derive(Debug, Clone, PartialEq)]
pub struct LaunchDefaults {
    /// Per-attempt readiness timeout
    pub timeout: Duration,
    /// Delay between readiness probes
    pub poll_interval: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay policy between attempts
    pub backoff: Backoff,
    /// Launcher timing knobs
    pub launcher: LauncherSettings,
}

impl Default for LaunchDefaults {
    fn default() -> Self {
        Self {
            timeout: Stage::DEFAULT_TIMEOUT,
            poll_interval: Stage::DEFAULT_POLL_INTERVAL,
            max_retries: Stage::DEFAULT_MAX_RETRIES,
            backoff: Backoff::default(),
            launcher: LauncherSettings::default(),
        }
    }
}

/// Runtime section of a stage, tagged by `kind`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RuntimeConfig {
    /// `ollama serve`
    Ollama {
        /// Host, port, executable, extra args and env
        #[serde(flatten)]
        server: ServerSettings,
    },
    /// `llama-server`
    LlamaCpp {
        /// GGUF model path
        model: PathBuf,
        /// Context size
        #[serde(default)]
        ctx_size: Option<u32>,
        /// Host, port, executable, extra args and env
        #[serde(flatten)]
        server: ServerSettings,
    },
    /// vLLM or another OpenAI-compatible server
    OpenAiCompatible {
        /// Model to serve
        model: String,
        /// Host, port, executable, extra args and env
        #[serde(flatten)]
        server: ServerSettings,
    },
    /// The chat router
    Router {
        /// Health endpoint path (default `/api/health`)
        #[serde(default)]
        health_path: Option<String>,
        /// Host, port, executable, extra args and env
        #[serde(flatten)]
        server: ServerSettings,
    },
}

impl RuntimeConfig {
    fn build(
        self,
        name: &str,
        settings: LauncherSettings,
    ) -> Result<Arc<dyn Launcher>, LaunchError> {
        let launcher: Arc<dyn Launcher> = match self {
            RuntimeConfig::Ollama { server } => {
                Arc::new(OllamaLauncher::new(name, Ollama, server, settings)?)
            }
            RuntimeConfig::LlamaCpp {
                model,
                ctx_size,
                server,
            } => Arc::new(LlamaCppLauncher::new(
                name,
                LlamaCpp { model, ctx_size },
                server,
                settings,
            )?),
            RuntimeConfig::OpenAiCompatible { model, server } => Arc::new(
                OpenAiCompatibleLauncher::new(name, OpenAiCompatible { model }, server, settings)?,
            ),
            RuntimeConfig::Router {
                health_path,
                server,
            } => {
                let router = match health_path {
                    Some(health_path) => Router { health_path },
                    None => Router::default(),
                };
                Arc::new(RouterLauncher::new(name, router, server, settings)?)
            }
        };
        Ok(launcher)
    }
}

/// One stage as written in a plan file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageConfig {
    /// Unique stage name
    pub name: String,
    /// Runtime to launch
    pub runtime: RuntimeConfig,
    /// Prerequisite stage names
    #[serde(default)]
    pub requires: Vec<String>,
    /// Whether failure blocks dependents (default true)
    #[serde(default)]
    pub required: Option<bool>,
    /// Per-attempt timeout in seconds
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Poll interval in milliseconds
    #[serde(default)]
    pub poll_interval_ms: Option<u64>,
    /// Retries after the first attempt
    #[serde(default)]
    pub max_retries: Option<u32>,
    /// Delay policy between attempts
    #[serde(default)]
    pub backoff: Option<Backoff>,
}

/// A whole plan file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Stages in declaration order
    pub stages: Vec<StageConfig>,
}

impl PlanConfig {
    /// Parse a plan from JSON text
    pub fn from_json(text: &str) -> Result<Self, PlanError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Read and parse a plan file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, PlanError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| PlanError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&text)
    }

    /// Build launchers and stages, filling unset fields from `defaults`
    ///
    /// Graph structure is not checked here; see [`LaunchPlan::validate`].
    ///
    /// # Errors
    /// `PlanError::InvalidStage` when a launcher cannot be constructed
    /// (for example a router stage without an executable).
    pub fn into_plan(self, defaults: &LaunchDefaults) -> Result<LaunchPlan, PlanError> {
        let mut stages = Vec::with_capacity(self.stages.len());
        for config in self.stages {
            let launcher = config
                .runtime
                .build(&config.name, defaults.launcher)
                .map_err(|e| PlanError::InvalidStage {
                    stage: config.name.clone(),
                    reason: e.to_string(),
                })?;

            let stage = Stage::new(config.name, launcher)
                .requires(config.requires)
                .required(config.required.unwrap_or(true))
                .timeout(
                    config
                        .timeout_secs
                        .map(Duration::from_secs)
                        .unwrap_or(defaults.timeout),
                )
                .poll_interval(
                    config
                        .poll_interval_ms
                        .map(Duration::from_millis)
                        .unwrap_or(defaults.poll_interval),
                )
                .max_retries(config.max_retries.unwrap_or(defaults.max_retries))
                .backoff(config.backoff.unwrap_or_else(|| defaults.backoff.clone()));
            stages.push(stage);
        }
        Ok(LaunchPlan::new(stages))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::RuntimeKind;

    const PLAN: &str = r#"{
        "stages": [
            {"name": "ollama", "runtime": {"kind": "ollama", "port": 11500}},
            {
                "name": "llama",
                "runtime": {"kind": "llama_cpp", "model": "/models/qwen.gguf", "ctx_size": 2048},
                "required": false,
                "timeout_secs": 120,
                "backoff": {"policy": "fixed", "delay_ms": 300}
            },
            {
                "name": "router",
                "runtime": {"kind": "router", "executable": "/opt/router/bin/router", "port": 4001},
                "requires": ["ollama", "llama"],
                "poll_interval_ms": 200,
                "max_retries": 0
            }
        ]
    }"#;

    #[test]
    fn test_parse_and_build_with_defaults() {
        let config = PlanConfig::from_json(PLAN).unwrap();
        let defaults = LaunchDefaults::default();
        let plan = config.into_plan(&defaults).unwrap();
        assert_eq!(plan.len(), 3);

        let ollama = &plan.stages()[0];
        assert_eq!(ollama.launcher.kind(), RuntimeKind::Ollama);
        assert_eq!(ollama.launcher.endpoint().port, 11500);
        assert_eq!(ollama.timeout, defaults.timeout);
        assert!(ollama.required);

        let llama = &plan.stages()[1];
        assert!(!llama.required);
        assert_eq!(llama.timeout, Duration::from_secs(120));
        assert_eq!(
            llama.backoff,
            Backoff::Fixed {
                delay: Duration::from_millis(300)
            }
        );
        assert_eq!(llama.launcher.endpoint().port, 8080);

        let router = &plan.stages()[2];
        assert_eq!(router.requires, vec!["ollama", "llama"]);
        assert_eq!(router.poll_interval, Duration::from_millis(200));
        assert_eq!(router.max_retries, 0);
        assert_eq!(router.launcher.endpoint().base_url(), "http://127.0.0.1:4001");

        assert!(plan.validate().is_ok());
    }

    #[test]
    fn test_router_without_executable_is_invalid_stage() {
        let config =
            PlanConfig::from_json(r#"{"stages": [{"name": "router", "runtime": {"kind": "router"}}]}"#)
                .unwrap();
        match config.into_plan(&LaunchDefaults::default()) {
            Err(PlanError::InvalidStage { stage, .. }) => assert_eq!(stage, "router"),
            other => panic!("Expected InvalidStage, got: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_runtime_kind_is_parse_error() {
        let result =
            PlanConfig::from_json(r#"{"stages": [{"name": "x", "runtime": {"kind": "docker"}}]}"#);
        assert!(matches!(result, Err(PlanError::Parse(_))));
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = PlanConfig::load(dir.path().join("missing.json"));
        assert!(matches!(result, Err(PlanError::Io { .. })));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("plan.json");
        std::fs::write(&path, PLAN).unwrap();
        let config = PlanConfig::load(&path).unwrap();
        assert_eq!(config.stages.len(), 3);
        assert_eq!(
            config.stages[1].runtime,
            RuntimeConfig::LlamaCpp {
                model: PathBuf::from("/models/qwen.gguf"),
                ctx_size: Some(2048),
                server: ServerSettings::default(),
            }
        );
    }
}
