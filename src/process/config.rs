//! Process configuration
//!
//! Describes how to locate and start an executable. The orchestrator treats this
//! as opaque; only [`ProcessHandle`](crate::process::ProcessHandle) reads it.

use crate::process::error::ProcessError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default window in which an immediate exit counts as a crash
pub const DEFAULT_STARTUP_GRACE: Duration = Duration::from_millis(250);

/// Policy used to resolve the executable before spawning
///
/// Resolution order: explicit path, override environment variable,
/// well-known candidate locations, then a `PATH` lookup of `name`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ExecutableSearch {
    /// Bare program name looked up on `PATH` (e.g. "ollama")
    pub name: String,
    /// Explicit path configured by the user; wins over everything else
    pub explicit: Option<PathBuf>,
    /// Environment variable that may hold a path override (e.g. "OLLAMA_BIN")
    pub env_override: Option<String>,
    /// Well-known install locations, checked in order
    pub candidates: Vec<PathBuf>,
}

impl ExecutableSearch {
    /// Search policy that only looks up `name` on `PATH`
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Set the explicit path
    pub fn with_explicit(mut self, path: Option<PathBuf>) -> Self {
        self.explicit = path;
        self
    }

    /// Set the override environment variable
    pub fn with_env_override(mut self, var: impl Into<String>) -> Self {
        self.env_override = Some(var.into());
        self
    }

    /// Append well-known install locations
    pub fn with_candidates<I, P>(mut self, candidates: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.candidates.extend(candidates.into_iter().map(Into::into));
        self
    }

    /// Resolve the executable to a concrete path
    ///
    /// An explicit path is returned as-is when it names an existing file, or
    /// when it is a bare name (no separator) that resolves on `PATH`.
    pub fn resolve(&self) -> Result<PathBuf, ProcessError> {
        if let Some(explicit) = &self.explicit {
            if explicit.is_file() {
                return Ok(explicit.clone());
            }
            if explicit.components().count() == 1 {
                if let Some(found) = lookup_on_path(explicit) {
                    return Ok(found);
                }
            }
            return Err(ProcessError::ExecutableNotFound(
                explicit.display().to_string(),
            ));
        }

        if let Some(var) = &self.env_override {
            if let Some(value) = std::env::var_os(var) {
                let path = PathBuf::from(value);
                if path.is_file() {
                    return Ok(path);
                }
                tracing::warn!(
                    env_var = %var,
                    path = %path.display(),
                    "Executable override does not point to a file, continuing search"
                );
            }
        }

        if let Some(found) = self.candidates.iter().find(|path| path.is_file()) {
            return Ok(found.clone());
        }

        if self.name.is_empty() {
            return Err(ProcessError::ExecutableNotFound(
                "no executable configured".to_string(),
            ));
        }

        lookup_on_path(Path::new(&self.name))
            .ok_or_else(|| ProcessError::ExecutableNotFound(self.name.clone()))
    }
}

fn lookup_on_path(name: &Path) -> Option<PathBuf> {
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|candidate| candidate.is_file())
}

/// Everything needed to start one OS process
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessConfig {
    /// How to find the executable
    pub executable: ExecutableSearch,
    /// Command-line arguments
    pub args: Vec<String>,
    /// Environment overrides layered on top of the inherited environment
    pub env: HashMap<String, String>,
    /// Working directory (None = inherit)
    pub working_dir: Option<PathBuf>,
    /// Exits observed within this window after spawning count as crashes
    #[serde(with = "duration_ms")]
    pub startup_grace: Duration,
}

impl ProcessConfig {
    /// Create a configuration for the given executable search policy
    pub fn new(executable: ExecutableSearch) -> Self {
        Self {
            executable,
            args: Vec::new(),
            env: HashMap::new(),
            working_dir: None,
            startup_grace: DEFAULT_STARTUP_GRACE,
        }
    }

    /// Append arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add one environment override
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory
    pub fn working_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.working_dir = dir;
        self
    }

    /// Set the startup grace window
    pub fn startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }
}

/// Serialize a `Duration` as integer milliseconds
pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}
