//! Launcher error types
//!
//! Per-stage failures recorded into a `StageResult`. These never escape a launch
//! run as a fatal error.

use crate::process::ProcessError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a launcher could not bring its runtime to a ready state
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LaunchError {
    /// Executable not found or the OS refused to create the process
    #[error("Spawn failed: {message}")]
    Spawn {
        /// Underlying cause
        message: String,
    },

    /// The process exited before becoming ready
    #[error("Process exited before becoming ready (exit code {exit_code:?}): {stderr}")]
    Crashed {
        /// Exit code, if any
        exit_code: Option<i32>,
        /// Tail of captured stderr
        stderr: String,
    },

    /// Readiness was not confirmed in time
    #[error("Readiness not confirmed within {after_ms} ms")]
    Timeout {
        /// Configured timeout that elapsed
        after_ms: u64,
    },

    /// The run was cancelled by the caller
    #[error("Launch cancelled")]
    Cancelled,

    /// Stopping an owned process failed
    #[error("Shutdown failed: {message}")]
    Shutdown {
        /// Underlying cause
        message: String,
    },

    /// The launcher configuration is unusable
    #[error("Invalid launcher configuration: {message}")]
    InvalidConfig {
        /// What is wrong
        message: String,
    },
}

impl LaunchError {
    /// Whether another attempt may succeed
    ///
    /// Spawn failures, crashes and timeouts are retried, bounded by the
    /// stage's retry limit. Cancellation, shutdown and configuration errors
    /// are final.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LaunchError::Spawn { .. } | LaunchError::Crashed { .. } | LaunchError::Timeout { .. }
        )
    }

    /// Short machine-friendly name of the variant
    pub fn kind(&self) -> &'static str {
        match self {
            LaunchError::Spawn { .. } => "spawn",
            LaunchError::Crashed { .. } => "crashed",
            LaunchError::Timeout { .. } => "timeout",
            LaunchError::Cancelled => "cancelled",
            LaunchError::Shutdown { .. } => "shutdown",
            LaunchError::InvalidConfig { .. } => "invalid_config",
        }
    }
}

impl From<ProcessError> for LaunchError {
    fn from(e: ProcessError) -> Self {
        match e {
            ProcessError::Crashed { exit_code, stderr } => LaunchError::Crashed { exit_code, stderr },
            other => LaunchError::Spawn {
                message: other.to_string(),
            },
        }
    }
}
