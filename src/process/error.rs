//! Process-specific error types
//!
//! Errors that can occur while spawning, observing, or terminating a child process.

use crate::process::handle::ProcessState;
use thiserror::Error;

/// Errors raised by [`ProcessHandle`](crate::process::ProcessHandle)
#[derive(Error, Debug)]
pub enum ProcessError {
    /// No executable could be resolved from the search policy
    #[error("Executable not found: {0}")]
    ExecutableNotFound(String),

    /// The OS refused to create the process (permission denied, bad path, ...)
    #[error("Failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),

    /// The process exited inside the startup grace window
    #[error("Process exited during startup (exit code {exit_code:?}): {stderr}")]
    Crashed {
        /// Exit code, if the process exited normally
        exit_code: Option<i32>,
        /// Tail of the captured stderr output
        stderr: String,
    },

    /// The requested lifecycle transition is not permitted
    #[error("Invalid process state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        /// State the handle was in
        from: ProcessState,
        /// State that was requested
        to: ProcessState,
    },

    /// Waiting on or signalling the child failed
    #[error("Failed to wait for process: {0}")]
    Wait(#[source] std::io::Error),
}
