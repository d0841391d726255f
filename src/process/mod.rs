//! Process lifecycle module
//!
//! Spawning, observing, and terminating single OS processes. No orchestration
//! logic lives here; launchers decide when to create a handle.

pub mod config;
pub mod error;
pub mod handle;

pub use config::{ExecutableSearch, ProcessConfig, DEFAULT_STARTUP_GRACE};
pub use error::ProcessError;
pub use handle::{ProcessHandle, ProcessState};
