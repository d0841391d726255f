//! Router Launcher Library
//!
//! Brings up local inference runtimes and the chat router that depends on
//! them, in dependency order, and reports a structured per-stage outcome.
//! The server binary is in `src/main.rs`; `launch-once` runs a single plan.

pub mod api;
pub mod cancel;
pub mod config;
pub mod error;
pub mod launcher;
pub mod orchestrator;
pub mod process;
/// Application state management
///
/// Holds the orchestrator and the active launch for the HTTP API.
pub mod state;
