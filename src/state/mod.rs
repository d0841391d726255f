//! Application state management
//!
//! Tracks the active launch plan and its cancellation token for the HTTP API.

pub mod app_state;

pub use app_state::{ActiveLaunch, AppState, SharedState};
