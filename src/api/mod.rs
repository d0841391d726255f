//! API module
//!
//! HTTP handlers for the launch control surface used by the GUI and health checks.

pub mod handlers;
pub mod launch;

pub use handlers::{health_check, HealthResponse, MessageResponse};
