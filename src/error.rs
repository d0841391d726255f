//! Error types and error handling for the HTTP API
//!
//! All errors implement `IntoResponse` to provide consistent error formatting.

use crate::orchestrator::PlanError;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Application-level error types
#[derive(Error, Debug)]
pub enum AppError {
    /// The plan could not be loaded or failed validation
    #[error("Invalid plan: {0}")]
    InvalidPlan(#[from] PlanError),

    /// A launch request arrived without a plan and none is configured
    #[error("No launch plan supplied and LAUNCH_PLAN is not set")]
    NoPlanConfigured,

    /// Another launch is still in flight
    #[error("A launch is already in progress")]
    LaunchInProgress,

    /// Cancel was requested with nothing running
    #[error("No launch is in progress")]
    NoActiveLaunch,

    /// Internal server error (catch-all for unexpected errors)
    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::InvalidPlan(_) => StatusCode::BAD_REQUEST,
            AppError::NoPlanConfigured => StatusCode::BAD_REQUEST,
            AppError::LaunchInProgress => StatusCode::CONFLICT,
            AppError::NoActiveLaunch => StatusCode::CONFLICT,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({
            "error": self.to_string(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
