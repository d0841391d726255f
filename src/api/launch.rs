//! Launch control API handlers
//!
//! Start, observe, cancel, and tear down launch runs. Runs execute on their own
//! task so a dropped client connection never leaves a run half-recorded.

use crate::api::handlers::MessageResponse;
use crate::config::Config;
use crate::error::AppError;
use crate::orchestrator::{
    LaunchPlan, LaunchReport, Orchestrator, PlanConfig, PlanError, StageProgress,
    TeardownReport,
};
use crate::state::SharedState;
use axum::{body::Bytes, extract::State, response::Json};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Launch status response
#[derive(Debug, Serialize, Deserialize)]
pub struct LaunchStatusResponse {
    /// Whether a run is in flight
    pub running: bool,
    /// Per-stage statuses of the current or most recent run
    pub progress: Vec<StageProgress>,
    /// Report of the most recent completed run
    pub last_report: Option<LaunchReport>,
}

/// Build a plan from a request body, or from the configured plan file when
/// the body is empty
pub fn resolve_plan(config: &Config, body: &[u8]) -> Result<LaunchPlan, AppError> {
    let plan_config = if body.iter().all(u8::is_ascii_whitespace) {
        let path = config
            .launch
            .plan_path
            .as_ref()
            .ok_or(AppError::NoPlanConfigured)?;
        PlanConfig::load(path)?
    } else {
        serde_json::from_slice::<PlanConfig>(body).map_err(PlanError::from)?
    };
    Ok(plan_config.into_plan(&config.launch_defaults())?)
}

/// Validate `plan`, mark it active, and run it on a background task
///
/// The plan it replaces is torn down first so its runtimes are not mistaken
/// for externally started ones.
///
/// # Errors
/// `AppError::InvalidPlan` before anything is touched, or
/// `AppError::LaunchInProgress` while another run is in flight.
pub async fn start_launch(
    state: &SharedState,
    plan: LaunchPlan,
) -> Result<JoinHandle<Result<LaunchReport, PlanError>>, AppError> {
    Orchestrator::validate(&plan)?;

    let (launch, previous, orchestrator) = {
        let mut guard = state.write().await;
        let (launch, previous) = guard.begin(plan)?;
        (launch, previous, guard.orchestrator.clone())
    };

    let task_state = state.clone();
    Ok(tokio::spawn(async move {
        if let Some(previous) = previous {
            info!(stages = previous.len(), "Tearing down previous plan before relaunch");
            let teardown = orchestrator.teardown(&previous).await;
            if !teardown.is_clean() {
                warn!(failures = teardown.failures.len(), "Previous plan did not stop cleanly");
            }
        }
        let result = orchestrator.run(&launch.plan, &launch.cancel).await;
        task_state.write().await.finish();
        result
    }))
}

/// POST /api/launch - Run a plan (request body or configured plan file)
pub async fn launch(
    State(state): State<SharedState>,
    body: Bytes,
) -> Result<Json<LaunchReport>, AppError> {
    let plan = {
        let guard = state.read().await;
        if guard.is_running() {
            return Err(AppError::LaunchInProgress);
        }
        resolve_plan(&guard.config, &body)?
    };

    let handle = start_launch(&state, plan).await?;
    let report = handle
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Launch task failed: {}", e)))??;
    Ok(Json(report))
}

/// GET /api/launch/status - Live progress and the last report
pub async fn launch_status(State(state): State<SharedState>) -> Json<LaunchStatusResponse> {
    let (running, orchestrator) = {
        let guard = state.read().await;
        (guard.is_running(), guard.orchestrator.clone())
    };
    Json(LaunchStatusResponse {
        running,
        progress: orchestrator.progress().await,
        last_report: orchestrator.status().await,
    })
}

/// POST /api/launch/cancel - Cancel the running launch
pub async fn cancel_launch(
    State(state): State<SharedState>,
) -> Result<Json<MessageResponse>, AppError> {
    state.read().await.cancel_active()?;
    info!("Launch cancellation requested");
    Ok(Json(MessageResponse {
        message: "Launch cancellation requested".to_string(),
        status: "cancelling".to_string(),
    }))
}

/// POST /api/launch/teardown - Stop every runtime the active plan spawned
pub async fn teardown(State(state): State<SharedState>) -> Result<Json<TeardownReport>, AppError> {
    let (plan, orchestrator) = {
        let guard = state.read().await;
        if guard.is_running() {
            return Err(AppError::LaunchInProgress);
        }
        (
            guard.active().map(|a| a.plan.clone()),
            guard.orchestrator.clone(),
        )
    };

    let report = match plan {
        Some(plan) => orchestrator.teardown(&plan).await,
        None => TeardownReport::default(),
    };
    Ok(Json(report))
}

/// Cancel the running launch, wait up to `wait` for it to settle, then tear
/// down the active plan
///
/// Used when the server exits. The teardown happens even if the run did not
/// settle in time.
pub async fn stop_all(state: &SharedState, wait: Duration) -> TeardownReport {
    let mut running = {
        let guard = state.read().await;
        if guard.cancel_active().is_ok() {
            info!("Cancelled running launch");
        }
        guard.watch_running()
    };

    let settled = tokio::time::timeout(wait, running.wait_for(|running| !*running))
        .await
        .is_ok();
    if !settled {
        warn!(
            wait_ms = wait.as_millis() as u64,
            "Launch did not stop after cancellation, tearing down anyway"
        );
    }

    let (plan, orchestrator) = {
        let guard = state.read().await;
        (
            guard.active().map(|a| a.plan.clone()),
            guard.orchestrator.clone(),
        )
    };
    match plan {
        Some(plan) => orchestrator.teardown(&plan).await,
        None => TeardownReport::default(),
    }
}
