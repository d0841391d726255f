//! Orchestrator module
//!
//! Validates a declarative launch plan, runs its stages in dependency order
//! with per-stage timeout and retry, and tears them down in reverse.

pub mod config;
pub mod executor;
pub mod plan;
pub mod report;

pub use config::{LaunchDefaults, PlanConfig, RuntimeConfig, StageConfig};
pub use executor::Orchestrator;
pub use plan::{Backoff, LaunchPlan, PlanError, Stage};
pub use report::{
    LaunchReport, Outcome, StageProgress, StageResult, StageStatus, TeardownFailure,
    TeardownReport,
};
