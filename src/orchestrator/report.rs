//! Launch results
//!
//! Per-stage results and the aggregate report handed back to callers. Reports
//! are immutable once returned and serialize to JSON for the GUI and CLI.

use crate::launcher::{EndpointInfo, LaunchError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle of a stage within one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Eligible, not yet started
    Pending,
    /// Blocked on unresolved prerequisites
    WaitingOnDependency,
    /// `ensure_ready` in progress
    Running,
    /// Runtime confirmed ready
    Succeeded,
    /// All attempts failed, or the run was cancelled first
    Failed,
    /// Not attempted because a required prerequisite failed
    Skipped,
}

impl StageStatus {
    /// Whether the stage has reached its final status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StageStatus::Succeeded | StageStatus::Failed | StageStatus::Skipped
        )
    }
}

/// Final record of one stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageResult {
    /// Stage name
    pub name: String,
    /// Whether failure blocks dependents
    pub required: bool,
    /// Terminal status
    pub status: StageStatus,
    /// `ensure_ready` calls made
    pub attempts: u32,
    /// Wall-clock time from first attempt to resolution
    pub elapsed_ms: u64,
    /// When the first attempt began (None if never attempted)
    pub started_at: Option<DateTime<Utc>>,
    /// When the stage resolved
    pub finished_at: DateTime<Utc>,
    /// Present iff `status` is `Failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<LaunchError>,
    /// Present iff `status` is `Skipped`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<String>,
    /// Where the ready runtime lives (only when `Succeeded`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<EndpointInfo>,
}

/// Overall result of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Every required stage succeeded
    AllSucceeded,
    /// The run completed but a required stage failed or was skipped
    PartialFailure,
    /// Cancelled before completion
    Aborted,
}

impl Outcome {
    /// Classify a finished run
    ///
    /// `cancelled` is whether cancellation was raised before the run
    /// finished; it wins over whatever the in-flight stages ended with.
    pub fn of_run(cancelled: bool, stages: &[StageResult]) -> Self {
        if cancelled
            || stages
                .iter()
                .any(|s| s.error == Some(LaunchError::Cancelled))
        {
            Outcome::Aborted
        } else if stages
            .iter()
            .filter(|s| s.required)
            .all(|s| s.status == StageStatus::Succeeded)
        {
            Outcome::AllSucceeded
        } else {
            Outcome::PartialFailure
        }
    }
}

/// Aggregate report of one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchReport {
    /// Unique run id
    pub run_id: Uuid,
    /// When the run started
    pub started_at: DateTime<Utc>,
    /// Stage results in plan declaration order
    pub stages: Vec<StageResult>,
    /// Overall outcome
    pub outcome: Outcome,
    /// Total wall-clock duration
    pub duration_ms: u64,
}

impl LaunchReport {
    /// Result for the stage named `name`
    pub fn stage(&self, name: &str) -> Option<&StageResult> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Whether every required stage succeeded
    pub fn is_success(&self) -> bool {
        self.outcome == Outcome::AllSucceeded
    }

    /// Stages that ended `Failed`
    pub fn failed(&self) -> impl Iterator<Item = &StageResult> {
        self.stages
            .iter()
            .filter(|s| s.status == StageStatus::Failed)
    }
}

/// Live status of one stage while a run is in flight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageProgress {
    /// Stage name
    pub name: String,
    /// Current status
    pub status: StageStatus,
}

/// A stage whose launcher failed to shut down
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownFailure {
    /// Stage name
    pub stage: String,
    /// Why shutdown failed
    pub error: LaunchError,
}

/// Result of a best-effort teardown
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TeardownReport {
    /// Stages whose launcher shut down cleanly, in the order visited
    pub stopped: Vec<String>,
    /// Stages whose launcher reported an error
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    /// Whether every launcher shut down cleanly
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::launcher::Detection;

    fn result(name: &str, status: StageStatus) -> StageResult {
        StageResult {
            name: name.to_string(),
            required: true,
            status,
            attempts: 1,
            elapsed_ms: 12,
            started_at: Some(Utc::now()),
            finished_at: Utc::now(),
            error: None,
            skip_reason: None,
            endpoint: None,
        }
    }

    #[test]
    fn test_report_json_shape() {
        let mut ready = result("ollama", StageStatus::Succeeded);
        ready.endpoint = Some(EndpointInfo {
            url: "http://127.0.0.1:11434".to_string(),
            detection: Detection::AlreadyRunning,
            pid: None,
        });
        let mut failed = result("router", StageStatus::Failed);
        failed.error = Some(LaunchError::Timeout { after_ms: 5000 });

        let report = LaunchReport {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            stages: vec![ready, failed],
            outcome: Outcome::PartialFailure,
            duration_ms: 5012,
        };

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["outcome"], "partial_failure");
        assert_eq!(json["stages"][0]["status"], "succeeded");
        assert_eq!(json["stages"][0]["endpoint"]["detection"], "already_running");
        assert!(json["stages"][0].get("error").is_none());
        assert_eq!(json["stages"][1]["error"]["kind"], "timeout");
        assert_eq!(json["stages"][1]["error"]["after_ms"], 5000);

        assert_eq!(report.failed().count(), 1);
        assert!(!report.is_success());
        assert_eq!(report.stage("router").unwrap().attempts, 1);
    }

    #[test]
    fn test_outcome_of_run() {
        let ok = result("ollama", StageStatus::Succeeded);
        let mut optional = result("embeddings", StageStatus::Failed);
        optional.required = false;
        let mut timed_out = result("router", StageStatus::Failed);
        timed_out.error = Some(LaunchError::Timeout { after_ms: 300 });

        assert_eq!(Outcome::of_run(false, &[]), Outcome::AllSucceeded);
        assert_eq!(
            Outcome::of_run(false, &[ok.clone(), optional]),
            Outcome::AllSucceeded
        );
        assert_eq!(
            Outcome::of_run(false, &[ok.clone(), timed_out.clone()]),
            Outcome::PartialFailure
        );
        // Cancelled while the last attempt was ending in a timeout
        assert_eq!(
            Outcome::of_run(true, &[ok.clone(), timed_out]),
            Outcome::Aborted
        );
        // Cancelled even though every stage made it
        assert_eq!(Outcome::of_run(true, &[ok]), Outcome::Aborted);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::WaitingOnDependency.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
        assert!(StageStatus::Succeeded.is_terminal());
        assert!(StageStatus::Failed.is_terminal());
        assert!(StageStatus::Skipped.is_terminal());
    }
}
