//! Plan executor
//!
//! A single coordinator loop owns the dependency counts and stage statuses.
//! Each eligible stage runs as a tokio task in a `JoinSet`; completions are
//! processed one at a time by the coordinator, which then releases or skips
//! dependents.

use crate::cancel::CancellationToken;
use crate::launcher::{EndpointInfo, LaunchError, Launcher, ReadyOutcome};
use crate::orchestrator::plan::{Backoff, LaunchPlan, PlanError};
use crate::orchestrator::report::{
    LaunchReport, Outcome, StageProgress, StageResult, StageStatus, TeardownFailure,
    TeardownReport,
};
use chrono::{DateTime, Utc};
use futures_util::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Added to `timeout + poll_interval` to bound a launcher that ignores its own timeout
const GUARD_SLACK: Duration = Duration::from_secs(5);

/// Runs launch plans and keeps the last report
#[derive(Debug, Default)]
pub struct Orchestrator {
    last_report: RwLock<Option<LaunchReport>>,
    progress: RwLock<Vec<StageProgress>>,
}

impl Orchestrator {
    /// Create an orchestrator with no history
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a plan without touching any launcher
    ///
    /// Returns stage indices in topological order.
    pub fn validate(plan: &LaunchPlan) -> Result<Vec<usize>, PlanError> {
        plan.validate()
    }

    /// Report of the most recent completed run
    pub async fn status(&self) -> Option<LaunchReport> {
        self.last_report.read().await.clone()
    }

    /// Per-stage statuses of the current (or most recent) run
    pub async fn progress(&self) -> Vec<StageProgress> {
        self.progress.read().await.clone()
    }

    /// Execute a plan to completion or cancellation
    ///
    /// Stage failures are recorded in the report; only an invalid plan is
    /// returned as an error, and in that case no launcher has been called.
    pub async fn run(
        &self,
        plan: &LaunchPlan,
        cancel: &CancellationToken,
    ) -> Result<LaunchReport, PlanError> {
        if let Err(e) = Self::validate(plan) {
            warn!(error = %e, "Rejected launch plan");
            return Err(e);
        }

        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let start = Instant::now();
        info!(run_id = %run_id, stages = plan.len(), "Starting launch run");

        let mut coordinator = Coordinator::new(plan, cancel);
        self.publish(&coordinator).await;
        for index in 0..plan.len() {
            if coordinator.unresolved[index] == 0 {
                coordinator.dispatch(index);
            }
        }
        self.publish(&coordinator).await;

        let mut cancel_seen = false;
        while !coordinator.tasks.is_empty() {
            tokio::select! {
                joined = coordinator.tasks.join_next() => match joined {
                    Some(Ok(completion)) => {
                        coordinator.complete(completion);
                        self.publish(&coordinator).await;
                    }
                    Some(Err(e)) => error!(run_id = %run_id, error = %e, "Stage task did not complete"),
                    None => break,
                },
                _ = cancel.cancelled(), if !cancel_seen => {
                    cancel_seen = true;
                    warn!(run_id = %run_id, "Launch cancelled, waiting for in-flight stages to stop");
                }
            }
        }

        let cancelled = cancel_seen || cancel.is_cancelled();
        coordinator.resolve_leftovers();
        self.publish(&coordinator).await;

        let stages: Vec<StageResult> = coordinator.results.into_iter().flatten().collect();
        let outcome = Outcome::of_run(cancelled, &stages);

        let report = LaunchReport {
            run_id,
            started_at,
            stages,
            outcome,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            run_id = %run_id,
            outcome = ?report.outcome,
            duration_ms = report.duration_ms,
            "Launch run finished"
        );

        *self.last_report.write().await = Some(report.clone());
        Ok(report)
    }

    /// Shut down every stage's launcher, dependents first
    ///
    /// Best-effort: a failure is recorded and the remaining stages are still
    /// visited. An invalid plan is torn down in reverse declaration order.
    pub async fn teardown(&self, plan: &LaunchPlan) -> TeardownReport {
        let order: Vec<usize> = match plan.validate() {
            Ok(order) => order.into_iter().rev().collect(),
            Err(e) => {
                warn!(error = %e, "Tearing down invalid plan in reverse declaration order");
                (0..plan.len()).rev().collect()
            }
        };

        let mut report = TeardownReport::default();
        for index in order {
            let stage = &plan.stages()[index];
            match stage.launcher.shutdown().await {
                Ok(()) => {
                    debug!(stage = %stage.name, "Stage shut down");
                    report.stopped.push(stage.name.clone());
                }
                Err(error) => {
                    warn!(stage = %stage.name, error = %error, "Failed to shut down stage");
                    report.failures.push(TeardownFailure {
                        stage: stage.name.clone(),
                        error,
                    });
                }
            }
        }
        info!(
            stopped = report.stopped.len(),
            failures = report.failures.len(),
            "Teardown complete"
        );
        report
    }

    async fn publish(&self, coordinator: &Coordinator<'_>) {
        *self.progress.write().await = coordinator.snapshot();
    }
}

/// Everything a stage task needs, detached from the plan
struct StageJob {
    index: usize,
    name: String,
    launcher: Arc<dyn Launcher>,
    timeout: Duration,
    poll_interval: Duration,
    max_attempts: u32,
    backoff: Backoff,
}

/// Message from a finished stage task to the coordinator
struct StageCompletion {
    index: usize,
    attempts: u32,
    started_at: DateTime<Utc>,
    finished_at: DateTime<Utc>,
    elapsed: Duration,
    result: Result<EndpointInfo, LaunchError>,
}

/// Single writer of the dependency table for one run
struct Coordinator<'a> {
    plan: &'a LaunchPlan,
    cancel: &'a CancellationToken,
    dependents: Vec<Vec<usize>>,
    unresolved: Vec<usize>,
    statuses: Vec<StageStatus>,
    results: Vec<Option<StageResult>>,
    tasks: JoinSet<StageCompletion>,
}

impl<'a> Coordinator<'a> {
    fn new(plan: &'a LaunchPlan, cancel: &'a CancellationToken) -> Self {
        let prerequisites = plan.prerequisite_indices();
        let mut dependents = vec![Vec::new(); plan.len()];
        for (stage, prereqs) in prerequisites.iter().enumerate() {
            for &p in prereqs {
                dependents[p].push(stage);
            }
        }
        let unresolved: Vec<usize> = prerequisites.iter().map(Vec::len).collect();
        let statuses = unresolved
            .iter()
            .map(|&count| {
                if count == 0 {
                    StageStatus::Pending
                } else {
                    StageStatus::WaitingOnDependency
                }
            })
            .collect();

        Self {
            plan,
            cancel,
            dependents,
            unresolved,
            statuses,
            results: vec![None; plan.len()],
            tasks: JoinSet::new(),
        }
    }

    fn snapshot(&self) -> Vec<StageProgress> {
        self.plan
            .stages()
            .iter()
            .zip(&self.statuses)
            .map(|(stage, status)| StageProgress {
                name: stage.name.clone(),
                status: *status,
            })
            .collect()
    }

    /// Start a stage whose prerequisites are all terminal
    ///
    /// Nothing new is scheduled once the run is cancelled.
    fn dispatch(&mut self, index: usize) {
        if self.cancel.is_cancelled() {
            return;
        }
        let plan = self.plan;
        let stage = &plan.stages()[index];
        debug!(stage = %stage.name, "Dispatching stage");
        self.statuses[index] = StageStatus::Running;

        let job = StageJob {
            index,
            name: stage.name.clone(),
            launcher: Arc::clone(&stage.launcher),
            timeout: stage.timeout,
            poll_interval: stage.poll_interval,
            max_attempts: stage.max_attempts(),
            backoff: stage.backoff.clone(),
        };
        self.tasks.spawn(run_stage(job, self.cancel.clone()));
    }

    fn complete(&mut self, completion: StageCompletion) {
        let plan = self.plan;
        let stage = &plan.stages()[completion.index];
        let (status, error, endpoint) = match completion.result {
            Ok(endpoint) => {
                info!(
                    stage = %stage.name,
                    attempts = completion.attempts,
                    elapsed_ms = completion.elapsed.as_millis() as u64,
                    url = %endpoint.url,
                    "Stage succeeded"
                );
                (StageStatus::Succeeded, None, Some(endpoint))
            }
            Err(error) => {
                error!(
                    stage = %stage.name,
                    attempts = completion.attempts,
                    required = stage.required,
                    error = %error,
                    "Stage failed"
                );
                (StageStatus::Failed, Some(error), None)
            }
        };

        self.statuses[completion.index] = status;
        self.results[completion.index] = Some(StageResult {
            name: stage.name.clone(),
            required: stage.required,
            status,
            attempts: completion.attempts,
            elapsed_ms: completion.elapsed.as_millis() as u64,
            started_at: Some(completion.started_at),
            finished_at: completion.finished_at,
            error,
            skip_reason: None,
            endpoint,
        });
        self.release_dependents(completion.index);
    }

    /// Propagate a terminal stage to its dependents
    ///
    /// A failed required stage (or a skipped one) skips every dependent that
    /// is not yet terminal, transitively. Anything else counts as resolved.
    /// After cancellation dependents are left for `resolve_leftovers`.
    fn release_dependents(&mut self, index: usize) {
        if self.cancel.is_cancelled() {
            return;
        }
        let plan = self.plan;
        let mut worklist = vec![index];
        while let Some(done) = worklist.pop() {
            let done_stage = &plan.stages()[done];
            let skip_reason = match self.statuses[done] {
                StageStatus::Failed if done_stage.required => Some(format!(
                    "required prerequisite '{}' failed",
                    done_stage.name
                )),
                StageStatus::Skipped => {
                    Some(format!("prerequisite '{}' was skipped", done_stage.name))
                }
                _ => None,
            };

            for dependent in self.dependents[done].clone() {
                if self.statuses[dependent].is_terminal() {
                    continue;
                }
                match &skip_reason {
                    Some(reason) => {
                        self.skip(dependent, reason.clone());
                        worklist.push(dependent);
                    }
                    None => {
                        self.unresolved[dependent] -= 1;
                        if self.unresolved[dependent] == 0 {
                            self.dispatch(dependent);
                        }
                    }
                }
            }
        }
    }

    fn skip(&mut self, index: usize, reason: String) {
        let plan = self.plan;
        let stage = &plan.stages()[index];
        info!(stage = %stage.name, reason = %reason, "Skipping stage");
        self.statuses[index] = StageStatus::Skipped;
        self.results[index] = Some(StageResult {
            name: stage.name.clone(),
            required: stage.required,
            status: StageStatus::Skipped,
            attempts: 0,
            elapsed_ms: 0,
            started_at: None,
            finished_at: Utc::now(),
            error: None,
            skip_reason: Some(reason),
            endpoint: None,
        });
    }

    /// Give every stage that never resolved a terminal `Failed` result
    fn resolve_leftovers(&mut self) {
        let error = if self.cancel.is_cancelled() {
            LaunchError::Cancelled
        } else {
            LaunchError::Spawn {
                message: "stage task ended without a result".to_string(),
            }
        };
        let plan = self.plan;
        for index in 0..plan.len() {
            if self.results[index].is_some() {
                continue;
            }
            let stage = &plan.stages()[index];
            debug!(stage = %stage.name, error = %error, "Stage never resolved");
            self.statuses[index] = StageStatus::Failed;
            self.results[index] = Some(StageResult {
                name: stage.name.clone(),
                required: stage.required,
                status: StageStatus::Failed,
                attempts: 0,
                elapsed_ms: 0,
                started_at: None,
                finished_at: Utc::now(),
                error: Some(error.clone()),
                skip_reason: None,
                endpoint: None,
            });
        }
    }
}

/// Attempt a stage until ready, out of attempts, or cancelled
async fn run_stage(job: StageJob, cancel: CancellationToken) -> StageCompletion {
    let started_at = Utc::now();
    let start = Instant::now();
    let mut attempts = 0u32;

    let result = loop {
        if cancel.is_cancelled() {
            break Err(LaunchError::Cancelled);
        }
        attempts += 1;
        info!(
            stage = %job.name,
            attempt = attempts,
            max_attempts = job.max_attempts,
            runtime = job.launcher.kind().display_name(),
            "Starting stage attempt"
        );

        let error = match attempt(&job, &cancel).await {
            Ok(endpoint) => break Ok(endpoint),
            Err(error) => error,
        };
        if !error.is_retryable() || attempts >= job.max_attempts {
            break Err(error);
        }

        let delay = job.backoff.delay_for(attempts);
        warn!(
            stage = %job.name,
            attempt = attempts,
            error = %error,
            delay_ms = delay.as_millis() as u64,
            "Stage attempt failed, retrying"
        );
        tokio::select! {
            _ = cancel.cancelled() => break Err(LaunchError::Cancelled),
            _ = tokio::time::sleep(delay) => {}
        }
    };

    StageCompletion {
        index: job.index,
        attempts,
        started_at,
        finished_at: Utc::now(),
        elapsed: start.elapsed(),
        result,
    }
}

/// One bounded `ensure_ready` call
///
/// The call is abandoned when cancellation is raised or the guard expires;
/// either way the launcher is shut down so nothing it started is left behind.
async fn attempt(job: &StageJob, cancel: &CancellationToken) -> Result<EndpointInfo, LaunchError> {
    let guard = job.timeout + job.poll_interval + GUARD_SLACK;
    let ready = AssertUnwindSafe(job.launcher.ensure_ready(job.timeout, job.poll_interval, cancel))
        .catch_unwind();

    let outcome = tokio::select! {
        outcome = tokio::time::timeout(guard, ready) => outcome,
        _ = cancel.cancelled() => {
            info!(stage = %job.name, "Cancelled during attempt, shutting launcher down");
            release(job).await;
            return Err(LaunchError::Cancelled);
        }
    };

    match outcome {
        Ok(Ok(ReadyOutcome::Ready(endpoint))) => Ok(endpoint),
        Ok(Ok(ReadyOutcome::Failed { error, .. })) => Err(error),
        Ok(Err(_)) => {
            error!(stage = %job.name, "Launcher panicked during ensure_ready");
            Err(LaunchError::Spawn {
                message: "launcher panicked".to_string(),
            })
        }
        Err(_) => {
            warn!(
                stage = %job.name,
                guard_ms = guard.as_millis() as u64,
                "Launcher overran its deadline, shutting it down"
            );
            release(job).await;
            Err(LaunchError::Timeout {
                after_ms: job.timeout.as_millis() as u64,
            })
        }
    }
}

/// Shut down a launcher whose attempt was abandoned
async fn release(job: &StageJob) {
    if let Err(e) = job.launcher.shutdown().await {
        warn!(stage = %job.name, error = %e, "Failed to shut down abandoned launcher");
    }
}
