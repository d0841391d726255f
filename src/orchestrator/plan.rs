//! Launch plan types and validation
//!
//! A plan is an ordered list of stages forming a DAG over prerequisite names.
//! Plans are immutable once built; validation yields a topological order.

use crate::launcher::Launcher;
use crate::process::config::duration_ms;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Errors raised before any launcher is touched
#[derive(Error, Debug)]
pub enum PlanError {
    /// Two stages share a name
    #[error("Duplicate stage name: {0}")]
    DuplicateStage(String),

    /// A prerequisite names no stage in the plan
    #[error("Stage '{stage}' requires undefined stage '{prerequisite}'")]
    UndefinedPrerequisite {
        /// Stage declaring the prerequisite
        stage: String,
        /// The unknown name
        prerequisite: String,
    },

    /// The dependency graph has a cycle
    #[error("Dependency cycle among stages: {}", stages.join(", "))]
    Cycle {
        /// Stages left unordered once no more progress was possible
        stages: Vec<String>,
    },

    /// A stage is misconfigured
    #[error("Invalid stage '{stage}': {reason}")]
    InvalidStage {
        /// Stage name
        stage: String,
        /// What is wrong
        reason: String,
    },

    /// Plan file could not be read
    #[error("Failed to read plan file {path}: {source}")]
    Io {
        /// File path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Plan file is not valid JSON for a plan
    #[error("Failed to parse plan: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Delay policy between failed attempts of a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry
    Fixed {
        /// Delay between attempts
        #[serde(rename = "delay_ms", with = "duration_ms")]
        delay: Duration,
    },
    /// Delay multiplied after each failure, capped at `max`
    Exponential {
        /// Delay before the first retry
        #[serde(rename = "initial_ms", with = "duration_ms")]
        initial: Duration,
        /// Growth factor
        multiplier: f64,
        /// Upper bound
        #[serde(rename = "max_ms", with = "duration_ms")]
        max: Duration,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::Exponential {
            initial: Duration::from_secs(1),
            multiplier: 2.0,
            max: Duration::from_secs(10),
        }
    }
}

impl Backoff {
    /// Delay after the `failures`-th failed attempt (1-based)
    pub fn delay_for(&self, failures: u32) -> Duration {
        match self {
            Backoff::Fixed { delay } => *delay,
            Backoff::Exponential {
                initial,
                multiplier,
                max,
            } => {
                let exponent = failures.saturating_sub(1).min(32) as i32;
                let secs = initial.as_secs_f64() * multiplier.max(1.0).powi(exponent);
                if !secs.is_finite() || secs >= max.as_secs_f64() {
                    *max
                } else {
                    Duration::from_secs_f64(secs)
                }
            }
        }
    }
}

/// One unit of work: bring a runtime to readiness after its prerequisites
#[derive(Clone)]
pub struct Stage {
    /// Unique name within the plan
    pub name: String,
    /// Launcher owned by this stage
    pub launcher: Arc<dyn Launcher>,
    /// Names of stages that must reach a terminal status first
    pub requires: Vec<String>,
    /// Per-attempt readiness timeout
    pub timeout: Duration,
    /// Delay between readiness probes
    pub poll_interval: Duration,
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay policy between attempts
    pub backoff: Backoff,
    /// Whether failure blocks dependents
    pub required: bool,
}

impl Stage {
    /// Default per-attempt timeout
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
    /// Default poll interval
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(500);
    /// Default retry count
    pub const DEFAULT_MAX_RETRIES: u32 = 1;

    /// Required stage with default timing and no prerequisites
    pub fn new(name: impl Into<String>, launcher: Arc<dyn Launcher>) -> Self {
        Self {
            name: name.into(),
            launcher,
            requires: Vec::new(),
            timeout: Self::DEFAULT_TIMEOUT,
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            backoff: Backoff::default(),
            required: true,
        }
    }

    /// Add prerequisites
    pub fn requires<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.requires.extend(names.into_iter().map(Into::into));
        self
    }

    /// Set the per-attempt timeout
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the poll interval
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the retry count
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Set the backoff policy
    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Mark as required or best-effort
    pub fn required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    /// Total attempts allowed
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("runtime", &self.launcher.kind())
            .field("endpoint", &self.launcher.endpoint().base_url())
            .field("requires", &self.requires)
            .field("timeout", &self.timeout)
            .field("poll_interval", &self.poll_interval)
            .field("max_retries", &self.max_retries)
            .field("backoff", &self.backoff)
            .field("required", &self.required)
            .finish()
    }
}

/// Ordered set of stages
#[derive(Debug, Clone, Default)]
pub struct LaunchPlan {
    stages: Vec<Stage>,
}

impl LaunchPlan {
    /// Build a plan; call [`LaunchPlan::validate`] (or `Orchestrator::run`) to check it
    pub fn new(stages: Vec<Stage>) -> Self {
        Self { stages }
    }

    /// Stages in declaration order
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Number of stages
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Whether the plan has no stages
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Index of the stage named `name`
    pub fn position(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// Deduplicated prerequisite indices of each stage
    ///
    /// Only meaningful for a plan whose names all resolve.
    pub(crate) fn prerequisite_indices(&self) -> Vec<Vec<usize>> {
        let index: HashMap<&str, usize> = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();
        self.stages
            .iter()
            .map(|stage| {
                let mut seen = HashSet::new();
                stage
                    .requires
                    .iter()
                    .filter_map(|name| index.get(name.as_str()).copied())
                    .filter(|i| seen.insert(*i))
                    .collect()
            })
            .collect()
    }

    /// Check names, prerequisites, timing, and acyclicity
    ///
    /// Returns stage indices in a topological order (prerequisites first,
    /// ties broken by declaration order).
    ///
    /// # Errors
    /// The first structural problem found, as a [`PlanError`].
    pub fn validate(&self) -> Result<Vec<usize>, PlanError> {
        let mut names = HashSet::new();
        for stage in &self.stages {
            if stage.name.trim().is_empty() {
                return Err(PlanError::InvalidStage {
                    stage: stage.name.clone(),
                    reason: "name must not be empty".to_string(),
                });
            }
            if !names.insert(stage.name.as_str()) {
                return Err(PlanError::DuplicateStage(stage.name.clone()));
            }
            if stage.timeout.is_zero() {
                return Err(PlanError::InvalidStage {
                    stage: stage.name.clone(),
                    reason: "timeout must be greater than zero".to_string(),
                });
            }
            if stage.poll_interval.is_zero() {
                return Err(PlanError::InvalidStage {
                    stage: stage.name.clone(),
                    reason: "poll interval must be greater than zero".to_string(),
                });
            }
        }

        for stage in &self.stages {
            if let Some(missing) = stage.requires.iter().find(|r| !names.contains(r.as_str())) {
                return Err(PlanError::UndefinedPrerequisite {
                    stage: stage.name.clone(),
                    prerequisite: missing.clone(),
                });
            }
        }

        // Kahn's algorithm
        let prerequisites = self.prerequisite_indices();
        let mut dependents = vec![Vec::new(); self.stages.len()];
        let mut unresolved: Vec<usize> = prerequisites.iter().map(Vec::len).collect();
        for (stage, prereqs) in prerequisites.iter().enumerate() {
            for &p in prereqs {
                dependents[p].push(stage);
            }
        }

        let mut ready: VecDeque<usize> = (0..self.stages.len())
            .filter(|&i| unresolved[i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.stages.len());
        while let Some(i) = ready.pop_front() {
            order.push(i);
            for &d in &dependents[i] {
                unresolved[d] -= 1;
                if unresolved[d] == 0 {
                    ready.push_back(d);
                }
            }
        }

        if order.len() < self.stages.len() {
            let stages = (0..self.stages.len())
                .filter(|&i| unresolved[i] > 0)
                .map(|i| self.stages[i].name.clone())
                .collect();
            return Err(PlanError::Cycle { stages });
        }
        Ok(order)
    }
}
