// Application state shared by the HTTP handlers
// Holds the orchestrator, the active plan, and whether a run is in flight

use crate::cancel::CancellationToken;
use crate::config::Config;
use crate::error::AppError;
use crate::orchestrator::{LaunchPlan, Orchestrator};
use std::sync::Arc;
use tokio::sync::{watch, RwLock};

/// State handle passed to axum handlers
pub type SharedState = Arc<RwLock<AppState>>;

/// The plan most recently started through this process
#[derive(Debug, Clone)]
pub struct ActiveLaunch {
    /// Plan whose launchers own the spawned runtimes
    pub plan: Arc<LaunchPlan>,
    /// Token raised by `POST /api/launch/cancel`
    pub cancel: CancellationToken,
    /// Whether `Orchestrator::run` is still executing
    pub running: bool,
}

/// Application state
#[derive(Debug)]
pub struct AppState {
    /// Loaded configuration
    pub config: Config,
    /// Shared orchestrator (keeps the last report and live progress)
    pub orchestrator: Arc<Orchestrator>,
    active: Option<ActiveLaunch>,
    running_tx: watch::Sender<bool>,
}

impl AppState {
    /// Create state with no active launch
    pub fn new(config: Config) -> Self {
        Self {
            config,
            orchestrator: Arc::new(Orchestrator::new()),
            active: None,
            running_tx: watch::channel(false).0,
        }
    }

    /// Wrap in the shared handle used by the router
    pub fn shared(self) -> SharedState {
        Arc::new(RwLock::new(self))
    }

    /// Whether a run is in flight
    pub fn is_running(&self) -> bool {
        self.active.as_ref().is_some_and(|a| a.running)
    }

    /// Follow `is_running` as it changes
    pub fn watch_running(&self) -> watch::Receiver<bool> {
        self.running_tx.subscribe()
    }

    /// The active launch, if any
    pub fn active(&self) -> Option<&ActiveLaunch> {
        self.active.as_ref()
    }

    /// Mark `plan` as the active, running launch
    ///
    /// Returns the new launch and the plan it replaces, which the caller
    /// should tear down before running.
    ///
    /// # Errors
    /// `AppError::LaunchInProgress` if a run is already in flight.
    pub fn begin(
        &mut self,
        plan: LaunchPlan,
    ) -> Result<(ActiveLaunch, Option<Arc<LaunchPlan>>), AppError> {
        if self.is_running() {
            return Err(AppError::LaunchInProgress);
        }
        let launch = ActiveLaunch {
            plan: Arc::new(plan),
            cancel: CancellationToken::new(),
            running: true,
        };
        let previous = self.active.replace(launch.clone()).map(|a| a.plan);
        self.running_tx.send_replace(true);
        Ok((launch, previous))
    }

    /// Mark the active run as finished
    pub fn finish(&mut self) {
        if let Some(active) = self.active.as_mut() {
            active.running = false;
        }
        self.running_tx.send_replace(false);
    }

    /// Raise the cancellation token of the running launch
    ///
    /// # Errors
    /// `AppError::NoActiveLaunch` when nothing is running.
    pub fn cancel_active(&self) -> Result<(), AppError> {
        match self.active.as_ref() {
            Some(active) if active.running => {
                active.cancel.cancel();
                Ok(())
            }
            _ => Err(AppError::NoActiveLaunch),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_rejects_concurrent_launch() {
        let mut state = AppState::new(Config::from_env());
        let running = state.watch_running();
        assert!(!state.is_running());

        let (first, previous) = state.begin(LaunchPlan::default()).unwrap();
        assert!(previous.is_none());
        assert!(state.is_running());
        assert!(*running.borrow());
        assert!(matches!(
            state.begin(LaunchPlan::default()),
            Err(AppError::LaunchInProgress)
        ));

        state.cancel_active().unwrap();
        assert!(first.cancel.is_cancelled());

        state.finish();
        assert!(!state.is_running());
        assert!(!*running.borrow());
        assert!(matches!(state.cancel_active(), Err(AppError::NoActiveLaunch)));

        let (_, previous) = state.begin(LaunchPlan::default()).unwrap();
        assert!(Arc::ptr_eq(&previous.unwrap(), &first.plan));
    }
}
