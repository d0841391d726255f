//! Shared helpers for integration tests
//!
//! `ScriptedLauncher` plays back a fixed behavior and records every call in
//! a shared event log so tests can check ordering across stages.

#![allow(dead_code)]

use async_trait::async_trait;
use router_launcher::cancel::CancellationToken;
use router_launcher::launcher::{
    Detection, DetectOutcome, Endpoint, EndpointInfo, LaunchError, Launcher, ReadyOutcome,
    RuntimeKind,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// What a scripted launcher does on `ensure_ready`
#[derive(Debug, Clone)]
pub enum Script {
    /// Become ready after `delay`
    Succeed(Duration),
    /// Fail with `error` after `delay`
    Fail(LaunchError, Duration),
    /// Fail with a timeout `failures` times, then succeed
    FailThenSucceed(u32),
    /// Stay not-ready until cancelled
    WaitForCancel,
    /// Ignore the timeout and the cancellation token
    Hang,
}

/// Kind of recorded event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Started,
    Finished,
    Shutdown,
}

/// One recorded call
#[derive(Debug, Clone)]
pub struct Event {
    pub stage: String,
    pub kind: EventKind,
    pub at: Instant,
}

/// Event log shared by every launcher in a test
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<Event>>,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, stage: &str, kind: EventKind) {
        self.events.lock().unwrap().push(Event {
            stage: stage.to_string(),
            kind,
            at: Instant::now(),
        });
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    /// Time of the first `kind` event for `stage`
    pub fn first(&self, stage: &str, kind: EventKind) -> Option<Instant> {
        self.events()
            .into_iter()
            .find(|e| e.stage == stage && e.kind == kind)
            .map(|e| e.at)
    }

    /// Stages in the order their `kind` events were recorded
    pub fn order_of(&self, kind: EventKind) -> Vec<String> {
        self.events()
            .into_iter()
            .filter(|e| e.kind == kind)
            .map(|e| e.stage)
            .collect()
    }
}

/// Launcher that plays back a [`Script`]
pub struct ScriptedLauncher {
    name: String,
    endpoint: Endpoint,
    script: Script,
    log: Arc<EventLog>,
    calls: AtomicU32,
    shutdowns: AtomicU32,
    fail_shutdown: bool,
}

impl ScriptedLauncher {
    pub fn new(name: &str, script: Script, log: &Arc<EventLog>) -> Arc<Self> {
        Self::build(name, script, log, false)
    }

    /// A launcher whose `shutdown` always fails
    pub fn failing_shutdown(name: &str, log: &Arc<EventLog>) -> Arc<Self> {
        Self::build(name, Script::Succeed(Duration::ZERO), log, true)
    }

    fn build(name: &str, script: Script, log: &Arc<EventLog>, fail_shutdown: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            endpoint: Endpoint::new("127.0.0.1", 1),
            script,
            log: Arc::clone(log),
            calls: AtomicU32::new(0),
            shutdowns: AtomicU32::new(0),
            fail_shutdown,
        })
    }

    /// Number of `ensure_ready` calls
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Number of `shutdown` calls
    pub fn shutdowns(&self) -> u32 {
        self.shutdowns.load(Ordering::SeqCst)
    }

    fn ready(&self) -> ReadyOutcome {
        ReadyOutcome::Ready(EndpointInfo {
            url: self.endpoint.base_url(),
            detection: Detection::Spawned,
            pid: None,
        })
    }
}

#[async_trait]
impl Launcher for ScriptedLauncher {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Ollama
    }

    fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    async fn detect(&self) -> DetectOutcome {
        DetectOutcome::NotRunning
    }

    async fn ensure_ready(
        &self,
        timeout: Duration,
        _poll_interval: Duration,
        cancel: &CancellationToken,
    ) -> ReadyOutcome {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let start = Instant::now();
        self.log.record(&self.name, EventKind::Started);

        let outcome = match &self.script {
            Script::Succeed(delay) => {
                tokio::time::sleep(*delay).await;
                self.ready()
            }
            Script::Fail(error, delay) => {
                tokio::time::sleep(*delay).await;
                ReadyOutcome::failed(error.clone(), start.elapsed())
            }
            Script::FailThenSucceed(failures) => {
                if call <= *failures {
                    ReadyOutcome::failed(
                        LaunchError::Timeout {
                            after_ms: timeout.as_millis() as u64,
                        },
                        start.elapsed(),
                    )
                } else {
                    self.ready()
                }
            }
            Script::WaitForCancel => {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        ReadyOutcome::failed(LaunchError::Cancelled, start.elapsed())
                    }
                    _ = tokio::time::sleep(timeout) => ReadyOutcome::failed(
                        LaunchError::Timeout { after_ms: timeout.as_millis() as u64 },
                        start.elapsed(),
                    ),
                }
            }
            Script::Hang => std::future::pending::<ReadyOutcome>().await,
        };

        self.log.record(&self.name, EventKind::Finished);
        outcome
    }

    async fn shutdown(&self) -> Result<(), LaunchError> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        self.log.record(&self.name, EventKind::Shutdown);
        if self.fail_shutdown {
            Err(LaunchError::Shutdown {
                message: "process refused to exit".to_string(),
            })
        } else {
            Ok(())
        }
    }
}
