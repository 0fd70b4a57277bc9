//! Run control surface.
//!
//! [`RunController`] owns at most one active run. It starts the run on a
//! background task, forwards stop requests through the run's cancellation
//! token and publishes immutable [`RunSnapshot`]s over a `watch` channel.
//! The run task remains the only writer of the run state.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::config::PipelineConfig;
use super::events::{ObserverSet, ProgressObserver};
use super::orchestrator::{DiscoveryPipeline, RunOutcome};
use super::types::{RunState, RunStatus, PROGRESS_TOTAL};
use crate::error::ControlError;
use crate::llm::CompletionProvider;

/// Log lines retained in a snapshot.
pub const LOG_TAIL_LIMIT: usize = 500;

/// Published view of the current or most recent run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub status: RunStatus,
    pub run_id: Option<String>,
    pub problem: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub progress: f64,
    pub total: u32,
    pub message: String,
    /// Most recent log lines, oldest first.
    pub logs: VecDeque<String>,
}

impl RunSnapshot {
    pub fn idle() -> Self {
        Self {
            status: RunStatus::Idle,
            run_id: None,
            problem: None,
            started_at: None,
            progress: 0.0,
            total: PROGRESS_TOTAL,
            message: String::new(),
            logs: VecDeque::new(),
        }
    }

    fn starting(state: &RunState) -> Self {
        Self {
            status: RunStatus::Running,
            run_id: Some(state.run_id.clone()),
            problem: Some(state.problem.clone()),
            started_at: Some(state.started_at),
            ..Self::idle()
        }
    }

    fn push_log(&mut self, message: &str) {
        if self.logs.len() == LOG_TAIL_LIMIT {
            self.logs.pop_front();
        }
        self.logs.push_back(message.to_string());
    }
}

/// Answer to a status request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub connected: bool,
    pub models: Vec<String>,
    /// First model the service lists.
    pub loaded_model: Option<String>,
    pub running: bool,
    pub status: RunStatus,
    pub progress: f64,
    pub total: u32,
    pub message: String,
    pub log_count: usize,
}

/// Observer that folds notifications into the published snapshot.
struct SnapshotObserver {
    tx: Arc<watch::Sender<RunSnapshot>>,
}

impl ProgressObserver for SnapshotObserver {
    fn on_progress(&self, current: f64, total: u32, message: &str) {
        self.tx.send_modify(|s| {
            s.progress = current;
            s.total = total;
            s.message = message.to_string();
        });
    }

    fn on_log(&self, message: &str) {
        self.tx.send_modify(|s| s.push_log(message));
    }

    fn on_finished(&self, status: RunStatus) {
        self.tx.send_modify(|s| s.status = status);
    }
}

struct ActiveRun {
    cancel: CancellationToken,
    /// Taken by [`RunController::wait`].
    handle: Option<JoinHandle<Option<RunOutcome>>>,
}

/// Awaits the run task and makes sure its terminal status gets published,
/// even when the task panicked outside the pipeline's own fault capture.
async fn supervise(
    run: JoinHandle<RunOutcome>,
    snapshot: Arc<watch::Sender<RunSnapshot>>,
) -> Option<RunOutcome> {
    match run.await {
        Ok(outcome) => {
            snapshot.send_if_modified(|s| {
                if s.status != RunStatus::Running {
                    return false;
                }
                s.status = outcome.status;
                true
            });
            Some(outcome)
        }
        Err(e) => {
            tracing::error!(error = %e, "Run task failed");
            snapshot.send_modify(|s| {
                s.status = RunStatus::Failed;
                s.push_log(&format!("Run task failed: {}", e));
            });
            None
        }
    }
}

/// Starts, stops and reports on discovery runs.
pub struct RunController {
    provider: Arc<dyn CompletionProvider>,
    config: PipelineConfig,
    observers: ObserverSet,
    snapshot: Arc<watch::Sender<RunSnapshot>>,
    active: Mutex<Option<ActiveRun>>,
}

impl RunController {
    pub fn new(provider: Arc<dyn CompletionProvider>, config: PipelineConfig) -> Self {
        let (snapshot, _) = watch::channel(RunSnapshot::idle());
        Self {
            provider,
            config,
            observers: ObserverSet::tracing(),
            snapshot: Arc::new(snapshot),
            active: Mutex::new(None),
        }
    }

    /// Adds an observer that receives every run's notifications.
    pub fn with_observer(mut self, observer: Arc<dyn ProgressObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    /// Starts a run for `problem` and returns its run id.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(&self, problem: &str) -> Result<String, ControlError> {
        let problem = problem.trim();
        if problem.is_empty() {
            return Err(ControlError::EmptyProblem);
        }
        self.start_from(RunState::new(problem))
    }

    /// Starts a run from an existing state, skipping completed stages.
    pub fn start_from(&self, state: RunState) -> Result<String, ControlError> {
        if state.problem.trim().is_empty() {
            return Err(ControlError::EmptyProblem);
        }

        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if self.is_running() {
            return Err(ControlError::AlreadyRunning);
        }

        let run_id = state.run_id.clone();
        let cancel = CancellationToken::new();
        let observer = self.observers.clone().with(Arc::new(SnapshotObserver {
            tx: self.snapshot.clone(),
        }));
        let pipeline = DiscoveryPipeline::new(self.provider.clone(), self.config.clone())
            .with_observer(Arc::new(observer))
            .with_cancellation(cancel.clone());

        self.snapshot.send_replace(RunSnapshot::starting(&state));
        let run = tokio::spawn(async move { pipeline.resume(state).await });
        let handle = tokio::spawn(supervise(run, self.snapshot.clone()));
        *active = Some(ActiveRun {
            cancel,
            handle: Some(handle),
        });

        tracing::info!(run_id = %run_id, "Discovery run started");
        Ok(run_id)
    }

    /// Requests a cooperative stop; returns without waiting for the run.
    pub fn stop(&self) -> Result<(), ControlError> {
        if !self.is_running() {
            return Err(ControlError::NotRunning);
        }
        let active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match active.as_ref() {
            Some(run) => {
                run.cancel.cancel();
                tracing::info!("Stop requested");
                Ok(())
            }
            None => Err(ControlError::NotRunning),
        }
    }

    /// Whether a run is executing.
    ///
    /// A run counts as finished once its terminal status is published, either
    /// by the pipeline or by the supervising task when the run task dies.
    pub fn is_running(&self) -> bool {
        self.snapshot.borrow().status == RunStatus::Running
    }

    /// Waits for the current run to finish and returns its outcome.
    ///
    /// Returns `None` when no run was started or it was already collected.
    pub async fn wait(&self) -> Option<RunOutcome> {
        let handle = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_mut()
            .and_then(|run| run.handle.take())?;

        match handle.await {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(error = %e, "Run supervisor failed");
                self.snapshot.send_modify(|s| s.status = RunStatus::Failed);
                None
            }
        }
    }

    /// Current snapshot.
    pub fn snapshot(&self) -> RunSnapshot {
        self.snapshot.borrow().clone()
    }

    /// Receiver that observes every published snapshot.
    pub fn subscribe(&self) -> watch::Receiver<RunSnapshot> {
        self.snapshot.subscribe()
    }

    /// Probes the completion service and reports the run state.
    pub async fn status(&self) -> ServiceStatus {
        let (connected, models) = match self.provider.list_models().await {
            Ok(models) => (true, models),
            Err(e) => {
                tracing::debug!(error = %e, "Model probe failed");
                (false, Vec::new())
            }
        };
        let snapshot = self.snapshot();

        ServiceStatus {
            connected,
            loaded_model: models.first().cloned(),
            models,
            running: self.is_running(),
            status: snapshot.status,
            progress: snapshot.progress,
            total: snapshot.total,
            message: snapshot.message,
            log_count: snapshot.logs.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_tail_is_bounded() {
        let mut snapshot = RunSnapshot::idle();
        for i in 0..(LOG_TAIL_LIMIT + 10) {
            snapshot.push_log(&format!("line {}", i));
        }
        assert_eq!(snapshot.logs.len(), LOG_TAIL_LIMIT);
        assert_eq!(snapshot.logs.front().map(String::as_str), Some("line 10"));
    }

    #[test]
    fn test_snapshot_observer_updates_progress() {
        let (tx, rx) = watch::channel(RunSnapshot::idle());
        let observer = SnapshotObserver { tx: Arc::new(tx) };

        observer.on_progress(3.5, 10, "Stage 3");
        observer.on_log("hello");
        observer.on_finished(RunStatus::Stopped);

        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.progress, 3.5);
        assert_eq!(snapshot.message, "Stage 3");
        assert_eq!(snapshot.logs.len(), 1);
        assert_eq!(snapshot.status, RunStatus::Stopped);
    }

    async fn exploding_run() -> RunOutcome {
        panic!("observer exploded")
    }

    #[tokio::test]
    async fn test_supervisor_publishes_failure_of_dead_run_task() {
        let (tx, rx) = watch::channel(RunSnapshot {
            status: RunStatus::Running,
            ..RunSnapshot::idle()
        });

        let outcome = supervise(tokio::spawn(exploding_run()), Arc::new(tx)).await;

        assert!(outcome.is_none());
        let snapshot = rx.borrow().clone();
        assert_eq!(snapshot.status, RunStatus::Failed);
        assert!(snapshot.logs.back().unwrap().starts_with("Run task failed"));
    }
}
