//! The pipeline orchestrator.
//!
//! One control loop owns the run state machine: it consumes trigger and
//! stage-completion events from its inbox, drives the ordered stage
//! sequence through the stage runner, updates the state store, applies
//! retry policy on failure, and publishes a notification for every
//! transition. Stage execution is dispatched to worker tasks whose
//! completion comes back as an event, so the loop never blocks while a
//! stage runs and remains the single writer of run state.

mod retry;

#[cfg(test)]
mod integration_tests;

pub use retry::{RetryDecision, RetryPolicy};

use crate::cancellation::CancelToken;
use crate::config::PipelineConfig;
use crate::core::{
    DatasetArrived, PipelineEvent, PipelineRun, RunStatus, StageName, StageStatus,
};
use crate::errors::ConveyorError;
use crate::events::{EventSink, NoOpEventSink, RunLog};
use crate::runner::{StageOutcome, StageRequest, StageRunner};
use crate::store::StateStore;
use crate::watcher::ProcessedIndex;
use std::collections::VecDeque;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};
use uuid::Uuid;

const INBOX_CAPACITY: usize = 64;

/// Events consumed by the orchestrator control loop.
#[derive(Debug)]
pub enum OrchestratorEvent {
    /// A dataset trigger, from the watcher or a manual caller.
    Trigger(DatasetArrived),

    /// A worker finished (or failed to start) a stage attempt.
    StageCompleted {
        /// The run the attempt belonged to.
        run_id: Uuid,
        /// The stage that was attempted.
        stage: StageName,
        /// The 1-based attempt number.
        attempt: u32,
        /// The attempt result; `Err` is an infrastructure failure.
        outcome: Result<StageOutcome, ConveyorError>,
    },

    /// A scheduled retry backoff elapsed.
    RetryDue {
        /// The run owning the retry.
        run_id: Uuid,
        /// The stage to re-dispatch.
        stage: StageName,
    },

    /// Cancel the active run.
    CancelRun {
        /// Why the run is being cancelled.
        reason: String,
    },

    /// Cancel everything and reset store, log, and dedup state.
    Clear,

    /// Stop the control loop.
    Shutdown,
}

/// Cloneable write surface for external callers (e.g. the dashboard).
#[derive(Debug, Clone)]
pub struct OrchestratorHandle {
    tx: mpsc::Sender<OrchestratorEvent>,
}

impl OrchestratorHandle {
    /// Submits a manual trigger for the given dataset path.
    ///
    /// Equivalent to a watcher-emitted trigger and subject to the same
    /// single-active-run queueing rule.
    ///
    /// # Errors
    ///
    /// Returns [`ConveyorError::ChannelClosed`] if the orchestrator has
    /// shut down.
    pub async fn trigger(&self, path: impl Into<PathBuf>) -> Result<(), ConveyorError> {
        self.submit(DatasetArrived::new(path)).await
    }

    /// Submits a prepared trigger event.
    ///
    /// # Errors
    ///
    /// Returns [`ConveyorError::ChannelClosed`] if the orchestrator has
    /// shut down.
    pub async fn submit(&self, event: DatasetArrived) -> Result<(), ConveyorError> {
        self.send(OrchestratorEvent::Trigger(event)).await
    }

    /// Cancels the active run with a reason.
    ///
    /// # Errors
    ///
    /// Returns [`ConveyorError::ChannelClosed`] if the orchestrator has
    /// shut down.
    pub async fn cancel(&self, reason: impl Into<String>) -> Result<(), ConveyorError> {
        self.send(OrchestratorEvent::CancelRun {
            reason: reason.into(),
        })
        .await
    }

    /// Cancels any active run and resets all pipeline state.
    ///
    /// # Errors
    ///
    /// Returns [`ConveyorError::ChannelClosed`] if the orchestrator has
    /// shut down.
    pub async fn clear(&self) -> Result<(), ConveyorError> {
        self.send(OrchestratorEvent::Clear).await
    }

    /// Stops the control loop.
    ///
    /// # Errors
    ///
    /// Returns [`ConveyorError::ChannelClosed`] if it already stopped.
    pub async fn shutdown(&self) -> Result<(), ConveyorError> {
        self.send(OrchestratorEvent::Shutdown).await
    }

    async fn send(&self, event: OrchestratorEvent) -> Result<(), ConveyorError> {
        self.tx
            .send(event)
            .await
            .map_err(|_| ConveyorError::ChannelClosed)
    }
}

#[derive(Debug)]
struct ActiveRun {
    run_id: Uuid,
    cancel: Arc<CancelToken>,
}

/// Owns the pipeline state machine.
pub struct Orchestrator {
    config: PipelineConfig,
    runner: Arc<dyn StageRunner>,
    store: Arc<StateStore>,
    sink: Arc<dyn EventSink>,
    log: Arc<RunLog>,
    dedup: Option<ProcessedIndex>,
    events_tx: mpsc::Sender<OrchestratorEvent>,
    events_rx: mpsc::Receiver<OrchestratorEvent>,
    triggers_tx: mpsc::Sender<DatasetArrived>,
    triggers_rx: mpsc::Receiver<DatasetArrived>,
    queue: VecDeque<DatasetArrived>,
    active: Option<ActiveRun>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("active", &self.active)
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator with a fresh store, a no-op sink, and a
    /// default run log.
    #[must_use]
    pub fn new(config: PipelineConfig, runner: Arc<dyn StageRunner>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(INBOX_CAPACITY);
        let (triggers_tx, triggers_rx) = mpsc::channel(INBOX_CAPACITY);
        Self {
            config,
            runner,
            store: Arc::new(StateStore::new()),
            sink: Arc::new(NoOpEventSink),
            log: Arc::new(RunLog::default()),
            dedup: None,
            events_tx,
            events_rx,
            triggers_tx,
            triggers_rx,
            queue: VecDeque::new(),
            active: None,
        }
    }

    /// Uses a shared state store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<StateStore>) -> Self {
        self.store = store;
        self
    }

    /// Uses an event sink (typically a [`crate::events::StatusFeed`]).
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Uses a shared run log.
    #[must_use]
    pub fn with_log(mut self, log: Arc<RunLog>) -> Self {
        self.log = log;
        self
    }

    /// Attaches the watcher's processed-file index so `clear` also forgets
    /// processed datasets.
    #[must_use]
    pub fn with_dedup_index(mut self, index: ProcessedIndex) -> Self {
        self.dedup = Some(index);
        self
    }

    /// Returns a cloneable handle for manual triggers and control.
    #[must_use]
    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            tx: self.events_tx.clone(),
        }
    }

    /// Returns the sender the watcher feeds triggers into.
    #[must_use]
    pub fn trigger_sender(&self) -> mpsc::Sender<DatasetArrived> {
        self.triggers_tx.clone()
    }

    /// Returns the state store for pull-style status reads.
    #[must_use]
    pub fn store(&self) -> Arc<StateStore> {
        Arc::clone(&self.store)
    }

    /// Returns the run log.
    #[must_use]
    pub fn log(&self) -> Arc<RunLog> {
        Arc::clone(&self.log)
    }

    /// Runs the control loop until shutdown.
    pub async fn run(mut self) {
        debug!("Orchestrator control loop started");
        loop {
            let event = tokio::select! {
                Some(trigger) = self.triggers_rx.recv() => OrchestratorEvent::Trigger(trigger),
                Some(event) = self.events_rx.recv() => event,
                else => break,
            };

            match event {
                OrchestratorEvent::Trigger(trigger) => self.on_trigger(trigger).await,
                OrchestratorEvent::StageCompleted {
                    run_id,
                    stage,
                    attempt,
                    outcome,
                } => self.on_stage_completed(run_id, stage, attempt, outcome).await,
                OrchestratorEvent::RetryDue { run_id, stage } => {
                    self.on_retry_due(run_id, stage).await;
                }
                OrchestratorEvent::CancelRun { reason } => self.on_cancel(&reason).await,
                OrchestratorEvent::Clear => self.on_clear().await,
                OrchestratorEvent::Shutdown => break,
            }
        }
        debug!("Orchestrator control loop stopped");
    }

    async fn on_trigger(&mut self, trigger: DatasetArrived) {
        if self.active.is_some() {
            self.queue.push_back(trigger.clone());
            self.log.info(format!(
                "Trigger for {} queued behind the active run",
                trigger.path.display()
            ));
            self.publish(PipelineEvent::trigger_queued(trigger.path, self.queue.len()))
                .await;
            return;
        }
        self.start_run(trigger).await;
    }

    /// Starts a run for the trigger.
    ///
    /// Boxed because completing a run starts the next queued one, which
    /// makes this call graph recursive.
    fn start_run(
        &mut self,
        trigger: DatasetArrived,
    ) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let run = PipelineRun::new(trigger.path.clone());
            let run_id = run.id;

            if let Err(e) = self.store.begin_run(run) {
                error!(error = %e, "Refusing trigger: store already holds an active run");
                self.log.error(format!("Internal consistency error: {e}"));
                return;
            }
            let _ = self.store.update(run_id, PipelineRun::start);
            self.active = Some(ActiveRun {
                run_id,
                cancel: Arc::new(CancelToken::new()),
            });

            self.log.info(format!(
                "Run {run_id} started for {}",
                trigger.path.display()
            ));
            self.publish(PipelineEvent::run_started(run_id, trigger.path))
                .await;

            self.dispatch_stage(run_id, StageName::Convert).await;
        })
    }

    /// Resolves the input path for a stage: the original dataset for the
    /// first stage, the predecessor's output otherwise.
    fn stage_input(&self, run: &PipelineRun, stage: StageName) -> Result<PathBuf, ConveyorError> {
        match stage.previous() {
            None => Ok(run.input_path.clone()),
            Some(prev) => {
                let record = run.stage(prev);
                if record.status() == StageStatus::Succeeded {
                    record
                        .output_path()
                        .map(Path::to_path_buf)
                        .ok_or_else(|| {
                            ConveyorError::invariant(format!(
                                "stage '{prev}' succeeded without an output path"
                            ))
                        })
                } else {
                    Err(ConveyorError::invariant(format!(
                        "stage '{stage}' dispatched before '{prev}' succeeded"
                    )))
                }
            }
        }
    }

    async fn dispatch_stage(&mut self, run_id: Uuid, stage: StageName) {
        let cancel = match &self.active {
            Some(active) if active.run_id == run_id => Arc::clone(&active.cancel),
            _ => {
                debug!(run_id = %run_id, stage = %stage, "Not dispatching: run is no longer active");
                return;
            }
        };

        let snapshot = match self.store.active_snapshot() {
            Some(snapshot) if snapshot.id == run_id => snapshot,
            _ => {
                debug!(run_id = %run_id, "Not dispatching: run left the store");
                return;
            }
        };

        let input = match self.stage_input(&snapshot, stage) {
            Ok(input) => input,
            Err(e) => {
                self.fail_run_on_invariant(run_id, &e).await;
                return;
            }
        };

        let attempt = match self
            .store
            .update(run_id, |r| r.stage_mut(stage).begin_attempt())
        {
            Ok(attempt) => attempt,
            Err(e) => {
                warn!(run_id = %run_id, error = %e, "Could not open attempt");
                return;
            }
        };

        self.log.info(format!(
            "Stage {stage} attempt {attempt} started (run {run_id})"
        ));
        self.publish(PipelineEvent::stage_update(
            run_id,
            stage,
            StageStatus::Running,
            attempt,
            None,
        ))
        .await;

        let request = StageRequest {
            stage,
            input_path: input,
            output_dir: self.config.stage_output_dir(run_id, stage),
            timeout: self.config.stage_timeout(stage),
        };
        let runner = Arc::clone(&self.runner);
        let tx = self.events_tx.clone();
        tokio::spawn(async move {
            let outcome = runner.run(&request, &cancel).await;
            let _ = tx
                .send(OrchestratorEvent::StageCompleted {
                    run_id,
                    stage,
                    attempt,
                    outcome,
                })
                .await;
        });
    }

    async fn on_stage_completed(
        &mut self,
        run_id: Uuid,
        stage: StageName,
        attempt: u32,
        outcome: Result<StageOutcome, ConveyorError>,
    ) {
        let is_active = self.active.as_ref().is_some_and(|a| a.run_id == run_id);
        if !is_active {
            debug!(run_id = %run_id, stage = %stage, "Ignoring completion for inactive run");
            return;
        }

        match outcome {
            Ok(outcome) if outcome.success => match outcome.output_path {
                Some(output_path) => {
                    self.on_stage_succeeded(run_id, stage, attempt, outcome.exit_code, output_path)
                        .await;
                }
                None => {
                    let e = ConveyorError::invariant(format!(
                        "stage '{stage}' reported success without an output path"
                    ));
                    self.fail_run_on_invariant(run_id, &e).await;
                }
            },
            Ok(outcome) => {
                if !outcome.logs.is_empty() {
                    debug!(run_id = %run_id, stage = %stage, "Stage output:\n{}", outcome.logs);
                }
                let message = outcome
                    .error
                    .unwrap_or_else(|| "stage failed".to_string());
                self.on_stage_failed(run_id, stage, attempt, outcome.exit_code, message)
                    .await;
            }
            Err(ConveyorError::Cancelled(reason)) => {
                // Cancellation teardown already happened in on_cancel.
                debug!(run_id = %run_id, stage = %stage, reason = %reason, "Stage cancelled");
            }
            Err(e) => {
                // Infrastructure failure consumes a retry like any other
                // failed attempt.
                self.on_stage_failed(run_id, stage, attempt, None, e.to_string())
                    .await;
            }
        }
    }

    async fn on_stage_succeeded(
        &mut self,
        run_id: Uuid,
        stage: StageName,
        attempt: u32,
        exit_code: Option<i32>,
        output_path: PathBuf,
    ) {
        let updated = self.store.update(run_id, |r| {
            let record = r.stage_mut(stage);
            record.finish_attempt(exit_code, None);
            record.mark_succeeded(output_path.clone());
        });
        if updated.is_err() {
            return;
        }

        self.log.info(format!(
            "Stage {stage} succeeded on attempt {attempt} (run {run_id})"
        ));
        self.publish(PipelineEvent::stage_update(
            run_id,
            stage,
            StageStatus::Succeeded,
            attempt,
            None,
        ))
        .await;

        if stage == StageName::Train {
            self.log.info(format!("Model ready at {}", output_path.display()));
            self.publish(PipelineEvent::model_ready(run_id, output_path.clone()))
                .await;
        }

        match stage.next() {
            Some(next) => self.dispatch_stage(run_id, next).await,
            None => {
                self.finish_active_run(run_id, RunStatus::Succeeded, None)
                    .await;
            }
        }
    }

    async fn on_stage_failed(
        &mut self,
        run_id: Uuid,
        stage: StageName,
        attempt: u32,
        exit_code: Option<i32>,
        message: String,
    ) {
        let updated = self.store.update(run_id, |r| {
            r.stage_mut(stage)
                .finish_attempt(exit_code, Some(message.clone()));
        });
        if updated.is_err() {
            return;
        }

        self.log.error(format!(
            "Stage {stage} attempt {attempt} failed: {message} (run {run_id})"
        ));

        match self.config.retry.decide(attempt) {
            RetryDecision::Retry(delay) => {
                self.log.info(format!(
                    "Retrying stage {stage} in {}ms (attempt {} of {})",
                    delay.as_millis(),
                    attempt + 1,
                    self.config.retry.max_attempts
                ));
                self.publish(PipelineEvent::stage_update(
                    run_id,
                    stage,
                    StageStatus::Running,
                    attempt,
                    Some(message),
                ))
                .await;

                let tx = self.events_tx.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send(OrchestratorEvent::RetryDue { run_id, stage }).await;
                });
            }
            RetryDecision::GiveUp => {
                let _ = self.store.update(run_id, |r| r.stage_mut(stage).mark_failed());
                self.publish(PipelineEvent::stage_update(
                    run_id,
                    stage,
                    StageStatus::Failed,
                    attempt,
                    Some(message.clone()),
                ))
                .await;
                self.log.error(format!(
                    "Stage {stage} exhausted {} attempts; failing run {run_id}",
                    self.config.retry.max_attempts
                ));
                self.finish_active_run(run_id, RunStatus::Failed, Some(message))
                    .await;
            }
        }
    }

    async fn on_retry_due(&mut self, run_id: Uuid, stage: StageName) {
        let is_active = self.active.as_ref().is_some_and(|a| a.run_id == run_id);
        if !is_active {
            debug!(run_id = %run_id, stage = %stage, "Ignoring retry for inactive run");
            return;
        }
        self.dispatch_stage(run_id, stage).await;
    }

    async fn on_cancel(&mut self, reason: &str) {
        let Some(active) = self.active.take() else {
            self.log.warn("Cancel requested with no active run");
            return;
        };
        let run_id = active.run_id;
        active.cancel.cancel(reason);

        let reason_msg = format!("cancelled: {reason}");
        self.log.warn(format!("Run {run_id} {reason_msg}"));

        let aborted_stage = self
            .store
            .active_snapshot()
            .and_then(|r| r.active_stage());
        let _ = self.store.update(run_id, |r| r.abort(&reason_msg));

        if let Some(stage) = aborted_stage {
            let attempt = self
                .store
                .active_snapshot()
                .map_or(0, |r| r.stage(stage).attempt_count());
            self.publish(PipelineEvent::stage_update(
                run_id,
                stage,
                StageStatus::Failed,
                attempt,
                Some(reason_msg.clone()),
            ))
            .await;
        }

        self.finish_active_run(run_id, RunStatus::Failed, Some(reason_msg))
            .await;
    }

    async fn on_clear(&mut self) {
        self.queue.clear();
        if self.active.is_some() {
            self.on_cancel("cleared").await;
        }
        self.store.clear();
        if let Some(index) = &self.dedup {
            index.forget_all();
        }
        self.log.clear();
        self.log.info("Pipeline state cleared");
    }

    /// Distinct handling for must-never-happen conditions: the run is
    /// failed immediately, without consuming retry accounting.
    async fn fail_run_on_invariant(&mut self, run_id: Uuid, err: &ConveyorError) {
        error!(run_id = %run_id, error = %err, "Invariant violation; failing run");
        self.log.error(format!("Internal consistency error: {err}"));
        let _ = self.store.update(run_id, |r| r.abort(&err.to_string()));
        self.finish_active_run(run_id, RunStatus::Failed, Some(err.to_string()))
            .await;
    }

    async fn finish_active_run(
        &mut self,
        run_id: Uuid,
        status: RunStatus,
        error_message: Option<String>,
    ) {
        let _ = self.store.update(run_id, |r| {
            if !r.is_terminal() {
                r.complete(status);
            }
        });

        match self.store.finish_run(run_id) {
            Ok(run) => {
                self.log.info(format!(
                    "Run {run_id} completed with status {} after {} attempt(s)",
                    run.status(),
                    run.total_attempts()
                ));
            }
            Err(e) => error!(run_id = %run_id, error = %e, "Could not retire run"),
        }
        self.active = None;

        self.publish(PipelineEvent::run_completed(run_id, status, error_message))
            .await;

        if let Some(next) = self.queue.pop_front() {
            self.log.info(format!(
                "Dequeuing next trigger: {}",
                next.path.display()
            ));
            self.start_run(next).await;
        }
    }

    async fn publish(&self, event: PipelineEvent) {
        self.sink.emit(&event).await;
    }
}
