//! Run, stage, and attempt records.
//!
//! These records are exclusively owned and mutated by the orchestrator;
//! everything else sees cloned snapshots through the state store. The
//! `output_path`/`status` pairing on [`StageRecord`] is kept consistent by
//! construction: `mark_succeeded` and `mark_failed` are the only mutators
//! that touch either field after an attempt finishes.

use super::{RunStatus, StageName, StageStatus, STAGE_SEQUENCE};
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// One execution try of a single stage within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based attempt number, monotonically increasing per stage.
    pub attempt_number: u32,
    /// When the attempt was dispatched.
    pub started_at: Timestamp,
    /// When the attempt finished, if it has.
    pub ended_at: Option<Timestamp>,
    /// Process exit code, when the stage process ran to an exit.
    pub exit_code: Option<i32>,
    /// Present only on non-zero exit, timeout, or infrastructure failure.
    pub error_message: Option<String>,
}

impl AttemptRecord {
    fn begin(attempt_number: u32) -> Self {
        Self {
            attempt_number,
            started_at: now_utc(),
            ended_at: None,
            exit_code: None,
            error_message: None,
        }
    }

    /// Closes the attempt with its outcome.
    pub fn finish(&mut self, exit_code: Option<i32>, error_message: Option<String>) {
        self.ended_at = Some(now_utc());
        self.exit_code = exit_code;
        self.error_message = error_message;
    }

    /// Returns true if the attempt failed.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        self.error_message.is_some()
    }
}

/// The attempt history and outcome of one stage within a run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    /// Which stage this record tracks.
    pub name: StageName,
    status: StageStatus,
    attempts: Vec<AttemptRecord>,
    output_path: Option<PathBuf>,
}

impl StageRecord {
    fn new(name: StageName) -> Self {
        Self {
            name,
            status: StageStatus::Pending,
            attempts: Vec::new(),
            output_path: None,
        }
    }

    /// Returns the current stage status.
    #[must_use]
    pub fn status(&self) -> StageStatus {
        self.status
    }

    /// Returns the output artifact path. Set if and only if the stage
    /// succeeded.
    #[must_use]
    pub fn output_path(&self) -> Option<&Path> {
        self.output_path.as_deref()
    }

    /// Returns the recorded attempts, oldest first.
    #[must_use]
    pub fn attempts(&self) -> &[AttemptRecord] {
        &self.attempts
    }

    /// Returns the number of attempts recorded so far.
    #[must_use]
    pub fn attempt_count(&self) -> u32 {
        self.attempts.len() as u32
    }

    /// Opens a new attempt and moves the stage to `Running`.
    ///
    /// Returns the 1-based attempt number.
    pub fn begin_attempt(&mut self) -> u32 {
        let attempt_number = self.attempt_count() + 1;
        self.attempts.push(AttemptRecord::begin(attempt_number));
        self.status = StageStatus::Running;
        attempt_number
    }

    /// Closes the most recent attempt with its outcome.
    pub fn finish_attempt(&mut self, exit_code: Option<i32>, error_message: Option<String>) {
        if let Some(attempt) = self.attempts.last_mut() {
            attempt.finish(exit_code, error_message);
        }
    }

    /// Marks the stage succeeded with its produced artifact.
    pub fn mark_succeeded(&mut self, output_path: PathBuf) {
        self.status = StageStatus::Succeeded;
        self.output_path = Some(output_path);
    }

    /// Marks the stage failed. Clears any output path.
    pub fn mark_failed(&mut self) {
        self.status = StageStatus::Failed;
        self.output_path = None;
    }

    /// Returns the error message of the most recent failed attempt.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        self.attempts
            .iter()
            .rev()
            .find_map(|a| a.error_message.as_deref())
    }
}

/// One end-to-end pipeline execution triggered by one input file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    /// Unique identifier, assigned at trigger consumption.
    pub id: Uuid,
    /// Path to the triggering dataset.
    pub input_path: PathBuf,
    /// When the run was created.
    pub created_at: Timestamp,
    stages: Vec<StageRecord>,
    status: RunStatus,
    completed_at: Option<Timestamp>,
}

impl PipelineRun {
    /// Creates a new pending run for the given input dataset.
    #[must_use]
    pub fn new(input_path: impl Into<PathBuf>) -> Self {
        Self {
            id: Uuid::new_v4(),
            input_path: input_path.into(),
            created_at: now_utc(),
            stages: STAGE_SEQUENCE.iter().map(|s| StageRecord::new(*s)).collect(),
            status: RunStatus::Pending,
            completed_at: None,
        }
    }

    /// Returns the run status.
    #[must_use]
    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Returns when the run reached a terminal state, if it has.
    #[must_use]
    pub fn completed_at(&self) -> Option<Timestamp> {
        self.completed_at
    }

    /// Returns true once the run is `Succeeded` or `Failed`.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Returns all stage records in execution order.
    #[must_use]
    pub fn stages(&self) -> &[StageRecord] {
        &self.stages
    }

    /// Returns the record for one stage.
    #[must_use]
    pub fn stage(&self, name: StageName) -> &StageRecord {
        &self.stages[name.index()]
    }

    /// Returns the mutable record for one stage.
    pub fn stage_mut(&mut self, name: StageName) -> &mut StageRecord {
        &mut self.stages[name.index()]
    }

    /// Returns the stage currently running, or the next pending one while
    /// the run itself is still live.
    #[must_use]
    pub fn active_stage(&self) -> Option<StageName> {
        if self.status.is_terminal() {
            return None;
        }
        self.stages
            .iter()
            .find(|s| !s.status().is_terminal())
            .map(|s| s.name)
    }

    /// Moves the run from `Pending` to `Running`.
    pub fn start(&mut self) {
        self.status = RunStatus::Running;
    }

    /// Moves the run to a terminal state and stamps `completed_at`.
    pub fn complete(&mut self, status: RunStatus) {
        debug_assert!(status.is_terminal());
        self.status = status;
        self.completed_at = Some(now_utc());
    }

    /// Aborts the run: closes any open attempt with the given reason, fails
    /// the running stage, and moves the run to `Failed`.
    pub fn abort(&mut self, reason: &str) {
        for stage in &mut self.stages {
            if stage.status() == StageStatus::Running {
                stage.finish_attempt(None, Some(reason.to_string()));
                stage.mark_failed();
            }
        }
        self.complete(RunStatus::Failed);
    }

    /// Returns the total number of attempts across all stages.
    #[must_use]
    pub fn total_attempts(&self) -> u32 {
        self.stages.iter().map(StageRecord::attempt_count).sum()
    }

    /// Returns the most recent error message across all stages.
    ///
    /// This is the one-line summary surfaced to the status feed; full
    /// detail stays in the captured logs.
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.stages
            .iter()
            .rev()
            .find_map(|s| s.last_error())
            .map(str::to_string)
    }

    /// Returns the trained-model artifact path once Train has succeeded.
    #[must_use]
    pub fn model_path(&self) -> Option<&Path> {
        let train = self.stage(StageName::Train);
        if train.status() == StageStatus::Succeeded {
            train.output_path()
        } else {
            None
        }
    }
}
