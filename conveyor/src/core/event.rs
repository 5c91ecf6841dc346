//! Trigger and status-feed event types.

use super::{RunStatus, StageName, StageStatus};
use crate::utils::{now_utc, Timestamp};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

/// The trigger event: a new, fully-written dataset is ready for processing.
///
/// Emitted by the watcher once per qualifying file, or submitted directly
/// by an external caller (the dashboard's "start pipeline" action). Both
/// paths are subject to the same single-active-run queueing rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetArrived {
    /// Path to the dataset file.
    pub path: PathBuf,
    /// When the arrival was detected.
    pub detected_at: Timestamp,
}

impl DatasetArrived {
    /// Creates a trigger for the given path, detected now.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            detected_at: now_utc(),
        }
    }
}

/// An event published on every run or stage transition.
///
/// The status feed delivers these to dashboard subscribers; only terminal
/// status and one-line error summaries appear here, raw process output
/// stays in the run log.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PipelineEvent {
    /// A new run was created and started.
    RunStarted {
        /// The run identifier.
        run_id: Uuid,
        /// The triggering dataset.
        input_path: PathBuf,
        /// When the run started.
        timestamp: Timestamp,
    },

    /// A stage transitioned or finished an attempt.
    StageUpdate {
        /// The run identifier.
        run_id: Uuid,
        /// The stage concerned.
        stage: StageName,
        /// The stage's status after the transition.
        status: StageStatus,
        /// The 1-based attempt number this update belongs to.
        attempt: u32,
        /// When the transition happened.
        timestamp: Timestamp,
        /// One-line failure summary, present only on a failed attempt.
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },

    /// The run reached a terminal state.
    RunCompleted {
        /// The run identifier.
        run_id: Uuid,
        /// The terminal status.
        status: RunStatus,
        /// When the run completed.
        timestamp: Timestamp,
        /// The last stage error, for failed runs.
        #[serde(skip_serializing_if = "Option::is_none")]
        error_message: Option<String>,
    },

    /// Train succeeded; the model artifact is ready for the inference
    /// service to load.
    ModelReady {
        /// The run identifier.
        run_id: Uuid,
        /// Path of the trained-model artifact.
        model_path: PathBuf,
        /// When the model became ready.
        timestamp: Timestamp,
    },

    /// A trigger arrived while a run was active and was queued.
    TriggerQueued {
        /// The queued dataset path.
        path: PathBuf,
        /// Current queue depth including this trigger.
        queue_depth: usize,
        /// When the trigger was queued.
        timestamp: Timestamp,
    },
}

impl PipelineEvent {
    /// Returns a short dotted kind string for logging and filtering.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RunStarted { .. } => "run.started",
            Self::StageUpdate { .. } => "stage.update",
            Self::RunCompleted { .. } => "run.completed",
            Self::ModelReady { .. } => "model.ready",
            Self::TriggerQueued { .. } => "trigger.queued",
        }
    }

    /// Returns the run this event belongs to, if any.
    #[must_use]
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::StageUpdate { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::ModelReady { run_id, .. } => Some(*run_id),
            Self::TriggerQueued { .. } => None,
        }
    }

    /// Creates a `RunStarted` event.
    #[must_use]
    pub fn run_started(run_id: Uuid, input_path: impl Into<PathBuf>) -> Self {
        Self::RunStarted {
            run_id,
            input_path: input_path.into(),
            timestamp: now_utc(),
        }
    }

    /// Creates a `StageUpdate` event.
    #[must_use]
    pub fn stage_update(
        run_id: Uuid,
        stage: StageName,
        status: StageStatus,
        attempt: u32,
        error_message: Option<String>,
    ) -> Self {
        Self::StageUpdate {
            run_id,
            stage,
            status,
            attempt,
            timestamp: now_utc(),
            error_message,
        }
    }

    /// Creates a `RunCompleted` event.
    #[must_use]
    pub fn run_completed(run_id: Uuid, status: RunStatus, error_message: Option<String>) -> Self {
        Self::RunCompleted {
            run_id,
            status,
            timestamp: now_utc(),
            error_message,
        }
    }

    /// Creates a `ModelReady` event.
    #[must_use]
    pub fn model_ready(run_id: Uuid, model_path: impl Into<PathBuf>) -> Self {
        Self::ModelReady {
            run_id,
            model_path: model_path.into(),
            timestamp: now_utc(),
        }
    }

    /// Creates a `TriggerQueued` event.
    #[must_use]
    pub fn trigger_queued(path: impl Into<PathBuf>, queue_depth: usize) -> Self {
        Self::TriggerQueued {
            path: path.into(),
            queue_depth,
            timestamp: now_utc(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_strings() {
        let run_id = Uuid::new_v4();
        assert_eq!(PipelineEvent::run_started(run_id, "/x.csv").kind(), "run.started");
        assert_eq!(
            PipelineEvent::model_ready(run_id, "/model.bin").kind(),
            "model.ready"
        );
        assert_eq!(PipelineEvent::trigger_queued("/y.csv", 1).kind(), "trigger.queued");
    }

    #[test]
    fn test_run_id_accessor() {
        let run_id = Uuid::new_v4();
        let event = PipelineEvent::run_completed(run_id, RunStatus::Succeeded, None);
        assert_eq!(event.run_id(), Some(run_id));
        assert_eq!(PipelineEvent::trigger_queued("/y.csv", 2).run_id(), None);
    }

    #[test]
    fn test_stage_update_serialization() {
        let run_id = Uuid::new_v4();
        let event = PipelineEvent::stage_update(
            run_id,
            StageName::Clean,
            StageStatus::Running,
            2,
            None,
        );

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "stage_update");
        assert_eq!(json["stage"], "clean");
        assert_eq!(json["status"], "running");
        assert_eq!(json["attempt"], 2);
        // Absent error is omitted entirely.
        assert!(json.get("error_message").is_none());
    }

    #[test]
    fn test_event_round_trip() {
        let event = PipelineEvent::stage_update(
            Uuid::new_v4(),
            StageName::Train,
            StageStatus::Failed,
            3,
            Some("exit 1".to_string()),
        );
        let json = serde_json::to_string(&event).unwrap();
        let back: PipelineEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind(), "stage.update");
    }
}
