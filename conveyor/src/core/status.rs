//! Run and stage status enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Run has been created but not started.
    Pending,
    /// Run is executing its stage sequence.
    Running,
    /// All stages completed successfully.
    Succeeded,
    /// A stage exhausted its retries, or the run was cancelled.
    Failed,
}

impl Default for RunStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl RunStatus {
    /// Returns true if the status is terminal for the run.
    ///
    /// Terminal states are final: a subsequent trigger always creates a new
    /// run, never reopens a terminal one.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// The execution status of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    /// Stage has not been dispatched yet.
    Pending,
    /// Stage has a live attempt (or is between retry attempts).
    Running,
    /// Stage produced its output artifact.
    Succeeded,
    /// Stage exhausted its retries or was aborted.
    Failed,
}

impl Default for StageStatus {
    fn default() -> Self {
        Self::Pending
    }
}

impl fmt::Display for StageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl StageStatus {
    /// Returns true if the status is terminal for the stage.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_status_display() {
        assert_eq!(RunStatus::Pending.to_string(), "pending");
        assert_eq!(RunStatus::Running.to_string(), "running");
        assert_eq!(RunStatus::Succeeded.to_string(), "succeeded");
        assert_eq!(RunStatus::Failed.to_string(), "failed");
    }

    #[test]
    fn test_run_status_is_terminal() {
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
        assert!(!RunStatus::Pending.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
    }

    #[test]
    fn test_stage_status_is_terminal() {
        assert!(StageStatus::Succeeded.is_terminal());
        assert!(StageStatus::Failed.is_terminal());
        assert!(!StageStatus::Pending.is_terminal());
        assert!(!StageStatus::Running.is_terminal());
    }

    #[test]
    fn test_status_serialize() {
        let json = serde_json::to_string(&RunStatus::Running).unwrap();
        assert_eq!(json, r#""running""#);

        let deserialized: StageStatus = serde_json::from_str(r#""succeeded""#).unwrap();
        assert_eq!(deserialized, StageStatus::Succeeded);
    }
}
