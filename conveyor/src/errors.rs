//! Error types for the conveyor orchestrator.
//!
//! The taxonomy separates transient stage failures (booked as retryable
//! attempts by the orchestrator) from infrastructure failures, watcher I/O
//! problems, and internal-consistency violations.

use thiserror::Error;
use uuid::Uuid;

/// The main error type for conveyor operations.
#[derive(Debug, Error)]
pub enum ConveyorError {
    /// The configuration is structurally invalid.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A stage process could not be launched at all.
    ///
    /// Distinct from a stage that ran and exited non-zero: launch failures
    /// are infrastructure failures, though the orchestrator books them as a
    /// failed attempt all the same.
    #[error("Failed to launch stage '{stage}': {reason}")]
    StageLaunch {
        /// The stage that failed to launch.
        stage: String,
        /// Why the launch failed.
        reason: String,
    },

    /// A run was cancelled before the stage finished.
    #[error("Run cancelled: {0}")]
    Cancelled(String),

    /// An internal-consistency invariant was violated.
    ///
    /// Must never occur under correct operation; when detected the run is
    /// failed immediately and the condition is logged distinctly from
    /// ordinary stage failures.
    #[error("Internal consistency error: {0}")]
    InvariantViolation(String),

    /// An update referenced a run that is not the active one.
    #[error("No active run with id {0}")]
    RunNotActive(Uuid),

    /// The orchestrator inbox is gone; the control loop has shut down.
    #[error("Orchestrator channel closed")]
    ChannelClosed,

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ConveyorError {
    /// Creates a stage launch error.
    #[must_use]
    pub fn launch(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StageLaunch {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Creates an invariant violation error.
    #[must_use]
    pub fn invariant(message: impl Into<String>) -> Self {
        Self::InvariantViolation(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_error_display() {
        let err = ConveyorError::launch("convert", "binary not found");
        assert_eq!(
            err.to_string(),
            "Failed to launch stage 'convert': binary not found"
        );
    }

    #[test]
    fn test_invariant_error_display() {
        let err = ConveyorError::invariant("stage out of order");
        assert!(err.to_string().contains("Internal consistency error"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ConveyorError = io.into();
        assert!(matches!(err, ConveyorError::Io(_)));
    }
}
