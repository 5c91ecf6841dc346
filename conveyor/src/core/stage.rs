//! The fixed, ordered stage sequence of the pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A stage of the pipeline, in execution order.
///
/// The sequence is fixed: Convert, Clean, Train, Infer-Ready. Each stage
/// consumes the previous stage's output path (the original dataset for
/// Convert) and produces exactly one output artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageName {
    /// Format conversion (e.g. spreadsheet to CSV).
    Convert,
    /// Statistical cleaning and transformation.
    Clean,
    /// Model fitting.
    Train,
    /// Packaging the trained model for the inference service.
    InferReady,
}

/// The canonical stage execution order.
pub const STAGE_SEQUENCE: [StageName; 4] = [
    StageName::Convert,
    StageName::Clean,
    StageName::Train,
    StageName::InferReady,
];

impl StageName {
    /// Returns the stable 0-based index of this stage in the sequence.
    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            Self::Convert => 0,
            Self::Clean => 1,
            Self::Train => 2,
            Self::InferReady => 3,
        }
    }

    /// Returns the stage at the given index, if any.
    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        STAGE_SEQUENCE.get(index).copied()
    }

    /// Returns the next stage in the sequence, or `None` for the last one.
    #[must_use]
    pub fn next(&self) -> Option<Self> {
        Self::from_index(self.index() + 1)
    }

    /// Returns the previous stage in the sequence, or `None` for the first.
    #[must_use]
    pub fn previous(&self) -> Option<Self> {
        self.index().checked_sub(1).and_then(Self::from_index)
    }

    /// Returns the stage name as used in events and directory names.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Convert => "convert",
            Self::Clean => "clean",
            Self::Train => "train",
            Self::InferReady => "infer_ready",
        }
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
