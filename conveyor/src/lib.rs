//! # Conveyor
//!
//! A file-triggered, multi-stage ML data pipeline orchestrator.
//!
//! A new dataset dropped into a watched directory flows through four
//! stages (Convert, Clean, Train, Infer-Ready), each executed as an
//! isolated subprocess. Conveyor detects the arrival, sequences the
//! stages, tracks per-stage state and attempt history, applies retry
//! policy with exponential backoff, and publishes a status feed for an
//! external dashboard. The dashboard itself and the stage programs are
//! external collaborators; conveyor only calls into them and reports
//! through them.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use conveyor::prelude::*;
//! use std::sync::Arc;
//!
//! let config = PipelineConfig::new("data/raw", "data")
//!     .with_command(StageName::Convert, StageCommand::new("convert-stage", "dataset.csv"))
//!     .with_command(StageName::Clean, StageCommand::new("clean-stage", "cleaned.csv"))
//!     .with_command(StageName::Train, StageCommand::new("train-stage", "model.bin"))
//!     .with_command(StageName::InferReady, StageCommand::new("package-stage", "bundle.tar"));
//! config.validate()?;
//!
//! let runner = Arc::new(ProcessStageRunner::from_config(&config));
//! let feed = Arc::new(StatusFeed::default());
//! let orchestrator = Orchestrator::new(config.clone(), runner)
//!     .with_sink(feed.clone());
//!
//! let watcher = Watcher::new(&config, orchestrator.trigger_sender());
//! let handle = orchestrator.handle();
//! let mut events = feed.subscribe();
//!
//! watcher.spawn();
//! tokio::spawn(orchestrator.run());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod orchestrator;
pub mod runner;
pub mod store;
pub mod testing;
pub mod utils;
pub mod watcher;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cancellation::CancelToken;
    pub use crate::config::{PipelineConfig, StageCommand};
    pub use crate::core::{
        AttemptRecord, DatasetArrived, PipelineEvent, PipelineRun, RunStatus, StageName,
        StageRecord, StageStatus, STAGE_SEQUENCE,
    };
    pub use crate::errors::ConveyorError;
    pub use crate::events::{
        EventSink, LogEntry, LogLevel, LoggingEventSink, NoOpEventSink, RunLog, StatusFeed,
    };
    pub use crate::orchestrator::{
        Orchestrator, OrchestratorEvent, OrchestratorHandle, RetryDecision, RetryPolicy,
    };
    pub use crate::runner::{ProcessStageRunner, StageOutcome, StageRequest, StageRunner};
    pub use crate::store::StateStore;
    pub use crate::utils::{iso_timestamp, now_utc, Timestamp};
    pub use crate::watcher::{ProcessedIndex, Watcher};
}
