//! Pipeline state store.
//!
//! A passive, thread-safe container for the active run and the most recent
//! completed one. The orchestrator is the only writer; the status
//! publisher and any other reader get cloned point-in-time snapshots, so a
//! stage record and its status are always observed together, never as a
//! torn update. All domain rules (ordering, retry limits) live in the
//! orchestrator, not here.

use crate::core::{PipelineRun, RunStatus};
use crate::errors::ConveyorError;
use parking_lot::RwLock;
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Default)]
struct StoreInner {
    active: Option<PipelineRun>,
    last: Option<PipelineRun>,
}

/// Thread-safe holder of the current and most recent [`PipelineRun`].
#[derive(Debug, Default)]
pub struct StateStore {
    inner: RwLock<StoreInner>,
}

impl StateStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a new active run.
    ///
    /// # Errors
    ///
    /// Returns an invariant violation if a non-terminal run is already
    /// active; the single-active-run rule is enforced by the orchestrator
    /// and double-checked structurally here.
    pub fn begin_run(&self, run: PipelineRun) -> Result<(), ConveyorError> {
        let mut inner = self.inner.write();
        if let Some(active) = &inner.active {
            if !active.is_terminal() {
                return Err(ConveyorError::invariant(format!(
                    "cannot begin run {}: run {} is still active",
                    run.id, active.id
                )));
            }
            inner.last = inner.active.take();
        }
        inner.active = Some(run);
        Ok(())
    }

    /// Mutates the active run under the write lock.
    ///
    /// The closure sees the run exclusively, so related fields (a stage's
    /// status and its output path, an attempt and its end time) always
    /// change atomically with respect to readers.
    ///
    /// # Errors
    ///
    /// Returns [`ConveyorError::RunNotActive`] if `run_id` is not the
    /// active run.
    pub fn update<F, R>(&self, run_id: Uuid, f: F) -> Result<R, ConveyorError>
    where
        F: FnOnce(&mut PipelineRun) -> R,
    {
        let mut inner = self.inner.write();
        match inner.active.as_mut() {
            Some(run) if run.id == run_id => Ok(f(run)),
            _ => Err(ConveyorError::RunNotActive(run_id)),
        }
    }

    /// Retires the active run into the history slot and returns its final
    /// snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`ConveyorError::RunNotActive`] if `run_id` is not the
    /// active run.
    pub fn finish_run(&self, run_id: Uuid) -> Result<PipelineRun, ConveyorError> {
        let mut inner = self.inner.write();
        match inner.active.take() {
            Some(run) if run.id == run_id => {
                let snapshot = run.clone();
                inner.last = Some(run);
                Ok(snapshot)
            }
            other => {
                inner.active = other;
                Err(ConveyorError::RunNotActive(run_id))
            }
        }
    }

    /// Returns a snapshot of the active run, or the most recent one.
    #[must_use]
    pub fn snapshot(&self) -> Option<PipelineRun> {
        let inner = self.inner.read();
        inner.active.clone().or_else(|| inner.last.clone())
    }

    /// Returns a snapshot of the active run only.
    #[must_use]
    pub fn active_snapshot(&self) -> Option<PipelineRun> {
        self.inner.read().active.clone()
    }

    /// Returns a snapshot of the most recently retired run.
    #[must_use]
    pub fn last_snapshot(&self) -> Option<PipelineRun> {
        self.inner.read().last.clone()
    }

    /// Returns the status of the current (or most recent) run.
    #[must_use]
    pub fn current_status(&self) -> Option<RunStatus> {
        let inner = self.inner.read();
        inner
            .active
            .as_ref()
            .or(inner.last.as_ref())
            .map(PipelineRun::status)
    }

    /// Returns the trained-model path once the current or most recent run
    /// has a succeeded Train stage.
    #[must_use]
    pub fn model_path(&self) -> Option<PathBuf> {
        self.snapshot()
            .and_then(|run| run.model_path().map(std::path::Path::to_path_buf))
    }

    /// Drops all state, active and historical.
    pub fn clear(&self) {
        let mut inner = self.inner.write();
        inner.active = None;
        inner.last = None;
    }
}
