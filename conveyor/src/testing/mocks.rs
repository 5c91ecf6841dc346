//! Test doubles for the stage runner seam.

use crate::cancellation::CancelToken;
use crate::core::StageName;
use crate::errors::ConveyorError;
use crate::runner::{StageOutcome, StageRequest, StageRunner};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// One scripted result for a stage attempt.
#[derive(Debug, Clone)]
pub enum ScriptedResult {
    /// Succeed, fabricating an artifact path under the request's output
    /// directory (no filesystem access).
    Succeed,
    /// Report success without an artifact path, to probe the
    /// orchestrator's consistency handling.
    SucceedWithoutArtifact,
    /// Fail with an exit code and message.
    Fail {
        /// Reported exit code.
        exit_code: i32,
        /// Reported error message.
        message: String,
    },
    /// Fail as a timeout.
    TimeOut,
    /// Fail to launch (infrastructure failure).
    Launch(String),
    /// Block until the run is cancelled.
    Hang,
}

impl ScriptedResult {
    /// Shorthand for a failure with the given message and exit code 1.
    #[must_use]
    pub fn fail(message: impl Into<String>) -> Self {
        Self::Fail {
            exit_code: 1,
            message: message.into(),
        }
    }
}

/// A [`StageRunner`] driven by per-stage scripts of results.
///
/// Each invocation pops the next scripted result for its stage; stages
/// with no remaining script entries succeed. Requests are recorded so
/// tests can assert on dispatch order and input chaining.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    scripts: Mutex<HashMap<StageName, VecDeque<ScriptedResult>>>,
    requests: Mutex<Vec<StageRequest>>,
    delay: Option<Duration>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedRunner {
    /// Creates a runner where every stage succeeds immediately.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the results for one stage, consumed in order.
    #[must_use]
    pub fn script<I>(self, stage: StageName, results: I) -> Self
    where
        I: IntoIterator<Item = ScriptedResult>,
    {
        self.scripts
            .lock()
            .entry(stage)
            .or_default()
            .extend(results);
        self
    }

    /// Makes every attempt take at least this long.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Returns all recorded requests, in dispatch order.
    #[must_use]
    pub fn requests(&self) -> Vec<StageRequest> {
        self.requests.lock().clone()
    }

    /// Returns recorded requests for one stage.
    #[must_use]
    pub fn requests_for(&self, stage: StageName) -> Vec<StageRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.stage == stage)
            .cloned()
            .collect()
    }

    /// Returns the maximum number of attempts that ran concurrently.
    #[must_use]
    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// Returns the artifact path fabricated for a request.
    #[must_use]
    pub fn artifact_for(request: &StageRequest) -> std::path::PathBuf {
        request
            .output_dir
            .join(format!("{}.out", request.stage))
    }
}

#[async_trait]
impl StageRunner for ScriptedRunner {
    async fn run(
        &self,
        request: &StageRequest,
        cancel: &CancelToken,
    ) -> Result<StageOutcome, ConveyorError> {
        self.requests.lock().push(request.clone());
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);

        let scripted = self
            .scripts
            .lock()
            .get_mut(&request.stage)
            .and_then(VecDeque::pop_front)
            .unwrap_or(ScriptedResult::Succeed);

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let result = match scripted {
            ScriptedResult::Succeed => Ok(StageOutcome::succeeded(
                Self::artifact_for(request),
                Some(0),
                String::new(),
            )),
            ScriptedResult::SucceedWithoutArtifact => Ok(StageOutcome {
                success: true,
                output_path: None,
                exit_code: Some(0),
                timed_out: false,
                logs: String::new(),
                error: None,
            }),
            ScriptedResult::Fail { exit_code, message } => {
                Ok(StageOutcome::failed(Some(exit_code), String::new(), message))
            }
            ScriptedResult::TimeOut => {
                Ok(StageOutcome::from_timeout(String::new(), request.timeout))
            }
            ScriptedResult::Launch(reason) => {
                Err(ConveyorError::launch(request.stage.as_str(), reason))
            }
            ScriptedResult::Hang => {
                cancel.cancelled().await;
                Err(ConveyorError::Cancelled(
                    cancel.reason().unwrap_or_default(),
                ))
            }
        };

        self.active.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
