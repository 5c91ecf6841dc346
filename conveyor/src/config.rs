//! Externally-supplied configuration.
//!
//! Everything the state machine parameterizes on lives here: the watched
//! directory and accepted extensions, per-stage commands and timeouts, the
//! retry policy, and channel capacities. Nothing in the orchestrator logic
//! is hard-coded to particular values.

use crate::core::{StageName, STAGE_SEQUENCE};
use crate::errors::ConveyorError;
use crate::orchestrator::RetryPolicy;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Default per-stage timeout.
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(300);

/// Default watcher poll interval.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// How one stage is invoked as a subprocess.
///
/// `{input}` and `{output_dir}` placeholders in `args` are substituted at
/// dispatch; the same paths are also exported as `PIPELINE_INPUT` and
/// `PIPELINE_OUTPUT_DIR` so stage images can ignore argv entirely.
#[derive(Debug, Clone)]
pub struct StageCommand {
    /// The program to execute.
    pub program: String,
    /// Arguments, possibly containing placeholders.
    pub args: Vec<String>,
    /// File name the stage is expected to produce under its output
    /// directory. Exit 0 without this artifact is a failure.
    pub output_file: String,
    /// Wall-clock budget for one attempt.
    pub timeout: Duration,
}

impl StageCommand {
    /// Creates a command with no arguments and the default timeout.
    #[must_use]
    pub fn new(program: impl Into<String>, output_file: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            output_file: output_file.into(),
            timeout: DEFAULT_STAGE_TIMEOUT,
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    #[must_use]
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Sets the per-attempt timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// The full orchestrator configuration surface.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Directory the watcher polls for new datasets.
    pub watch_dir: PathBuf,
    /// Root under which per-run, per-stage output directories are created.
    pub data_root: PathBuf,
    /// Accepted dataset extensions, lowercase, without the dot.
    pub accepted_extensions: Vec<String>,
    /// Watcher poll interval.
    pub poll_interval: Duration,
    /// Per-stage retry policy.
    pub retry: RetryPolicy,
    /// Status feed channel capacity.
    pub feed_capacity: usize,
    commands: HashMap<StageName, StageCommand>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::new("data/raw", "data")
    }
}

impl PipelineConfig {
    /// Creates a configuration with defaults for everything except paths.
    #[must_use]
    pub fn new(watch_dir: impl Into<PathBuf>, data_root: impl Into<PathBuf>) -> Self {
        Self {
            watch_dir: watch_dir.into(),
            data_root: data_root.into(),
            accepted_extensions: vec!["csv".to_string(), "xlsx".to_string()],
            poll_interval: DEFAULT_POLL_INTERVAL,
            retry: RetryPolicy::default(),
            feed_capacity: crate::events::DEFAULT_FEED_CAPACITY,
            commands: HashMap::new(),
        }
    }

    /// Replaces the accepted extensions. Stored lowercase, dots stripped.
    #[must_use]
    pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.accepted_extensions = extensions
            .into_iter()
            .map(|e| e.into().trim_start_matches('.').to_lowercase())
            .collect();
        self
    }

    /// Sets the watcher poll interval.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sets the status feed capacity.
    #[must_use]
    pub fn with_feed_capacity(mut self, capacity: usize) -> Self {
        self.feed_capacity = capacity;
        self
    }

    /// Sets the command for one stage.
    #[must_use]
    pub fn with_command(mut self, stage: StageName, command: StageCommand) -> Self {
        self.commands.insert(stage, command);
        self
    }

    /// Returns the command configured for a stage, if any.
    #[must_use]
    pub fn command(&self, stage: StageName) -> Option<&StageCommand> {
        self.commands.get(&stage)
    }

    /// Returns the timeout for a stage, falling back to the default.
    #[must_use]
    pub fn stage_timeout(&self, stage: StageName) -> Duration {
        self.commands
            .get(&stage)
            .map_or(DEFAULT_STAGE_TIMEOUT, |c| c.timeout)
    }

    /// Returns true if the path's extension is accepted.
    #[must_use]
    pub fn accepts(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| {
                let ext = ext.to_lowercase();
                self.accepted_extensions.iter().any(|a| a == &ext)
            })
    }

    /// Returns the directory owned by one run.
    #[must_use]
    pub fn run_dir(&self, run_id: Uuid) -> PathBuf {
        self.data_root.join(format!("run-{run_id}"))
    }

    /// Returns the output directory owned by one stage of one run.
    ///
    /// Per-run, per-stage subdirectories keep concurrent and historical
    /// runs from colliding on the filesystem.
    #[must_use]
    pub fn stage_output_dir(&self, run_id: Uuid, stage: StageName) -> PathBuf {
        self.run_dir(run_id).join(stage.as_str())
    }

    /// Checks the configuration for structural problems.
    ///
    /// # Errors
    ///
    /// Returns `ConveyorError::Config` when a stage has no command, no
    /// extensions are accepted, or the retry policy is degenerate.
    pub fn validate(&self) -> Result<(), ConveyorError> {
        if self.accepted_extensions.is_empty() {
            return Err(ConveyorError::Config(
                "no accepted extensions configured".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConveyorError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 {
            return Err(ConveyorError::Config(
                "retry.multiplier must be >= 1.0".to_string(),
            ));
        }
        for stage in STAGE_SEQUENCE {
            if !self.commands.contains_key(&stage) {
                return Err(ConveyorError::Config(format!(
                    "no command configured for stage '{stage}'"
                )));
            }
        }
        Ok(())
    }
}
