//! Stage runner: executes one pipeline stage as an isolated subprocess.
//!
//! All communication with a stage is via the filesystem (input path in,
//! output artifact out) and via exit code plus captured stdout/stderr.
//! The runner never retries (retry is an orchestrator-level policy), and
//! it guarantees the subprocess is terminated and reaped when the timeout
//! fires or the run is cancelled.

use crate::cancellation::CancelToken;
use crate::config::{PipelineConfig, StageCommand};
use crate::core::{StageName, STAGE_SEQUENCE};
use crate::errors::ConveyorError;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tracing::{debug, warn};

/// Inputs for one stage attempt.
#[derive(Debug, Clone)]
pub struct StageRequest {
    /// The stage to execute.
    pub stage: StageName,
    /// The dataset or artifact the stage consumes.
    pub input_path: PathBuf,
    /// Directory the stage must write its artifact into.
    pub output_dir: PathBuf,
    /// Wall-clock budget for this attempt.
    pub timeout: Duration,
}

/// Structured result of one stage attempt.
#[derive(Debug, Clone, Serialize)]
pub struct StageOutcome {
    /// Whether the attempt produced its artifact.
    pub success: bool,
    /// The produced artifact path, present only on success.
    pub output_path: Option<PathBuf>,
    /// The process exit code, when the process ran to an exit.
    pub exit_code: Option<i32>,
    /// Whether the attempt was killed by the timeout.
    pub timed_out: bool,
    /// Captured stdout/stderr.
    pub logs: String,
    /// One-line failure summary, present only on failure.
    pub error: Option<String>,
}

impl StageOutcome {
    /// Creates a successful outcome.
    #[must_use]
    pub fn succeeded(output_path: PathBuf, exit_code: Option<i32>, logs: String) -> Self {
        Self {
            success: true,
            output_path: Some(output_path),
            exit_code,
            timed_out: false,
            logs,
            error: None,
        }
    }

    /// Creates a failed outcome.
    #[must_use]
    pub fn failed(exit_code: Option<i32>, logs: String, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output_path: None,
            exit_code,
            timed_out: false,
            logs,
            error: Some(error.into()),
        }
    }

    /// Creates a timed-out outcome.
    ///
    /// Timeout expiry is reported as an ordinary failure so the
    /// orchestrator's retry accounting treats it identically to a
    /// non-zero exit.
    #[must_use]
    pub fn from_timeout(logs: String, timeout: Duration) -> Self {
        Self {
            success: false,
            output_path: None,
            exit_code: None,
            timed_out: true,
            logs,
            error: Some(format!("timed out after {}s", timeout.as_secs_f64())),
        }
    }
}

/// Executes one named stage given explicit input/output paths.
#[async_trait]
pub trait StageRunner: Send + Sync + std::fmt::Debug {
    /// Runs one attempt of one stage.
    ///
    /// # Errors
    ///
    /// Returns an error only for infrastructure failures (the process
    /// could not be launched, the output directory is unusable) or
    /// cancellation. A stage that ran and failed is an `Ok` outcome with
    /// `success == false`.
    async fn run(
        &self,
        request: &StageRequest,
        cancel: &CancelToken,
    ) -> Result<StageOutcome, ConveyorError>;
}

/// Production [`StageRunner`] that spawns each stage as a subprocess.
#[derive(Debug, Clone, Default)]
pub struct ProcessStageRunner {
    commands: HashMap<StageName, StageCommand>,
}

impl ProcessStageRunner {
    /// Creates a runner from an explicit command table.
    #[must_use]
    pub fn new(commands: HashMap<StageName, StageCommand>) -> Self {
        Self { commands }
    }

    /// Creates a runner from the configured stage commands.
    #[must_use]
    pub fn from_config(config: &PipelineConfig) -> Self {
        let commands = STAGE_SEQUENCE
            .iter()
            .filter_map(|stage| config.command(*stage).map(|c| (*stage, c.clone())))
            .collect();
        Self { commands }
    }
}

enum WaitResult {
    Exited(std::process::ExitStatus),
    TimedOut,
    Cancelled(String),
}

#[async_trait]
impl StageRunner for ProcessStageRunner {
    async fn run(
        &self,
        request: &StageRequest,
        cancel: &CancelToken,
    ) -> Result<StageOutcome, ConveyorError> {
        let spec = self.commands.get(&request.stage).ok_or_else(|| {
            ConveyorError::launch(request.stage.as_str(), "no command configured")
        })?;

        tokio::fs::create_dir_all(&request.output_dir)
            .await
            .map_err(|e| {
                ConveyorError::launch(
                    request.stage.as_str(),
                    format!("cannot create output directory: {e}"),
                )
            })?;

        let input = request.input_path.to_string_lossy().into_owned();
        let output_dir = request.output_dir.to_string_lossy().into_owned();

        let mut command = Command::new(&spec.program);
        for arg in &spec.args {
            command.arg(substitute(arg, &input, &output_dir));
        }
        command
            .env("PIPELINE_INPUT", &input)
            .env("PIPELINE_OUTPUT_DIR", &output_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(
            stage = %request.stage,
            program = %spec.program,
            input = %input,
            "Launching stage process"
        );

        let mut child = command
            .spawn()
            .map_err(|e| ConveyorError::launch(request.stage.as_str(), e.to_string()))?;

        // Drain both pipes concurrently so a chatty stage cannot deadlock
        // against a full pipe buffer while we wait on it.
        let stdout_task = tokio::spawn(drain(child.stdout.take()));
        let stderr_task = tokio::spawn(drain(child.stderr.take()));

        let waited = tokio::select! {
            status = child.wait() => WaitResult::Exited(status.map_err(|e| {
                ConveyorError::launch(request.stage.as_str(), format!("wait failed: {e}"))
            })?),
            () = tokio::time::sleep(request.timeout) => WaitResult::TimedOut,
            () = cancel.cancelled() => WaitResult::Cancelled(
                cancel.reason().unwrap_or_else(|| "cancelled".to_string()),
            ),
        };

        if !matches!(waited, WaitResult::Exited(_)) {
            // Kill and reap so no orphan outlives the attempt.
            let _ = child.kill().await;
        }

        let stdout = stdout_task.await.unwrap_or_default();
        let stderr = stderr_task.await.unwrap_or_default();
        let logs = join_logs(&stdout, &stderr);

        match waited {
            WaitResult::Cancelled(reason) => Err(ConveyorError::Cancelled(reason)),
            WaitResult::TimedOut => {
                warn!(
                    stage = %request.stage,
                    timeout_ms = request.timeout.as_millis() as u64,
                    "Stage timed out; process killed"
                );
                Ok(StageOutcome::from_timeout(logs, request.timeout))
            }
            WaitResult::Exited(status) => {
                if status.success() {
                    let artifact = request.output_dir.join(&spec.output_file);
                    if tokio::fs::try_exists(&artifact).await.unwrap_or(false) {
                        Ok(StageOutcome::succeeded(artifact, status.code(), logs))
                    } else {
                        Ok(StageOutcome::failed(
                            status.code(),
                            logs,
                            format!(
                                "stage exited successfully but did not produce '{}'",
                                spec.output_file
                            ),
                        ))
                    }
                } else {
                    let error = summarize_failure(status.code(), &stderr);
                    Ok(StageOutcome::failed(status.code(), logs, error))
                }
            }
        }
    }
}

fn substitute(arg: &str, input: &str, output_dir: &str) -> String {
    arg.replace("{input}", input).replace("{output_dir}", output_dir)
}

async fn drain<R: AsyncRead + Unpin>(reader: Option<R>) -> String {
    let Some(mut reader) = reader else {
        return String::new();
    };
    let mut buf = Vec::new();
    let _ = reader.read_to_end(&mut buf).await;
    String::from_utf8_lossy(&buf).into_owned()
}

fn join_logs(stdout: &str, stderr: &str) -> String {
    match (stdout.is_empty(), stderr.is_empty()) {
        (true, true) => String::new(),
        (false, true) => stdout.to_string(),
        (true, false) => stderr.to_string(),
        (false, false) => format!("{stdout}\n{stderr}"),
    }
}

/// One-line failure summary from an exit status and captured stderr.
///
/// The full capture stays in `logs`; only this line travels to the status
/// feed.
fn summarize_failure(exit_code: Option<i32>, stderr: &str) -> String {
    let last_line = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(|l| truncate(l, 200));

    match (last_line, exit_code) {
        (Some(line), Some(code)) => format!("exit {code}: {line}"),
        (Some(line), None) => format!("terminated by signal: {line}"),
        (None, Some(code)) => format!("exited with code {code}"),
        (None, None) => "terminated by signal".to_string(),
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        s.to_string()
    } else {
        let mut end = max;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}…", &s[..end])
    }
}
