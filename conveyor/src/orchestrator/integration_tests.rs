//! End-to-end orchestrator tests against a scripted stage runner.

use super::*;
use crate::events::CollectingEventSink;
use crate::testing::{fast_config, ScriptedResult, ScriptedRunner};
use std::time::Duration;

struct Harness {
    handle: OrchestratorHandle,
    triggers: mpsc::Sender<DatasetArrived>,
    store: Arc<StateStore>,
    sink: Arc<CollectingEventSink>,
    log: Arc<RunLog>,
    runner: Arc<ScriptedRunner>,
    task: tokio::task::JoinHandle<()>,
}

impl Harness {
    fn start(runner: ScriptedRunner) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();

        let config = fast_config(Path::new("/tmp/conveyor-orchestrator-tests"));
        let runner = Arc::new(runner);
        let store = Arc::new(StateStore::new());
        let sink = Arc::new(CollectingEventSink::new());
        let log = Arc::new(RunLog::default());

        let orchestrator = Orchestrator::new(config, Arc::clone(&runner) as Arc<dyn StageRunner>)
            .with_store(Arc::clone(&store))
            .with_sink(Arc::clone(&sink) as Arc<dyn EventSink>)
            .with_log(Arc::clone(&log));
        let handle = orchestrator.handle();
        let triggers = orchestrator.trigger_sender();
        let task = tokio::spawn(orchestrator.run());

        Self {
            handle,
            triggers,
            store,
            sink,
            log,
            runner,
            task,
        }
    }

    async fn wait_until<F>(&self, predicate: F) -> PipelineRun
    where
        F: Fn(&PipelineRun) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                if let Some(run) = self.store.snapshot() {
                    if predicate(&run) {
                        return run;
                    }
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time")
    }

    async fn wait_terminal(&self) -> PipelineRun {
        self.wait_until(PipelineRun::is_terminal).await
    }
}

async fn wait_for<F>(predicate: F)
where
    F: Fn() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn test_full_success_run() {
    let harness = Harness::start(ScriptedRunner::new());

    harness.handle.trigger("/datasets/sales_jan.csv").await.unwrap();
    let run = harness.wait_terminal().await;

    assert_eq!(run.status(), RunStatus::Succeeded);
    assert_eq!(run.total_attempts(), 4);
    assert!(run.completed_at().is_some());
    for stage in crate::core::STAGE_SEQUENCE {
        let record = run.stage(stage);
        assert_eq!(record.status(), StageStatus::Succeeded);
        assert!(record.output_path().is_some());
        assert_eq!(record.attempt_count(), 1);
    }

    assert_eq!(harness.sink.events_of_kind("run.started").len(), 1);
    assert_eq!(harness.sink.events_of_kind("run.completed").len(), 1);
    assert_eq!(harness.sink.events_of_kind("model.ready").len(), 1);
    // Running + Succeeded per stage.
    assert_eq!(harness.sink.events_of_kind("stage.update").len(), 8);
}

#[tokio::test]
async fn test_watcher_channel_triggers_run() {
    let harness = Harness::start(ScriptedRunner::new());

    // The watcher side of the inbox behaves exactly like a manual
    // trigger.
    harness
        .triggers
        .send(DatasetArrived::new("/datasets/watched.csv"))
        .await
        .unwrap();

    let run = harness.wait_terminal().await;
    assert_eq!(run.status(), RunStatus::Succeeded);
    assert_eq!(run.input_path, Path::new("/datasets/watched.csv"));
}

#[tokio::test]
async fn test_stage_outputs_chain_into_next_inputs() {
    let harness = Harness::start(ScriptedRunner::new());

    harness.handle.trigger("/datasets/sales_jan.csv").await.unwrap();
    harness.wait_terminal().await;

    let requests = harness.runner.requests();
    assert_eq!(requests.len(), 4);
    assert_eq!(
        requests[0].input_path,
        PathBuf::from("/datasets/sales_jan.csv")
    );
    for window in requests.windows(2) {
        // Each stage consumes exactly the artifact its predecessor
        // produced.
        assert_eq!(
            window[1].input_path,
            ScriptedRunner::artifact_for(&window[0])
        );
    }
    assert!(requests[1].output_dir.ends_with("clean"));
    assert!(requests[3].output_dir.ends_with("infer_ready"));
}

#[tokio::test]
async fn test_clean_fails_twice_then_succeeds() {
    // The sales_jan scenario: Convert 1 attempt, Clean 3, Train 1,
    // Infer-Ready 1.
    let runner = ScriptedRunner::new().script(
        StageName::Clean,
        [
            ScriptedResult::fail("rows rejected"),
            ScriptedResult::fail("rows rejected again"),
        ],
    );
    let harness = Harness::start(runner);

    harness.handle.trigger("/datasets/sales_jan.csv").await.unwrap();
    let run = harness.wait_terminal().await;

    assert_eq!(run.status(), RunStatus::Succeeded);
    assert_eq!(run.stage(StageName::Convert).attempt_count(), 1);
    assert_eq!(run.stage(StageName::Clean).attempt_count(), 3);
    assert_eq!(run.stage(StageName::Train).attempt_count(), 1);
    assert_eq!(run.stage(StageName::InferReady).attempt_count(), 1);
    assert_eq!(run.total_attempts(), 6);

    let clean = run.stage(StageName::Clean);
    assert_eq!(clean.status(), StageStatus::Succeeded);
    assert!(clean.attempts()[0].error_message.is_some());
    assert!(clean.attempts()[1].error_message.is_some());
    assert!(clean.attempts()[2].error_message.is_none());
}

#[tokio::test]
async fn test_convert_exhausts_retries_and_fails_run() {
    // The bad.csv scenario: Convert burns all attempts, later stages are
    // never tried.
    let runner = ScriptedRunner::new().script(
        StageName::Convert,
        [
            ScriptedResult::fail("unreadable header"),
            ScriptedResult::fail("unreadable header"),
            ScriptedResult::fail("unreadable header"),
        ],
    );
    let harness = Harness::start(runner);

    harness.handle.trigger("/datasets/bad.csv").await.unwrap();
    let run = harness.wait_terminal().await;

    assert_eq!(run.status(), RunStatus::Failed);
    let convert = run.stage(StageName::Convert);
    assert_eq!(convert.status(), StageStatus::Failed);
    assert_eq!(convert.attempt_count(), 3);
    assert!(convert.output_path().is_none());

    for stage in [StageName::Clean, StageName::Train, StageName::InferReady] {
        assert_eq!(run.stage(stage).status(), StageStatus::Pending);
        assert_eq!(run.stage(stage).attempt_count(), 0);
        assert!(harness.runner.requests_for(stage).is_empty());
    }

    assert_eq!(run.last_error(), Some("unreadable header".to_string()));
    assert!(harness.sink.events_of_kind("model.ready").is_empty());

    let completed = harness.sink.events_of_kind("run.completed");
    assert_eq!(completed.len(), 1);
    match &completed[0] {
        PipelineEvent::RunCompleted {
            status,
            error_message,
            ..
        } => {
            assert_eq!(*status, RunStatus::Failed);
            assert_eq!(error_message.as_deref(), Some("unreadable header"));
        }
        other => panic!("unexpected event: {other:?}"),
    }
}

#[tokio::test]
async fn test_timeout_counts_as_failed_attempt() {
    let runner = ScriptedRunner::new().script(StageName::Convert, [ScriptedResult::TimeOut]);
    let harness = Harness::start(runner);

    harness.handle.trigger("/datasets/slow.csv").await.unwrap();
    let run = harness.wait_terminal().await;

    assert_eq!(run.status(), RunStatus::Succeeded);
    let convert = run.stage(StageName::Convert);
    assert_eq!(convert.attempt_count(), 2);
    let first = &convert.attempts()[0];
    assert!(first.error_message.as_deref().unwrap().contains("timed out"));
    assert!(first.exit_code.is_none());
}

#[tokio::test]
async fn test_infrastructure_failure_consumes_a_retry() {
    let runner = ScriptedRunner::new().script(
        StageName::Train,
        [ScriptedResult::Launch("image missing".to_string())],
    );
    let harness = Harness::start(runner);

    harness.handle.trigger("/datasets/sales.csv").await.unwrap();
    let run = harness.wait_terminal().await;

    assert_eq!(run.status(), RunStatus::Succeeded);
    let train = run.stage(StageName::Train);
    assert_eq!(train.attempt_count(), 2);
    assert!(train.attempts()[0]
        .error_message
        .as_deref()
        .unwrap()
        .contains("Failed to launch"));
}

#[tokio::test]
async fn test_second_trigger_waits_for_first_run() {
    let runner = ScriptedRunner::new().with_delay(Duration::from_millis(20));
    let harness = Harness::start(runner);

    harness.handle.trigger("/datasets/first.csv").await.unwrap();
    harness.handle.trigger("/datasets/second.csv").await.unwrap();

    let second = harness
        .wait_until(|r| r.is_terminal() && r.input_path == Path::new("/datasets/second.csv"))
        .await;
    assert_eq!(second.status(), RunStatus::Succeeded);

    // The second trigger was queued, not interleaved.
    assert_eq!(harness.sink.events_of_kind("trigger.queued").len(), 1);
    assert_eq!(harness.runner.max_concurrency(), 1);

    // The second run started only after the first completed.
    let events = harness.sink.events();
    let first_completed = events
        .iter()
        .position(|e| e.kind() == "run.completed")
        .unwrap();
    let second_started = events
        .iter()
        .enumerate()
        .filter(|(_, e)| e.kind() == "run.started")
        .map(|(i, _)| i)
        .nth(1)
        .unwrap();
    assert!(first_completed < second_started);

    assert_eq!(harness.sink.events_of_kind("run.completed").len(), 2);
}

#[tokio::test]
async fn test_cancel_fails_active_run_and_accepts_new_trigger() {
    let runner = ScriptedRunner::new().script(StageName::Clean, [ScriptedResult::Hang]);
    let harness = Harness::start(runner);

    harness.handle.trigger("/datasets/first.csv").await.unwrap();
    {
        let runner = Arc::clone(&harness.runner);
        wait_for(move || runner.requests_for(StageName::Clean).len() == 1).await;
    }

    harness.handle.cancel("operator abort").await.unwrap();
    let run = harness.wait_terminal().await;

    assert_eq!(run.status(), RunStatus::Failed);
    let clean = run.stage(StageName::Clean);
    assert_eq!(clean.status(), StageStatus::Failed);
    assert!(clean
        .last_error()
        .unwrap()
        .contains("cancelled: operator abort"));

    // A failed run leaves the system ready for the next trigger.
    harness.handle.trigger("/datasets/second.csv").await.unwrap();
    let second = harness
        .wait_until(|r| r.is_terminal() && r.input_path == Path::new("/datasets/second.csv"))
        .await;
    assert_eq!(second.status(), RunStatus::Succeeded);
}

#[tokio::test]
async fn test_success_without_artifact_is_a_consistency_failure() {
    let runner =
        ScriptedRunner::new().script(StageName::Convert, [ScriptedResult::SucceedWithoutArtifact]);
    let harness = Harness::start(runner);

    harness.handle.trigger("/datasets/odd.csv").await.unwrap();
    let run = harness.wait_terminal().await;

    assert_eq!(run.status(), RunStatus::Failed);
    // Not booked as an ordinary retryable failure.
    assert_eq!(run.stage(StageName::Convert).attempt_count(), 1);
    assert!(harness.runner.requests_for(StageName::Clean).is_empty());
    assert!(harness
        .log
        .snapshot()
        .iter()
        .any(|e| e.message.contains("Internal consistency error")));
}

#[tokio::test]
async fn test_model_ready_survives_infer_ready_failure() {
    let runner = ScriptedRunner::new().script(
        StageName::InferReady,
        [
            ScriptedResult::fail("packaging error"),
            ScriptedResult::fail("packaging error"),
            ScriptedResult::fail("packaging error"),
        ],
    );
    let harness = Harness::start(runner);

    harness.handle.trigger("/datasets/sales.csv").await.unwrap();
    let run = harness.wait_terminal().await;

    assert_eq!(run.status(), RunStatus::Failed);
    // Train still succeeded, so the model artifact is available.
    assert_eq!(harness.sink.events_of_kind("model.ready").len(), 1);
    assert!(harness.store.model_path().is_some());
}

#[tokio::test]
async fn test_clear_resets_all_state() {
    let harness = Harness::start(ScriptedRunner::new());

    harness.handle.trigger("/datasets/sales.csv").await.unwrap();
    harness.wait_terminal().await;

    harness.handle.clear().await.unwrap();
    {
        let store = Arc::clone(&harness.store);
        wait_for(move || store.snapshot().is_none()).await;
    }

    let entries = harness.log.snapshot();
    assert_eq!(entries.last().unwrap().message, "Pipeline state cleared");
}

#[tokio::test]
async fn test_shutdown_stops_the_loop() {
    let harness = Harness::start(ScriptedRunner::new());

    harness.handle.shutdown().await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), harness.task)
        .await
        .expect("loop did not stop")
        .unwrap();

    let result = harness.handle.trigger("/datasets/late.csv").await;
    assert!(matches!(result, Err(ConveyorError::ChannelClosed)));
}
