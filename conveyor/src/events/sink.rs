//! Event sink trait and implementations.

use crate::core::PipelineEvent;
use async_trait::async_trait;
use tracing::info;

/// Trait for sinks that receive pipeline status events.
///
/// The orchestrator publishes every run and stage transition through its
/// sink before continuing the control loop.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Emits an event asynchronously.
    async fn emit(&self, event: &PipelineEvent);

    /// Emits an event without awaiting.
    ///
    /// Must never panic; delivery problems are logged and suppressed.
    fn try_emit(&self, event: &PipelineEvent);
}

/// A no-op sink that discards all events.
///
/// Used as the default when no dashboard is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpEventSink;

#[async_trait]
impl EventSink for NoOpEventSink {
    async fn emit(&self, _event: &PipelineEvent) {
        // Intentionally empty - discards all events
    }

    fn try_emit(&self, _event: &PipelineEvent) {
        // Intentionally empty - discards all events
    }
}

/// A sink that logs events through the tracing framework.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingEventSink;

impl LoggingEventSink {
    fn log_event(event: &PipelineEvent) {
        info!(
            event_kind = %event.kind(),
            event = ?event,
            "Pipeline event: {}",
            event.kind()
        );
    }
}

#[async_trait]
impl EventSink for LoggingEventSink {
    async fn emit(&self, event: &PipelineEvent) {
        Self::log_event(event);
    }

    fn try_emit(&self, event: &PipelineEvent) {
        Self::log_event(event);
    }
}

/// A collecting sink for tests.
#[derive(Debug, Default)]
pub struct CollectingEventSink {
    events: parking_lot::RwLock<Vec<PipelineEvent>>,
}

impl CollectingEventSink {
    /// Creates a new collecting sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns all collected events.
    #[must_use]
    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.read().clone()
    }

    /// Returns the number of collected events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    /// Returns true if no events have been collected.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    /// Returns events whose kind matches the given prefix.
    #[must_use]
    pub fn events_of_kind(&self, kind_prefix: &str) -> Vec<PipelineEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.kind().starts_with(kind_prefix))
            .cloned()
            .collect()
    }

    /// Clears all collected events.
    pub fn clear(&self) {
        self.events.write().clear();
    }
}

#[async_trait]
impl EventSink for CollectingEventSink {
    async fn emit(&self, event: &PipelineEvent) {
        self.events.write().push(event.clone());
    }

    fn try_emit(&self, event: &PipelineEvent) {
        self.events.write().push(event.clone());
    }
}

/// A sink that fans out to several downstream sinks in order.
#[derive(Default)]
pub struct FanOutEventSink {
    sinks: Vec<std::sync::Arc<dyn EventSink>>,
}

impl FanOutEventSink {
    /// Creates an empty fan-out sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a downstream sink.
    #[must_use]
    pub fn with_sink(mut self, sink: std::sync::Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

impl std::fmt::Debug for FanOutEventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanOutEventSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

#[async_trait]
impl EventSink for FanOutEventSink {
    async fn emit(&self, event: &PipelineEvent) {
        for sink in &self.sinks {
            sink.emit(event).await;
        }
    }

    fn try_emit(&self, event: &PipelineEvent) {
        for sink in &self.sinks {
            sink.try_emit(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{RunStatus, StageName, StageStatus};
    use std::sync::Arc;
    use uuid::Uuid;

    fn sample_event() -> PipelineEvent {
        PipelineEvent::stage_update(
            Uuid::new_v4(),
            StageName::Convert,
            StageStatus::Running,
            1,
            None,
        )
    }

    #[tokio::test]
    async fn test_noop_sink() {
        let sink = NoOpEventSink;
        sink.emit(&sample_event()).await;
        sink.try_emit(&sample_event());
        // Should not panic
    }

    #[tokio::test]
    async fn test_collecting_sink() {
        let sink = CollectingEventSink::new();
        assert!(sink.is_empty());

        sink.emit(&sample_event()).await;
        sink.try_emit(&PipelineEvent::run_completed(
            Uuid::new_v4(),
            RunStatus::Succeeded,
            None,
        ));

        assert_eq!(sink.len(), 2);
        assert_eq!(sink.events_of_kind("stage.").len(), 1);
        assert_eq!(sink.events_of_kind("run.").len(), 1);

        sink.clear();
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_fan_out_sink_reaches_all() {
        let a = Arc::new(CollectingEventSink::new());
        let b = Arc::new(CollectingEventSink::new());
        let fan = FanOutEventSink::new()
            .with_sink(a.clone() as Arc<dyn EventSink>)
            .with_sink(b.clone() as Arc<dyn EventSink>);

        fan.emit(&sample_event()).await;

        assert_eq!(a.len(), 1);
        assert_eq!(b.len(), 1);
    }
}
