//! Subscribable status feed for external dashboards.

use super::EventSink;
use crate::core::PipelineEvent;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// Default capacity of the broadcast channel behind the feed.
pub const DEFAULT_FEED_CAPACITY: usize = 256;

/// A broadcast status feed.
///
/// The orchestrator publishes into the feed through the [`EventSink`]
/// impl; any number of dashboard tasks subscribe and receive every
/// subsequent event. Slow subscribers that fall more than the channel
/// capacity behind observe a `Lagged` error and can resynchronize from a
/// state store snapshot.
#[derive(Debug, Clone)]
pub struct StatusFeed {
    tx: broadcast::Sender<PipelineEvent>,
}

impl Default for StatusFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl StatusFeed {
    /// Creates a feed with the given channel capacity.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribes to the feed from this point on.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.tx.subscribe()
    }

    /// Returns the number of live subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    fn publish(&self, event: &PipelineEvent) {
        // A send error just means nobody is listening right now.
        let _ = self.tx.send(event.clone());
    }
}

#[async_trait]
impl EventSink for StatusFeed {
    async fn emit(&self, event: &PipelineEvent) {
        self.publish(event);
    }

    fn try_emit(&self, event: &PipelineEvent) {
        self.publish(event);
    }
}
