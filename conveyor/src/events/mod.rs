//! Event sinks, the broadcast status feed, and the run log.

mod feed;
mod log;
mod sink;

pub use feed::{StatusFeed, DEFAULT_FEED_CAPACITY};
pub use log::{LogEntry, LogLevel, RunLog, DEFAULT_LOG_CAPACITY};
pub use sink::{CollectingEventSink, EventSink, FanOutEventSink, LoggingEventSink, NoOpEventSink};
