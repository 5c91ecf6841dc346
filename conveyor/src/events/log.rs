//! Inspectable run log.
//!
//! Every orchestrator transition appends here before control returns to
//! the event loop. The dashboard reads the buffer for its log panel; the
//! same lines also go through `tracing` for operators.

use crate::utils::{now_utc, Timestamp};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Default maximum number of retained entries.
pub const DEFAULT_LOG_CAPACITY: usize = 1000;

/// Severity of a log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    /// Routine progress information.
    Info,
    /// Something unusual that did not fail the run.
    Warning,
    /// A failure, of an attempt or of the run.
    Error,
}

/// One run log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// When the line was appended.
    pub timestamp: Timestamp,
    /// Entry severity.
    pub level: LogLevel,
    /// Human-readable message.
    pub message: String,
}

/// A bounded, thread-safe log buffer.
///
/// When the buffer is full the oldest entries are discarded.
#[derive(Debug)]
pub struct RunLog {
    entries: RwLock<Vec<LogEntry>>,
    capacity: usize,
}

impl Default for RunLog {
    fn default() -> Self {
        Self::new(DEFAULT_LOG_CAPACITY)
    }
}

impl RunLog {
    /// Creates a log buffer retaining at most `capacity` entries.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            capacity: capacity.max(1),
        }
    }

    /// Appends an entry, discarding the oldest if the buffer is full.
    pub fn append(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Info => tracing::info!("{message}"),
            LogLevel::Warning => tracing::warn!("{message}"),
            LogLevel::Error => tracing::error!("{message}"),
        }

        let mut entries = self.entries.write();
        if entries.len() >= self.capacity {
            let excess = entries.len() + 1 - self.capacity;
            entries.drain(..excess);
        }
        entries.push(LogEntry {
            timestamp: now_utc(),
            level,
            message,
        });
    }

    /// Appends an info entry.
    pub fn info(&self, message: impl Into<String>) {
        self.append(LogLevel::Info, message);
    }

    /// Appends a warning entry.
    pub fn warn(&self, message: impl Into<String>) {
        self.append(LogLevel::Warning, message);
    }

    /// Appends an error entry.
    pub fn error(&self, message: impl Into<String>) {
        self.append(LogLevel::Error, message);
    }

    /// Returns a point-in-time copy of all retained entries.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.read().clone()
    }

    /// Returns the number of retained entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Clears all entries.
    pub fn clear(&self) {
        self.entries.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_and_snapshot() {
        let log = RunLog::new(10);
        log.info("pipeline started");
        log.error("convert failed");

        let entries = log.snapshot();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].level, LogLevel::Info);
        assert_eq!(entries[1].level, LogLevel::Error);
        assert_eq!(entries[1].message, "convert failed");
    }

    #[test]
    fn test_capacity_discards_oldest() {
        let log = RunLog::new(3);
        for i in 0..5 {
            log.info(format!("entry {i}"));
        }

        let entries = log.snapshot();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].message, "entry 2");
        assert_eq!(entries[2].message, "entry 4");
    }

    #[test]
    fn test_clear() {
        let log = RunLog::default();
        log.info("something");
        assert!(!log.is_empty());

        log.clear();
        assert!(log.is_empty());
        assert_eq!(log.len(), 0);
    }

    #[test]
    fn test_entry_serialization() {
        let log = RunLog::new(4);
        log.warn("disk nearly full");

        let entries = log.snapshot();
        let json = serde_json::to_value(&entries[0]).unwrap();
        assert_eq!(json["level"], "warning");
        assert_eq!(json["message"], "disk nearly full");
    }
}
