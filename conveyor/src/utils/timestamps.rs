//! Timestamp helpers shared across runs, attempts, and events.

use chrono::{DateTime, Utc};

/// UTC timestamp recorded on runs, attempts, and events.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC timestamp.
#[must_use]
pub fn now_utc() -> Timestamp {
    Utc::now()
}

/// Returns the current UTC time as an ISO 8601 formatted string.
#[must_use]
pub fn iso_timestamp() -> String {
    format_iso8601(&Utc::now())
}

/// Formats a timestamp as an ISO 8601 string with microsecond precision.
///
/// The format is `YYYY-MM-DDTHH:MM:SS.ffffff+00:00`.
#[must_use]
pub fn format_iso8601(ts: &Timestamp) -> String {
    ts.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}
