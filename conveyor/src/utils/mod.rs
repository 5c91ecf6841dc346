//! Shared utilities.

mod hash;
mod timestamps;

pub use hash::{sha256_file, sha256_hex};
pub use timestamps::{format_iso8601, iso_timestamp, now_utc, Timestamp};
