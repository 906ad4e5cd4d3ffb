//! Clock helpers shared by the server and the agents.

use chrono::{NaiveDateTime, Utc};

/// Current time as Unix milliseconds.
///
/// Sync bookkeeping uses millisecond resolution so that a code edited in the
/// same second as a sync is still seen as newer.
pub fn unix_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// Current local wall-clock time, the form door controllers keep.
pub fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Format a door timestamp the way controllers report them.
pub fn format_door_ts(ts: &NaiveDateTime) -> String {
    ts.format(DOOR_TS_FORMAT).to_string()
}

/// Controller timestamp format (`2024-01-31T18:04:05`).
pub const DOOR_TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";
