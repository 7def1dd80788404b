//! Wall-clock helpers.

use chrono::{DateTime, Utc};

/// Convert epoch milliseconds into a UTC timestamp, clamping out-of-range values to the epoch.
pub fn from_epoch_ms(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Truncate `input` to at most `max_chars` characters, appending `...` when cut.
///
/// Used when logging raw job sources so a malformed document cannot flood the log.
pub fn clean_truncate(input: &str, max_chars: usize) -> String {
    match input.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}...", &input[..idx]),
        None => input.to_string(),
    }
}
