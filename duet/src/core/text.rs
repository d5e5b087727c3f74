//! Bounded text helpers used before storing or re-injecting captured output.

use std::time::Duration;

/// Budget for a single attempt's error text.
pub const ATTEMPT_ERROR_CHARS: usize = 1200;
/// Default budget for error text stored in state or shown to humans.
pub const MAX_ERROR_CHARS: usize = 1800;
/// Budget for the test command snapshot.
pub const TEST_OUTPUT_CHARS: usize = 7000;

const TRUNCATED_SUFFIX: &str = " ...[truncated]";
const TRUNCATED_HISTORY: &str = "...[earlier history truncated]";

/// Trim `text` and cut it to at most `limit` characters, marking the cut.
pub fn shorten(text: &str, limit: usize) -> String {
    let raw = text.trim();
    if raw.chars().count() <= limit {
        return raw.to_string();
    }
    let head: String = raw.chars().take(limit).collect();
    format!("{head}{TRUNCATED_SUFFIX}")
}

/// Keep the most recent `limit` characters of a transcript.
pub fn truncate_shared(text: &str, limit: usize) -> String {
    let count = text.chars().count();
    if count <= limit {
        return text.to_string();
    }
    let tail: String = text.chars().skip(count - limit).collect();
    format!("{TRUNCATED_HISTORY}\n\n{tail}")
}

/// Render a duration as `1h 02m 03s`, `2m 03s` or `3s`.
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m {seconds:02}s")
    } else if minutes > 0 {
        format!("{minutes}m {seconds:02}s")
    } else {
        format!("{seconds}s")
    }
}

/// Return the last `n` items of `items`.
pub fn tail<T>(items: &[T], n: usize) -> &[T] {
    &items[items.len().saturating_sub(n)..]
}
