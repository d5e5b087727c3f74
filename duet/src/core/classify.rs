//! Deterministic classification of agent failures and retry pacing.

use std::time::Duration;

/// Case-insensitive markers that identify quota or rate-limit failures.
const QUOTA_MARKERS: &[&str] = &[
    "quota",
    "hit your limit",
    "usage cap",
    "rate limit",
    "too many requests",
    "429",
    "insufficient credits",
    "credit balance is too low",
    "usage limit",
    "resource exhausted",
];

const MAX_BACKOFF_SECS: u64 = 30;
const MIN_QUOTA_BACKOFF_SECS: u64 = 10;

/// Return true when `text` describes a quota or rate-limit condition.
pub fn is_quota_or_rate_limit(text: &str) -> bool {
    let lowered = text.to_lowercase();
    QUOTA_MARKERS.iter().any(|marker| lowered.contains(marker))
}

/// Delay before the attempt following `attempt` (1-indexed).
///
/// Generic failures back off exponentially (`2 * 2^(attempt-1)`) up to 30s;
/// quota failures never wait less than 10s.
pub fn backoff(error_text: &str, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    let exponential = (2u64 << exponent).min(MAX_BACKOFF_SECS);
    let secs = if is_quota_or_rate_limit(error_text) {
        exponential.max(MIN_QUOTA_BACKOFF_SECS)
    } else {
        exponential
    };
    Duration::from_secs(secs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_markers_match_case_insensitively() {
        assert!(is_quota_or_rate_limit("HTTP 429 Too Many Requests"));
        assert!(is_quota_or_rate_limit("You've hit your limit for today"));
        assert!(is_quota_or_rate_limit("RESOURCE EXHAUSTED"));
        assert!(!is_quota_or_rate_limit("connection reset by peer"));
    }

    #[test]
    fn generic_backoff_doubles_up_to_the_cap() {
        let secs: Vec<u64> = (1..=6).map(|a| backoff("boom", a).as_secs()).collect();
        assert_eq!(secs, vec![2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn backoff_is_non_decreasing_and_capped() {
        let mut previous = 0;
        for attempt in 1..=64 {
            let secs = backoff("boom", attempt).as_secs();
            assert!(secs >= previous);
            assert!(secs <= 30);
            previous = secs;
        }
    }

    #[test]
    fn quota_backoff_has_a_floor() {
        assert_eq!(backoff("rate limit", 1).as_secs(), 10);
        assert_eq!(backoff("rate limit", 4).as_secs(), 16);
        for attempt in 1..=10 {
            assert!(backoff("quota exceeded", attempt).as_secs() >= 10);
        }
    }
}
