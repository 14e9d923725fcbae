//! Retry classification and jittered exponential backoff.

use rand::Rng;

use nodes::NodeError;

use crate::models::RetryConfig;

/// Upper bound on any computed backoff delay.
pub const BACKOFF_CAP_MS: u64 = 60_000;

const JITTER: f64 = 0.2;

const NON_RETRYABLE_PATTERNS: &[&str] = &[
    "validation",
    "invalid",
    "unauthorized",
    "forbidden",
    "not found",
    "not-found",
    "notfound",
    "bad request",
    "bad-request",
];

const RETRYABLE_PATTERNS: &[&str] = &[
    "timeout",
    "timed out",
    "network",
    "econnreset",
    "connection reset",
    "econnrefused",
    "connection refused",
    "refused",
];

/// Whether a failed attempt should be retried.
///
/// `attempt` is the 1-based number of the attempt that just failed.
pub fn should_retry(error: &NodeError, attempt: u32, max_attempts: u32) -> bool {
    if attempt >= max_attempts || error.is_permanent() {
        return false;
    }

    let message = error.message().to_ascii_lowercase();
    if NON_RETRYABLE_PATTERNS.iter().any(|p| message.contains(p)) {
        return false;
    }

    if let Some(status) = error.status_code() {
        return match status {
            408 | 429 => true,
            400..=499 => false,
            500..=599 => true,
            _ => false,
        };
    }

    RETRYABLE_PATTERNS.iter().any(|p| message.contains(p))
}

/// The un-jittered delay before the attempt after `attempt`.
pub fn base_backoff_ms(attempt: u32, config: &RetryConfig) -> f64 {
    let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
    config.backoff_ms as f64 * config.backoff_multiplier.powi(exponent)
}

/// `backoffMs × multiplier^(attempt−1)`, ±20 % uniform jitter, capped.
pub fn calculate_backoff(attempt: u32, config: &RetryConfig) -> u64 {
    let base = base_backoff_ms(attempt, config);
    let factor = rand::thread_rng().gen_range(1.0 - JITTER..=1.0 + JITTER);
    let jittered = base * factor;
    if !jittered.is_finite() || jittered >= BACKOFF_CAP_MS as f64 {
        return BACKOFF_CAP_MS;
    }
    jittered.max(0.0).round() as u64
}
