//! Retry backoff and HTTP status classification for relayed requests.

use serde::{Deserialize, Serialize};

/// Default base delay between retries (ms)
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1_000;

/// Backoff multiplier ceiling
pub const MAX_BACKOFF_MULTIPLIER: u64 = 8;

/// Error text attached to a 203 response
pub const AMBIGUOUS_RESPONSE_ERROR: &str = "Ambiguous response - may indicate cached response";

/// Delay before retry number `attempt` (0-based): `base × min(2^attempt, 8)`.
pub fn backoff_delay(base_ms: u64, attempt: u32) -> u64 {
    let multiplier = if attempt >= 3 {
        MAX_BACKOFF_MULTIPLIER
    } else {
        1u64 << attempt
    };
    base_ms.saturating_mul(multiplier)
}

/// What a relay attempt's status code means for the requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HttpOutcome {
    /// Request delivered
    Success,
    /// Not delivered; worth trying again
    Retryable,
    /// Not delivered; retrying will not help
    Terminal,
}

impl HttpOutcome {
    /// Classify a status code. `0` stands for a network-level failure.
    pub fn classify(status: u16) -> Self {
        match status {
            200 | 201 | 202 | 204 => HttpOutcome::Success,
            0 | 203 | 429 | 500..=599 => HttpOutcome::Retryable,
            _ => HttpOutcome::Terminal,
        }
    }

    /// Delivered
    pub fn is_success(self) -> bool {
        self == HttpOutcome::Success
    }

    /// Eligible for automatic retry
    pub fn is_retryable(self) -> bool {
        self == HttpOutcome::Retryable
    }
}

/// Error text reported for a status when the caller supplied none.
pub fn default_error_for(status: u16) -> Option<&'static str> {
    match status {
        203 => Some(AMBIGUOUS_RESPONSE_ERROR),
        0 => Some("Network error"),
        429 => Some("Rate limited"),
        500..=599 => Some("Server error"),
        _ => None,
    }
}
