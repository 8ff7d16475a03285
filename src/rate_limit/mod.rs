//! Retry, backoff and rate-limit handling for collaborator calls.
//!
//! Every call the pipeline makes to an outside collaborator (archive pages,
//! document downloads, OCR, the language model) reports failures as a
//! [`CollaboratorError`]. The [`RetryGovernor`] classifies each failure as
//! transient, rate-limited or permanent and decides whether to wait and try
//! again. [`RequestPacer`] spaces requests to the same host.

mod governor;
mod pacer;
mod policy;

pub use governor::{RetryGovernor, RetryOutcome, RetryStats};
pub use pacer::{PacerConfig, RequestPacer};
pub use policy::{FailureKind, RateLimitDetector, RetryPolicy, DEFAULT_RATE_LIMIT_SIGNATURES};

use std::time::Duration;

/// Failure reported by an outside collaborator.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CollaboratorError {
    /// Network blip, 5xx, service temporarily unavailable.
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    /// The collaborator signalled throttling.
    #[error("rate limited: {message}")]
    RateLimited {
        retry_after: Option<Duration>,
        message: String,
    },
    /// Corrupt input, malformed output, non-throttling 4xx.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

impl CollaboratorError {
    pub fn transient(msg: impl Into<String>) -> Self {
        CollaboratorError::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        CollaboratorError::Permanent(msg.into())
    }

    pub fn rate_limited(retry_after: Option<Duration>, msg: impl Into<String>) -> Self {
        CollaboratorError::RateLimited {
            retry_after,
            message: msg.into(),
        }
    }

    /// Classify an HTTP status. Returns `None` for success codes.
    ///
    /// 503 only counts as throttling when the server sent `Retry-After`;
    /// a bare 503 is an outage and is retried against the attempt budget.
    /// Its message still carries `context`, so a throttling body is picked
    /// up by the detector's signatures.
    pub fn from_status(status: u16, retry_after: Option<&str>, context: &str) -> Option<Self> {
        match status {
            200..=399 => None,
            s if is_definite_rate_limit(s) || (s == 503 && retry_after.is_some()) => {
                Some(Self::rate_limited(
                    parse_retry_after(retry_after, Duration::MAX),
                    format!("HTTP {} from {}", s, context),
                ))
            }
            408 => Some(Self::transient(format!("HTTP 408 from {}", context))),
            s if s >= 500 => Some(Self::transient(format!("HTTP {} from {}", s, context))),
            s => Some(Self::permanent(format!("HTTP {} from {}", s, context))),
        }
    }
}

impl From<reqwest::Error> for CollaboratorError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            return CollaboratorError::Transient(format!("request timed out: {}", e));
        }
        if let Some(status) = e.status() {
            if let Some(err) = CollaboratorError::from_status(status.as_u16(), None, "request") {
                return err;
            }
        }
        if e.is_builder() || e.is_decode() {
            return CollaboratorError::Permanent(e.to_string());
        }
        CollaboratorError::Transient(e.to_string())
    }
}

/// Status codes that always mean throttling.
pub fn is_definite_rate_limit(status_code: u16) -> bool {
    status_code == 429
}

/// Parse a Retry-After header value in seconds, capped at `cap`.
/// Returns None if the header is missing or not an integer.
pub fn parse_retry_after(header_value: Option<&str>, cap: Duration) -> Option<Duration> {
    let value = header_value?;
    value
        .trim()
        .parse::<u64>()
        .ok()
        .map(|secs| Duration::from_secs(secs).min(cap))
}

/// Exponential backoff: `min(base * multiplier^attempt, max)`.
pub fn backoff_delay(attempt: u32, base: Duration, multiplier: f64, max: Duration) -> Duration {
    let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
    let secs = base.as_secs_f64() * multiplier.max(1.0).powi(exponent);
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(secs)
    }
}

/// Read a millisecond delay from an environment variable, with a default.
pub fn get_delay_from_env(env_var: &str, default_ms: u64) -> Duration {
    std::env::var(env_var)
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .map(Duration::from_millis)
        .unwrap_or(Duration::from_millis(default_ms))
}
