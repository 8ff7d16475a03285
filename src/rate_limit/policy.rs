//! Retry policy and failure classification.

use std::time::Duration;

use super::{backoff_delay, CollaboratorError};

/// Substrings that mark a failure message as throttling.
pub const DEFAULT_RATE_LIMIT_SIGNATURES: &[&str] = &[
    "rate limit",
    "rate-limit",
    "too many requests",
    "quota exceeded",
    "slow down",
    "try again later",
];

/// How the governor treats a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Transient,
    RateLimited(Option<Duration>),
    Permanent,
}

/// Predicate that flags a failure as throttling rather than a real error.
#[derive(Debug, Clone)]
pub struct RateLimitDetector {
    signatures: Vec<String>,
}

impl Default for RateLimitDetector {
    fn default() -> Self {
        Self::with_signatures(DEFAULT_RATE_LIMIT_SIGNATURES.iter().copied())
    }
}

impl RateLimitDetector {
    /// Signatures are matched case-insensitively.
    pub fn with_signatures<I, S>(signatures: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            signatures: signatures
                .into_iter()
                .map(|s| s.as_ref().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect(),
        }
    }

    pub fn matches_message(&self, message: &str) -> bool {
        let lower = message.to_lowercase();
        self.signatures.iter().any(|sig| lower.contains(sig))
    }

    pub fn classify(&self, error: &CollaboratorError) -> FailureKind {
        match error {
            CollaboratorError::RateLimited { retry_after, .. } => FailureKind::RateLimited(*retry_after),
            CollaboratorError::Transient(msg) | CollaboratorError::Permanent(msg)
                if self.matches_message(msg) =>
            {
                FailureKind::RateLimited(None)
            }
            CollaboratorError::Transient(_) | CollaboratorError::Timeout(_) => FailureKind::Transient,
            CollaboratorError::Permanent(_) => FailureKind::Permanent,
        }
    }
}

/// Parameters for [`super::RetryGovernor`].
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts allowed for transient failures (at least 1).
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub multiplier: f64,
    /// Ceiling for transient backoff.
    pub max_delay: Duration,
    /// First wait after a rate-limit signal when no Retry-After is given.
    pub rate_limit_cooldown: Duration,
    /// Ceiling for rate-limit waits, including Retry-After.
    pub max_cooldown: Duration,
    /// Per-attempt timeout.
    pub call_timeout: Duration,
    /// Stop waiting after this many rate-limit signals; `None` waits forever.
    pub max_rate_limit_waits: Option<u32>,
    pub detector: RateLimitDetector,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_delay: Duration::from_secs(60),
            rate_limit_cooldown: Duration::from_secs(60),
            max_cooldown: Duration::from_secs(900),
            call_timeout: Duration::from_secs(300),
            max_rate_limit_waits: None,
            detector: RateLimitDetector::default(),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, base_delay: Duration, multiplier: f64, max_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self.multiplier = multiplier;
        self.max_delay = max_delay;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration, max_cooldown: Duration) -> Self {
        self.rate_limit_cooldown = cooldown;
        self.max_cooldown = max_cooldown;
        self
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_max_rate_limit_waits(mut self, waits: Option<u32>) -> Self {
        self.max_rate_limit_waits = waits;
        self
    }

    pub fn with_detector(mut self, detector: RateLimitDetector) -> Self {
        self.detector = detector;
        self
    }

    pub fn attempt_budget(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Wait before retrying after the `n`th (0-based) transient failure.
    pub fn transient_delay(&self, n: u32) -> Duration {
        backoff_delay(n, self.base_delay, self.multiplier, self.max_delay)
    }

    /// Wait for the `k`th (0-based) rate-limit signal.
    pub fn rate_limit_wait(&self, k: u32, retry_after: Option<Duration>) -> Duration {
        match retry_after {
            Some(hint) => hint.min(self.max_cooldown),
            None => backoff_delay(k, self.rate_limit_cooldown, self.multiplier, self.max_cooldown),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detector_signatures_are_case_insensitive() {
        let detector = RateLimitDetector::default();
        assert_eq!(
            detector.classify(&CollaboratorError::transient("HTTP 500: Too Many Requests")),
            FailureKind::RateLimited(None)
        );
        assert_eq!(
            detector.classify(&CollaboratorError::permanent("403: quota exceeded for model")),
            FailureKind::RateLimited(None)
        );
        assert_eq!(
            detector.classify(&CollaboratorError::permanent("corrupt PDF")),
            FailureKind::Permanent
        );
        assert_eq!(
            detector.classify(&CollaboratorError::Timeout(Duration::from_secs(1))),
            FailureKind::Transient
        );
    }

    #[test]
    fn test_custom_signatures_replace_defaults() {
        let detector = RateLimitDetector::with_signatures(["Access Denied"]);
        assert!(detector.matches_message("<h1>access denied</h1>"));
        assert!(!detector.matches_message("too many requests"));
    }

    #[test]
    fn test_rate_limit_wait_prefers_retry_after_but_caps_it() {
        let policy = RetryPolicy::default()
            .with_backoff(Duration::from_secs(1), 2.0, Duration::from_secs(10))
            .with_cooldown(Duration::from_secs(30), Duration::from_secs(100));

        assert_eq!(policy.rate_limit_wait(0, None), Duration::from_secs(30));
        assert_eq!(policy.rate_limit_wait(1, None), Duration::from_secs(60));
        assert_eq!(policy.rate_limit_wait(5, None), Duration::from_secs(100));
        assert_eq!(policy.rate_limit_wait(0, Some(Duration::from_secs(7))), Duration::from_secs(7));
        assert_eq!(policy.rate_limit_wait(0, Some(Duration::from_secs(700))), Duration::from_secs(100));
        assert_eq!(policy.transient_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn test_zero_attempts_means_one() {
        assert_eq!(RetryPolicy::default().with_max_attempts(0).attempt_budget(), 1);
    }
}
