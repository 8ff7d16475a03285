//! Retry loop that turns collaborator failures into a typed outcome.

use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use super::policy::{FailureKind, RetryPolicy};
use super::CollaboratorError;

/// Counters for one governed call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryStats {
    /// Calls made to the collaborator, including rate-limited ones.
    pub attempts: u32,
    /// Rate-limit signals waited out. These do not consume the attempt budget.
    pub rate_limit_waits: u32,
    pub total_wait: Duration,
}

/// Result of a governed call.
#[derive(Debug)]
pub enum RetryOutcome<T> {
    Success { value: T, stats: RetryStats },
    /// Transient failures used up the attempt budget.
    Exhausted { error: CollaboratorError, stats: RetryStats },
    /// A permanent failure; not retried.
    Fatal { error: CollaboratorError, stats: RetryStats },
    /// Rate-limit waits hit `max_rate_limit_waits`. The caller should stop
    /// without recording a failure.
    Throttled { error: CollaboratorError, stats: RetryStats },
}

impl<T> RetryOutcome<T> {
    pub fn stats(&self) -> &RetryStats {
        match self {
            RetryOutcome::Success { stats, .. }
            | RetryOutcome::Exhausted { stats, .. }
            | RetryOutcome::Fatal { stats, .. }
            | RetryOutcome::Throttled { stats, .. } => stats,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RetryOutcome::Success { .. })
    }

    /// Collapse into a plain result, dropping the classification.
    pub fn into_result(self) -> Result<T, CollaboratorError> {
        match self {
            RetryOutcome::Success { value, .. } => Ok(value),
            RetryOutcome::Exhausted { error, .. }
            | RetryOutcome::Fatal { error, .. }
            | RetryOutcome::Throttled { error, .. } => Err(error),
        }
    }
}

/// Executes collaborator calls under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryGovernor {
    policy: RetryPolicy,
}

impl RetryGovernor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `operation` until it succeeds, fails permanently, exhausts the
    /// transient attempt budget, or is throttled past the configured limit.
    ///
    /// Each attempt is bounded by `call_timeout`; a timeout counts as a
    /// transient failure.
    pub async fn execute<T, F, Fut>(&self, label: &str, mut operation: F) -> RetryOutcome<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, CollaboratorError>>,
    {
        let policy = &self.policy;
        let budget = policy.attempt_budget();
        let mut stats = RetryStats::default();
        let mut transient_failures = 0u32;

        loop {
            stats.attempts += 1;
            let result = match tokio::time::timeout(policy.call_timeout, operation()).await {
                Ok(result) => result,
                Err(_) => Err(CollaboratorError::Timeout(policy.call_timeout)),
            };

            let error = match result {
                Ok(value) => {
                    if stats.attempts > 1 {
                        debug!("{}: succeeded after {} attempts", label, stats.attempts);
                    }
                    return RetryOutcome::Success { value, stats };
                }
                Err(error) => error,
            };

            let wait = match policy.detector.classify(&error) {
                FailureKind::Permanent => {
                    warn!("{}: permanent failure, not retrying: {}", label, error);
                    return RetryOutcome::Fatal { error, stats };
                }
                FailureKind::RateLimited(retry_after) => {
                    if policy
                        .max_rate_limit_waits
                        .is_some_and(|max| stats.rate_limit_waits >= max)
                    {
                        warn!(
                            "{}: still rate limited after {} waits, giving up for this run",
                            label, stats.rate_limit_waits
                        );
                        return RetryOutcome::Throttled { error, stats };
                    }
                    let wait = policy.rate_limit_wait(stats.rate_limit_waits, retry_after);
                    stats.rate_limit_waits += 1;
                    warn!(
                        "{}: rate limited ({} so far), cooling down for {:?}",
                        label, stats.rate_limit_waits, wait
                    );
                    wait
                }
                FailureKind::Transient => {
                    transient_failures += 1;
                    if transient_failures >= budget {
                        warn!(
                            "{}: giving up after {} attempts: {}",
                            label, transient_failures, error
                        );
                        return RetryOutcome::Exhausted { error, stats };
                    }
                    let wait = policy.transient_delay(transient_failures - 1);
                    warn!(
                        "{}: attempt {}/{} failed ({}), retrying in {:?}",
                        label, transient_failures, budget, error, wait
                    );
                    wait
                }
            };

            stats.total_wait += wait;
            if !wait.is_zero() {
                tokio::time::sleep(wait).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(3)
            .with_backoff(Duration::from_millis(1), 2.0, Duration::from_millis(5))
            .with_cooldown(Duration::from_millis(2), Duration::from_millis(10))
            .with_call_timeout(Duration::from_millis(200))
    }

    /// Fails with the scripted errors in order, then succeeds.
    fn scripted(
        script: Vec<CollaboratorError>,
    ) -> (Arc<AtomicU32>, impl FnMut() -> std::future::Ready<Result<u32, CollaboratorError>>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let op = move || {
            let n = counter.fetch_add(1, Ordering::SeqCst) as usize;
            std::future::ready(match script.get(n) {
                Some(err) => Err(err.clone()),
                None => Ok(n as u32),
            })
        };
        (calls, op)
    }

    #[tokio::test]
    async fn test_transient_then_success() {
        let governor = RetryGovernor::new(fast_policy());
        let (calls, op) = scripted(vec![CollaboratorError::transient("reset by peer")]);

        let outcome = governor.execute("test", op).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.stats().attempts, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transient_exhausts_budget() {
        let governor = RetryGovernor::new(fast_policy());
        let (calls, op) = scripted(vec![CollaboratorError::transient("502"); 10]);

        let outcome = governor.execute("test", op).await;
        assert!(matches!(outcome, RetryOutcome::Exhausted { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_fails_fast() {
        let governor = RetryGovernor::new(fast_policy());
        let (calls, op) = scripted(vec![CollaboratorError::permanent("corrupt input")]);

        let outcome = governor.execute("test", op).await;
        assert!(matches!(outcome, RetryOutcome::Fatal { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_rate_limits_do_not_consume_attempts() {
        let governor = RetryGovernor::new(fast_policy());
        // More rate-limit signals than max_attempts, interleaved with transients
        let mut script = vec![CollaboratorError::rate_limited(None, "429"); 5];
        script.push(CollaboratorError::transient("blip"));
        script.push(CollaboratorError::transient("blip"));
        let (calls, op) = scripted(script);

        let outcome = governor.execute("test", op).await;
        assert!(outcome.is_success());
        let stats = *outcome.stats();
        assert_eq!(stats.rate_limit_waits, 5);
        assert_eq!(stats.attempts, 8);
        assert_eq!(calls.load(Ordering::SeqCst), 8);
        assert!(stats.total_wait >= Duration::from_millis(2 + 4 + 8 + 10 + 10));
    }

    #[tokio::test]
    async fn test_rate_limit_cap_yields_throttled() {
        let governor = RetryGovernor::new(fast_policy().with_max_rate_limit_waits(Some(2)));
        let (calls, op) = scripted(vec![CollaboratorError::rate_limited(None, "503"); 10]);

        let outcome = governor.execute("test", op).await;
        assert!(matches!(outcome, RetryOutcome::Throttled { .. }));
        assert_eq!(outcome.stats().rate_limit_waits, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_bare_503_exhausts_attempts() {
        let governor = RetryGovernor::new(fast_policy().with_max_attempts(2));
        let outage = CollaboratorError::from_status(503, None, "http://127.0.0.1:11434/api/generate").unwrap();
        let (calls, op) = scripted(vec![outage; 100]);

        let outcome = governor.execute("test", op).await;
        assert!(matches!(outcome, RetryOutcome::Exhausted { .. }));
        assert_eq!(outcome.stats().rate_limit_waits, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_503_with_throttling_body_waits() {
        let governor = RetryGovernor::new(fast_policy().with_max_attempts(1));
        let busy = CollaboratorError::from_status(503, None, "Too many requests, slow down").unwrap();
        let (calls, op) = scripted(vec![busy; 3]);

        let outcome = governor.execute("test", op).await;
        assert!(outcome.is_success());
        assert_eq!(outcome.stats().rate_limit_waits, 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_timeout_is_transient() {
        let governor = RetryGovernor::new(
            fast_policy()
                .with_max_attempts(2)
                .with_call_timeout(Duration::from_millis(10)),
        );
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();

        let outcome = governor
            .execute("slow", move || {
                let n = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n == 0 {
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                    Ok::<_, CollaboratorError>("done")
                }
            })
            .await;

        assert_eq!(outcome.into_result().unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
