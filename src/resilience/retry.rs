//! Retry logic with exponential backoff and jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{ConfigError, ResilienceError};

/// Whether repeating a failed operation could plausibly succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transient failure; try again after backing off.
    Retryable,
    /// Permanent failure; return immediately.
    Terminal,
}

impl ErrorClass {
    /// Returns true for [`ErrorClass::Retryable`].
    pub fn is_retryable(self) -> bool {
        self == ErrorClass::Retryable
    }
}

/// Failure classification strategy.
///
/// Each dependency can supply its own classifier while sharing the same
/// [`RetryExecutor`]. Plain closures `Fn(&E) -> ErrorClass` are classifiers.
pub trait Classifier<E: ?Sized>: Send + Sync {
    /// Classify an error.
    fn classify(&self, error: &E) -> ErrorClass;

    /// Server-supplied delay hint, replacing the computed backoff.
    fn retry_after(&self, _error: &E) -> Option<Duration> {
        None
    }
}

impl<E: ?Sized, F> Classifier<E> for F
where
    F: Fn(&E) -> ErrorClass + Send + Sync,
{
    fn classify(&self, error: &E) -> ErrorClass {
        self(error)
    }
}

/// Backoff policy. A pure function of the attempt index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Retries after the first attempt; the operation runs at most
    /// `max_retries + 1` times.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound on any delay.
    pub max_delay: Duration,
    /// Growth factor per attempt.
    pub multiplier: f64,
    /// Fraction of the delay used as symmetric jitter (0.0 to 1.0).
    pub jitter_fraction: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter_fraction: 0.2,
        }
    }
}

impl RetryPolicy {
    /// Create a new retry policy
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Set maximum retries
    pub fn max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    /// Set initial delay
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier
    pub fn multiplier(mut self, m: f64) -> Self {
        self.multiplier = m;
        self
    }

    /// Set jitter fraction
    pub fn jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    /// Checks multiplier, jitter and delay bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "multiplier",
                format!("must be a finite value >= 1.0, got {}", self.multiplier),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(ConfigError::invalid(
                "jitter_fraction",
                format!("must be within [0.0, 1.0], got {}", self.jitter_fraction),
            ));
        }
        if self.initial_delay > self.max_delay {
            return Err(ConfigError::invalid(
                "initial_delay",
                "must not exceed max_delay",
            ));
        }
        Ok(())
    }

    /// Un-jittered delay before retry number `attempt + 1`:
    /// `min(max_delay, initial_delay * multiplier^attempt)`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let raw = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        if raw.is_nan() || raw >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::try_from_secs_f64(raw.max(0.0)).unwrap_or(self.max_delay)
    }

    /// Jittered delay: the base delay moved up or down (with equal
    /// probability) by up to `jitter_fraction` of itself, floored at zero.
    ///
    /// Jitter applies on top of the cap, so a capped delay may exceed
    /// `max_delay` by up to `jitter_fraction`; see [`max_jittered_delay`].
    ///
    /// [`max_jittered_delay`]: Self::max_jittered_delay
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter_fraction <= 0.0 || base.is_zero() {
            return base;
        }

        let base = base.as_secs_f64();
        let mut rng = rand::thread_rng();
        let amount = base * self.jitter_fraction * rng.gen::<f64>();
        let jittered = if rng.gen_bool(0.5) {
            base + amount
        } else {
            base - amount
        };
        Duration::try_from_secs_f64(jittered.max(0.0)).unwrap_or(Duration::MAX)
    }

    /// Upper bound of [`delay`](Self::delay): `max_delay * (1 + jitter_fraction)`.
    pub fn max_jittered_delay(&self) -> Duration {
        let factor = 1.0 + self.jitter_fraction.max(0.0);
        Duration::try_from_secs_f64(self.max_delay.as_secs_f64() * factor)
            .unwrap_or(Duration::MAX)
    }
}

/// Result of a retried call together with how it got there.
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Final result.
    pub result: Result<T, ResilienceError<E>>,
    /// Attempts made, including the first.
    pub attempts: u32,
    /// Total time spent sleeping between attempts.
    pub total_delay: Duration,
}

impl<T, E> RetryOutcome<T, E> {
    /// Whether the call eventually succeeded.
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Number of retries performed.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }
}

/// Retry executor with exponential backoff.
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    policy: RetryPolicy,
}

impl RetryExecutor {
    /// Creates a new retry executor.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Returns the policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Executes an operation with retry logic.
    ///
    /// Terminal errors are returned as [`ResilienceError::Operation`] without
    /// sleeping. Retryable errors are retried up to `max_retries` times, then
    /// reported as [`ResilienceError::RetriesExhausted`]. Cancellation aborts
    /// the running attempt or backoff sleep and returns
    /// [`ResilienceError::Cancelled`].
    pub async fn run<F, Fut, T, E, C>(
        &self,
        classifier: &C,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T, ResilienceError<E>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Classifier<E> + ?Sized,
    {
        self.run_with_outcome(classifier, cancel, operation)
            .await
            .result
    }

    /// Like [`run`](Self::run), also reporting attempts and time slept.
    pub async fn run_with_outcome<F, Fut, T, E, C>(
        &self,
        classifier: &C,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Classifier<E> + ?Sized,
    {
        let mut attempt: u32 = 0;
        let mut total_delay = Duration::ZERO;

        let result = loop {
            if cancel.is_cancelled() {
                break Err(ResilienceError::Cancelled);
            }

            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(ResilienceError::Cancelled),
                outcome = operation() => outcome,
            };

            let error = match outcome {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(attempt = attempt + 1, "Operation succeeded after retry");
                    }
                    break Ok(value);
                }
                Err(error) => error,
            };

            if classifier.classify(&error) == ErrorClass::Terminal {
                debug!(attempt = attempt + 1, "Operation failed with terminal error");
                break Err(ResilienceError::Operation(error));
            }

            if attempt >= self.policy.max_retries {
                warn!(
                    attempts = attempt + 1,
                    max_retries = self.policy.max_retries,
                    "Retries exhausted"
                );
                break Err(ResilienceError::RetriesExhausted {
                    attempts: attempt + 1,
                    last_error: error,
                });
            }

            let delay = classifier
                .retry_after(&error)
                .map(|hint| hint.min(self.policy.max_delay))
                .unwrap_or_else(|| self.policy.delay(attempt));

            debug!(
                attempt = attempt + 1,
                delay_ms = delay.as_millis() as u64,
                "Retrying after transient error"
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break Err(ResilienceError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }

            total_delay = total_delay.saturating_add(delay);
            attempt += 1;
        };

        RetryOutcome {
            result,
            attempts: attempt + 1,
            total_delay,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::ScriptedOperation;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq)]
    enum TestError {
        Transient,
        Fatal,
    }

    fn classify(error: &TestError) -> ErrorClass {
        match error {
            TestError::Transient => ErrorClass::Retryable,
            TestError::Fatal => ErrorClass::Terminal,
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new()
            .max_retries(max_retries)
            .initial_delay(Duration::from_millis(1))
            .max_delay(Duration::from_millis(5))
    }

    #[test]
    fn test_delay_calculation() {
        let policy = RetryPolicy::new()
            .initial_delay(Duration::from_millis(100))
            .multiplier(2.0)
            .jitter_fraction(0.0);

        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_with_max() {
        let policy = RetryPolicy::new()
            .initial_delay(Duration::from_secs(1))
            .max_delay(Duration::from_secs(5))
            .multiplier(10.0)
            .jitter_fraction(0.0);

        assert_eq!(policy.delay(2), Duration::from_secs(5));
        assert_eq!(policy.base_delay(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn test_base_delay_monotonic_and_capped() {
        let policy = RetryPolicy::new()
            .initial_delay(Duration::from_millis(50))
            .max_delay(Duration::from_secs(3))
            .multiplier(1.7);

        for n in 0..40 {
            assert!(policy.base_delay(n) <= policy.base_delay(n + 1));
            assert!(policy.base_delay(n) <= policy.max_delay);
            assert!(policy.delay(n) <= policy.max_jittered_delay());
        }
    }

    #[test]
    fn test_jitter_bounds() {
        let policy = RetryPolicy::new()
            .initial_delay(Duration::from_millis(100))
            .jitter_fraction(0.2);

        for _ in 0..1000 {
            let delay = policy.delay(0);
            assert!(delay >= Duration::from_millis(80), "{delay:?}");
            assert!(delay <= Duration::from_millis(120), "{delay:?}");
        }
    }

    #[test]
    fn test_jitter_spreads_capped_delays() {
        let max = Duration::from_secs(1);
        let policy = RetryPolicy::new()
            .initial_delay(max)
            .max_delay(max)
            .jitter_fraction(0.2);

        let delays: Vec<_> = (0..1000).map(|_| policy.delay(5)).collect();
        let above = delays.iter().filter(|d| **d > max).count();
        let at_cap = delays.iter().filter(|d| **d == max).count();

        assert!(above > 300, "only {above} delays above the cap");
        assert!(at_cap < 50, "{at_cap} delays collapsed onto the cap");
        assert!(delays.iter().all(|d| *d <= policy.max_jittered_delay()));
        let bound = policy.max_jittered_delay();
        assert!(bound > Duration::from_millis(1199) && bound <= Duration::from_millis(1200));
    }

    #[test]
    fn test_unbounded_max_delay_saturates() {
        let policy = RetryPolicy::new()
            .max_delay(Duration::MAX)
            .jitter_fraction(0.0);
        assert!(policy.validate().is_ok());
        assert_eq!(policy.delay(70), Duration::MAX);
        assert_eq!(policy.base_delay(u32::MAX), Duration::MAX);

        let jittered = RetryPolicy::new().max_delay(Duration::MAX);
        assert!(jittered.delay(70) > Duration::from_secs(1 << 40));
        assert_eq!(jittered.max_jittered_delay(), Duration::MAX);
    }

    #[test]
    fn test_zero_initial_delay_stays_zero() {
        let policy = RetryPolicy::new()
            .initial_delay(Duration::ZERO)
            .max_delay(Duration::from_secs(5));

        for n in [0, 1, 100, 2000, u32::MAX] {
            assert_eq!(policy.base_delay(n), Duration::ZERO);
            assert_eq!(policy.delay(n), Duration::ZERO);
        }
    }

    #[test]
    fn test_policy_validation() {
        assert!(RetryPolicy::default().validate().is_ok());
        assert!(RetryPolicy::new().multiplier(0.5).validate().is_err());
        assert!(RetryPolicy::new().jitter_fraction(1.5).validate().is_err());
        assert!(RetryPolicy::new()
            .initial_delay(Duration::from_secs(20))
            .max_delay(Duration::from_secs(1))
            .validate()
            .is_err());
    }

    #[tokio::test]
    async fn test_retry_success() {
        let op = ScriptedOperation::new(vec![
            Err(TestError::Transient),
            Err(TestError::Transient),
            Ok("success"),
        ]);
        let executor = RetryExecutor::new(fast_policy(3));

        let outcome = executor
            .run_with_outcome(&classify, &CancellationToken::new(), || op.call())
            .await;

        assert_eq!(outcome.result.as_ref().ok().copied(), Some("success"));
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.retries(), 2);
        assert_eq!(op.calls(), 3);
    }

    #[tokio::test]
    async fn test_retry_exhausted() {
        let attempts = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(fast_policy(2));

        let result: Result<(), _> = executor
            .run(&classify, &CancellationToken::new(), || {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(TestError::Transient)
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::RetriesExhausted {
                attempts: 3,
                last_error: TestError::Transient
            })
        ));
        assert_eq!(attempts.load(Ordering::SeqCst), 3); // Initial + 2 retries
    }

    #[tokio::test]
    async fn test_terminal_error_short_circuits() {
        let op = ScriptedOperation::<(), TestError>::repeating(Err(TestError::Fatal));
        let executor = RetryExecutor::new(fast_policy(5));

        let result = executor
            .run(&classify, &CancellationToken::new(), || op.call())
            .await;

        assert!(matches!(result, Err(ResilienceError::Operation(TestError::Fatal))));
        assert_eq!(op.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_sleep() {
        let policy = RetryPolicy::new()
            .max_retries(3)
            .initial_delay(Duration::from_secs(60))
            .max_delay(Duration::from_secs(60))
            .jitter_fraction(0.0);
        let executor = RetryExecutor::new(policy);
        let op = ScriptedOperation::<(), TestError>::repeating(Err(TestError::Transient));
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        let outcome = executor
            .run_with_outcome(&classify, &cancel, || op.call())
            .await;

        assert!(matches!(outcome.result, Err(ResilienceError::Cancelled)));
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(op.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let op = ScriptedOperation::<(), TestError>::repeating(Ok(()));

        let result = RetryExecutor::default()
            .run(&classify, &cancel, || op.call())
            .await;

        assert!(matches!(result, Err(ResilienceError::Cancelled)));
        assert_eq!(op.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_hint_replaces_backoff() {
        struct Hinted;
        impl Classifier<TestError> for Hinted {
            fn classify(&self, _error: &TestError) -> ErrorClass {
                ErrorClass::Retryable
            }
            fn retry_after(&self, _error: &TestError) -> Option<Duration> {
                Some(Duration::from_millis(700))
            }
        }

        let executor = RetryExecutor::new(
            RetryPolicy::new()
                .max_retries(1)
                .initial_delay(Duration::from_millis(10))
                .max_delay(Duration::from_millis(500)),
        );
        let op = ScriptedOperation::new(vec![Err(TestError::Transient), Ok(1)]);

        let outcome = executor
            .run_with_outcome(&Hinted, &CancellationToken::new(), || op.call())
            .await;

        assert_eq!(outcome.result.ok(), Some(1));
        assert_eq!(outcome.total_delay, Duration::from_millis(500));
    }
}
