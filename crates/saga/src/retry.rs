//! Retry and backoff policies.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use crate::invoker::{StepError, StepErrorKind};

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after the delay.
    Retry(Duration),
    /// Stop retrying.
    GiveUp,
}

/// Whether a failure is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retriable,
    NonRetriable,
}

/// Decides whether a step failure is retriable.
///
/// Services signal permanence differently, so classifiers are attached per
/// step through the step's retry policy.
pub trait ErrorClassifier: Send + Sync {
    fn classify(&self, error: &StepError) -> ErrorClass;
}

/// Classifies by [`StepErrorKind`]: transient failures and timeouts retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct KindClassifier;

impl ErrorClassifier for KindClassifier {
    fn classify(&self, error: &StepError) -> ErrorClass {
        match error.kind {
            StepErrorKind::Transient | StepErrorKind::Timeout => ErrorClass::Retriable,
            StepErrorKind::Permanent | StepErrorKind::Cancelled => ErrorClass::NonRetriable,
        }
    }
}

/// Treats a fixed set of service error codes as permanent, whatever kind
/// the invoker reported. Errors without a listed code fall back to
/// [`KindClassifier`].
#[derive(Debug, Clone, Default)]
pub struct CodeClassifier {
    permanent_codes: HashSet<String>,
}

impl CodeClassifier {
    pub fn new<I, C>(permanent_codes: I) -> Self
    where
        I: IntoIterator<Item = C>,
        C: Into<String>,
    {
        Self {
            permanent_codes: permanent_codes.into_iter().map(Into::into).collect(),
        }
    }
}

impl ErrorClassifier for CodeClassifier {
    fn classify(&self, error: &StepError) -> ErrorClass {
        match &error.code {
            Some(code) if self.permanent_codes.contains(code) => ErrorClass::NonRetriable,
            _ => KindClassifier.classify(error),
        }
    }
}

/// Strategy consulted after every failed forward or compensating attempt.
pub trait RetryPolicy: Send + Sync {
    /// `attempt` counts failures so far, including this one (1-based).
    fn decide(&self, step_index: usize, attempt: u32, error: &StepError) -> RetryDecision;
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn decide(&self, _step_index: usize, _attempt: u32, _error: &StepError) -> RetryDecision {
        RetryDecision::GiveUp
    }
}

/// Exponential backoff with jitter and a capped attempt count.
///
/// The delay before retry `n` is `base_delay * 2^(n-1)`, capped at
/// `max_delay`, then reduced by a random fraction up to `jitter`.
#[derive(Clone)]
pub struct ExponentialBackoff {
    base_delay: Duration,
    max_delay: Duration,
    max_attempts: u32,
    jitter: f64,
    classifier: Arc<dyn ErrorClassifier>,
}

impl ExponentialBackoff {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

    pub fn new() -> Self {
        Self {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            max_attempts: Self::DEFAULT_MAX_ATTEMPTS,
            jitter: 0.2,
            classifier: Arc::new(KindClassifier),
        }
    }

    /// Total attempts allowed, including the first.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Fraction of the delay that may be randomly shaved off, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn ErrorClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Delay before the retry that follows failure number `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        if self.jitter > 0.0 {
            delay.mul_f64(1.0 - self.jitter * rand::random::<f64>())
        } else {
            delay
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ExponentialBackoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExponentialBackoff")
            .field("base_delay", &self.base_delay)
            .field("max_delay", &self.max_delay)
            .field("max_attempts", &self.max_attempts)
            .field("jitter", &self.jitter)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn decide(&self, _step_index: usize, attempt: u32, error: &StepError) -> RetryDecision {
        if self.classifier.classify(error) == ErrorClass::NonRetriable {
            return RetryDecision::GiveUp;
        }
        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp;
        }
        RetryDecision::Retry(self.delay_for(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff() -> ExponentialBackoff {
        ExponentialBackoff::new()
            .with_base_delay(Duration::from_millis(100))
            .with_max_delay(Duration::from_millis(1000))
            .with_jitter(0.0)
    }

    #[test]
    fn delays_double_until_capped() {
        let policy = backoff();
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(4), Duration::from_millis(800));
        assert_eq!(policy.delay_for(5), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(60), Duration::from_millis(1000));
    }

    #[test]
    fn jitter_only_shortens_the_delay() {
        let policy = backoff().with_jitter(0.5);
        for _ in 0..100 {
            let delay = policy.delay_for(2);
            assert!(delay <= Duration::from_millis(200));
            assert!(delay >= Duration::from_millis(100));
        }
    }

    #[test]
    fn transient_errors_retry_until_attempts_exhausted() {
        let policy = backoff().with_max_attempts(3);
        let error = StepError::transient("connection reset");

        assert_eq!(
            policy.decide(0, 1, &error),
            RetryDecision::Retry(Duration::from_millis(100))
        );
        assert_eq!(
            policy.decide(0, 2, &error),
            RetryDecision::Retry(Duration::from_millis(200))
        );
        assert_eq!(policy.decide(0, 3, &error), RetryDecision::GiveUp);
    }

    #[test]
    fn permanent_errors_give_up_immediately() {
        let policy = backoff();
        assert_eq!(
            policy.decide(0, 1, &StepError::permanent("invalid card")),
            RetryDecision::GiveUp
        );
        assert_eq!(
            policy.decide(0, 1, &StepError::cancelled()),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn timeouts_are_retriable() {
        let policy = backoff();
        assert!(matches!(
            policy.decide(0, 1, &StepError::timeout(Duration::from_secs(1))),
            RetryDecision::Retry(_)
        ));
    }

    #[test]
    fn code_classifier_overrides_kind() {
        let policy = backoff().with_classifier(Arc::new(CodeClassifier::new(["card_declined"])));

        let declined = StepError::transient("gateway said no").with_code("card_declined");
        assert_eq!(policy.decide(0, 1, &declined), RetryDecision::GiveUp);

        let busy = StepError::transient("gateway busy").with_code("rate_limited");
        assert!(matches!(policy.decide(0, 1, &busy), RetryDecision::Retry(_)));
    }

    #[test]
    fn no_retry_always_gives_up() {
        assert_eq!(
            NoRetry.decide(3, 1, &StepError::transient("x")),
            RetryDecision::GiveUp
        );
    }

    #[test]
    fn max_attempts_is_at_least_one() {
        assert_eq!(backoff().with_max_attempts(0).max_attempts(), 1);
    }
}
