//! Retry Engine (`spec.md` §4.3): a bounded exponential-backoff-with-jitter
//! loop that consults the [`crate::classifier`] after each failure and
//! honors cooperative cancellation during backoff sleeps.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::backoff::Backoff;
use crate::circuit_breaker::CircuitOpenError;
use crate::classifier;
use crate::error::{BoxError, ClassifiedError, MAX_RETRY_FAILURES};
use crate::jitter::Jitter;
use crate::sleeper::{Sleeper, TokioSleeper};

/// `{maxRetries, initialDelay, maxDelay, backoffMultiplier, jitter}` from
/// `spec.md` §3. `delay(n) = min(maxDelay, initialDelay · backoffMultiplier^(n-1))`,
/// perturbed by ±10% when `jitter` is set.
#[derive(Clone)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter: bool,
    pub sleeper: Arc<dyn Sleeper>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .field("jitter", &self.jitter)
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            sleeper: Arc::new(TokioSleeper),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum RetryConfigError {
    /// `backoffMultiplier` must be at least 1.0, otherwise delay shrinks
    /// toward zero rather than backing off.
    InvalidMultiplier(String),
    /// `maxDelay` must be at least `initialDelay`.
    MaxDelayBelowInitial { initial: Duration, max: Duration },
}

impl std::fmt::Display for RetryConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidMultiplier(m) => write!(f, "backoff_multiplier must be >= 1.0, got {}", m),
            Self::MaxDelayBelowInitial { initial, max } => {
                write!(f, "max_delay ({:?}) is below initial_delay ({:?})", max, initial)
            }
        }
    }
}

impl std::error::Error for RetryConfigError {}

impl RetryPolicy {
    pub fn new(
        max_retries: usize,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
        jitter: bool,
    ) -> Result<Self, RetryConfigError> {
        if backoff_multiplier < 1.0 {
            return Err(RetryConfigError::InvalidMultiplier(backoff_multiplier.to_string()));
        }
        if max_delay < initial_delay {
            return Err(RetryConfigError::MaxDelayBelowInitial { initial: initial_delay, max: max_delay });
        }
        Ok(Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
            jitter,
            sleeper: Arc::new(TokioSleeper),
        })
    }

    /// Override the sleeper, for deterministic tests.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Arc::new(sleeper);
        self
    }

    fn backoff(&self) -> Backoff {
        Backoff::exponential_with_multiplier(self.initial_delay, self.backoff_multiplier, self.max_delay)
    }

    fn jitter_strategy(&self) -> Jitter {
        if self.jitter {
            Jitter::Bounded { fraction: 0.1 }
        } else {
            Jitter::None
        }
    }
}

/// The outcome of an exhausted or short-circuited retry loop.
#[derive(Debug)]
pub enum RetryError {
    /// The breaker guarding the attempt was open; propagates without
    /// consuming a retry attempt (§4.6, §7).
    CircuitOpen { breaker: String, failure_count: usize, open_duration: Duration },
    /// The cancellation token fired during a suspension point.
    Cancelled,
    /// Every attempt failed with a retryable classification.
    Exhausted { attempts: usize, failures: Vec<ClassifiedError> },
    /// The classifier marked the failure non-retryable; returned unwrapped
    /// after exactly one attempt.
    NonRetryable(ClassifiedError),
}

/// Drive `attempt` up to `1 + policy.max_retries` times. `component` tags
/// each classified failure (see [`crate::classifier::classify_boxed`]).
pub async fn run<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    component: &str,
    mut attempt: F,
) -> Result<T, RetryError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, BoxError>>,
{
    let max_attempts = 1 + policy.max_retries;
    let backoff = policy.backoff();
    let jitter = policy.jitter_strategy();
    let mut failures: Vec<ClassifiedError> = Vec::new();

    for attempt_no in 0..max_attempts {
        if cancel.is_cancelled() {
            return Err(RetryError::Cancelled);
        }

        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                if let Some(open) = err.downcast_ref::<CircuitOpenError>() {
                    return Err(RetryError::CircuitOpen {
                        breaker: open.breaker.clone(),
                        failure_count: open.failure_count,
                        open_duration: open.open_duration,
                    });
                }

                let classified = classifier::classify_boxed(Some(err), component)
                    .expect("Some(cause) always yields a classification");

                if !classified.retryable() {
                    return Err(RetryError::NonRetryable(classified));
                }

                failures.push(classified);
                if failures.len() > MAX_RETRY_FAILURES {
                    let excess = failures.len() - MAX_RETRY_FAILURES;
                    failures.drain(0..excess);
                }

                if attempt_no + 1 >= max_attempts {
                    return Err(RetryError::Exhausted { attempts: max_attempts, failures });
                }

                let delay = jitter.apply(backoff.delay(attempt_no + 1));
                tokio::select! {
                    _ = policy.sleeper.sleep(delay) => {}
                    _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                }
            }
        }
    }

    unreachable!("retry loop always returns from within the body")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sleeper::{InstantSleeper, TrackingSleeper};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn retryable_err(msg: &str) -> BoxError {
        Box::new(std::io::Error::new(std::io::ErrorKind::Other, format!("service unavailable: {}", msg)))
    }

    fn permanent_err() -> BoxError {
        Box::new(std::io::Error::new(std::io::ErrorKind::NotFound, "file not found"))
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt_without_sleeping() {
        let policy = RetryPolicy::default().with_sleeper(InstantSleeper);
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let result = run(&policy, &cancel, "c", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<_, BoxError>(42)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_retryable_failures_up_to_budget() {
        let policy = RetryPolicy { max_retries: 2, jitter: false, ..RetryPolicy::default() }
            .with_sleeper(InstantSleeper);
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let result = run(&policy, &cancel, "c", || {
            let c = c.clone();
            async move {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(retryable_err("try again"))
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn exhausts_after_one_plus_max_retries_attempts() {
        let policy = RetryPolicy { max_retries: 2, jitter: false, ..RetryPolicy::default() }
            .with_sleeper(InstantSleeper);
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let result = run(&policy, &cancel, "c", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(retryable_err("still down"))
            }
        })
        .await;
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            RetryError::Exhausted { attempts, failures } => {
                assert_eq!(attempts, 3);
                assert_eq!(failures.len(), 3);
            }
            other => panic!("expected Exhausted, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_retryable_failure_stops_after_one_attempt() {
        let policy = RetryPolicy::default().with_sleeper(InstantSleeper);
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let result = run(&policy, &cancel, "c", || {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(permanent_err())
            }
        })
        .await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(matches!(result.unwrap_err(), RetryError::NonRetryable(_)));
    }

    #[tokio::test]
    async fn cancellation_during_sleep_aborts_immediately() {
        let policy = RetryPolicy { max_retries: 5, jitter: false, ..RetryPolicy::default() };
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel_clone.cancel();
        });
        let result = run(&policy, &cancel, "c", || async { Err::<(), _>(retryable_err("down")) }).await;
        assert!(matches!(result.unwrap_err(), RetryError::Cancelled));
    }

    #[tokio::test]
    async fn sleeps_with_exponential_backoff_between_attempts() {
        let sleeper = TrackingSleeper::new();
        let policy = RetryPolicy {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            backoff_multiplier: 2.0,
            jitter: false,
            ..RetryPolicy::default()
        }
        .with_sleeper(sleeper.clone());
        let cancel = CancellationToken::new();
        let _ = run(&policy, &cancel, "c", || async { Err::<(), _>(retryable_err("down")) }).await;
        assert_eq!(sleeper.calls(), 3);
        assert_eq!(sleeper.call_at(0).unwrap(), Duration::from_millis(100));
        assert_eq!(sleeper.call_at(1).unwrap(), Duration::from_millis(200));
        assert_eq!(sleeper.call_at(2).unwrap(), Duration::from_millis(400));
    }

    #[test]
    fn rejects_multiplier_below_one() {
        let result = RetryPolicy::new(3, Duration::from_millis(10), Duration::from_secs(1), 0.5, true);
        assert!(matches!(result, Err(RetryConfigError::InvalidMultiplier(_))));
    }

    #[test]
    fn rejects_max_delay_below_initial() {
        let result =
            RetryPolicy::new(3, Duration::from_secs(5), Duration::from_secs(1), 2.0, true);
        assert!(matches!(result, Err(RetryConfigError::MaxDelayBelowInitial { .. })));
    }
}
