//! Circuit breaker (`spec.md` §4.2): lock-free atomics drive the
//! Closed/Open/HalfOpen state machine; per-window counters reset on every
//! transition while lifetime totals stay monotonic.

use std::future::Future;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::{Clock, MonotonicClock};
use crate::error::BoxError;

const STATE_CLOSED: u8 = 0;
const STATE_OPEN: u8 = 1;
const STATE_HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            STATE_CLOSED => CircuitState::Closed,
            STATE_OPEN => CircuitState::Open,
            STATE_HALF_OPEN => CircuitState::HalfOpen,
            _ => unreachable!("invalid circuit breaker state byte"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub name: String,
    pub failure_threshold: usize,
    pub recovery_timeout: Duration,
    pub success_threshold: usize,
    pub max_requests: usize,
    /// Per-request operation timeout applied around the guarded call.
    /// `None` means the breaker does not itself bound call duration.
    pub timeout: Option<Duration>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            success_threshold: 1,
            max_requests: 1,
            timeout: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// A breaker that never trips: used for "circuit breaker disabled" in
    /// the coordinator's graceful-degradation mode.
    pub fn disabled() -> Self {
        Self {
            failure_threshold: usize::MAX,
            recovery_timeout: Duration::from_secs(0),
            success_threshold: 1,
            max_requests: usize::MAX,
            ..Default::default()
        }
    }
}

/// Raised when a request is rejected because the breaker is Open, or
/// because the HalfOpen probe slots are full. Recognized via
/// [`crate::error::ResilienceError::is_circuit_open`] rather than string
/// matching.
#[derive(Debug)]
pub struct CircuitOpenError {
    pub breaker: String,
    pub failure_count: usize,
    pub open_duration: Duration,
}

impl std::fmt::Display for CircuitOpenError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "circuit breaker '{}' is open ({} failures, open for {:?})",
            self.breaker, self.failure_count, self.open_duration
        )
    }
}

impl std::error::Error for CircuitOpenError {}

type StateChangeCallback = Arc<dyn Fn(CircuitState, CircuitState) + Send + Sync>;

struct Counters {
    state: AtomicU8,
    failures: AtomicUsize,
    successes: AtomicUsize,
    requests: AtomicUsize,
    half_open_inflight: AtomicUsize,
    state_changed_at_millis: AtomicU64,
    total_failures: AtomicU64,
    total_successes: AtomicU64,
    total_requests: AtomicU64,
}

impl Counters {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(STATE_CLOSED),
            failures: AtomicUsize::new(0),
            successes: AtomicUsize::new(0),
            requests: AtomicUsize::new(0),
            half_open_inflight: AtomicUsize::new(0),
            state_changed_at_millis: AtomicU64::new(0),
            total_failures: AtomicU64::new(0),
            total_successes: AtomicU64::new(0),
            total_requests: AtomicU64::new(0),
        }
    }

    fn reset_window(&self) {
        self.failures.store(0, Ordering::Release);
        self.successes.store(0, Ordering::Release);
        self.requests.store(0, Ordering::Release);
    }
}

/// Tracks failures/successes for one protected resource. Most callers wrap
/// it in `Arc<CircuitBreaker>` as [`crate::network::NetworkResilience`] does,
/// since `call` takes `&self`.
pub struct CircuitBreaker {
    counters: Counters,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    on_state_change: Option<StateChangeCallback>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self { counters: Counters::new(), config, clock: Arc::new(MonotonicClock::default()), on_state_change: None }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Install a state-change callback. Fired off the critical path on a
    /// fresh task, per §4.2's "fire-and-forget" transition contract.
    pub fn with_state_change_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(CircuitState, CircuitState) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Arc::new(callback));
        self
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from_raw(self.counters.state.load(Ordering::Acquire))
    }

    pub fn total_failures(&self) -> u64 {
        self.counters.total_failures.load(Ordering::Relaxed)
    }

    pub fn total_successes(&self) -> u64 {
        self.counters.total_successes.load(Ordering::Relaxed)
    }

    pub fn total_requests(&self) -> u64 {
        self.counters.total_requests.load(Ordering::Relaxed)
    }

    /// Force the breaker open regardless of current counters.
    pub fn force_open(&self) {
        let old = self.state();
        self.counters.state.store(STATE_OPEN, Ordering::Release);
        self.counters.state_changed_at_millis.store(self.now_millis(), Ordering::Release);
        self.counters.reset_window();
        tracing::warn!(breaker = %self.config.name, "circuit breaker forced open");
        self.fire_callback(old, CircuitState::Open);
    }

    /// Reset to Closed with zeroed window counters. Lifetime totals are
    /// untouched.
    pub fn reset(&self) {
        let old = self.state();
        self.counters.state.store(STATE_CLOSED, Ordering::Release);
        self.counters.state_changed_at_millis.store(0, Ordering::Release);
        self.counters.reset_window();
        self.counters.half_open_inflight.store(0, Ordering::Release);
        tracing::info!(breaker = %self.config.name, "circuit breaker reset");
        if old != CircuitState::Closed {
            self.fire_callback(old, CircuitState::Closed);
        }
    }

    fn now_millis(&self) -> u64 {
        self.clock.now_millis()
    }

    fn fire_callback(&self, old: CircuitState, new: CircuitState) {
        if let Some(cb) = self.on_state_change.clone() {
            tokio::spawn(async move {
                cb(old, new);
            });
        }
    }

    /// Run `op` under the breaker's guard. Rejects immediately with
    /// [`CircuitOpenError`] when the breaker is Open (before its recovery
    /// timeout) or when HalfOpen's probe slots are exhausted; otherwise
    /// invokes `op`, optionally bounded by the breaker's own timeout, and
    /// folds the outcome back into the state machine.
    pub async fn call<T, Fut>(&self, op: impl FnOnce() -> Fut) -> Result<T, BoxError>
    where
        Fut: Future<Output = Result<T, BoxError>>,
    {
        let mut admitted_half_open = false;
        loop {
            let current = self.counters.state.load(Ordering::Acquire);
            match current {
                STATE_OPEN => {
                    let opened_at = self.counters.state_changed_at_millis.load(Ordering::Acquire);
                    let elapsed = self.now_millis().saturating_sub(opened_at);
                    if elapsed >= self.config.recovery_timeout.as_millis() as u64 {
                        match self.counters.state.compare_exchange(
                            STATE_OPEN,
                            STATE_HALF_OPEN,
                            Ordering::AcqRel,
                            Ordering::Acquire,
                        ) {
                            Ok(_) => {
                                self.counters.state_changed_at_millis.store(self.now_millis(), Ordering::Release);
                                self.counters.reset_window();
                                self.counters.half_open_inflight.store(1, Ordering::Release);
                                tracing::info!(breaker = %self.config.name, "circuit breaker half-opening");
                                self.fire_callback(CircuitState::Open, CircuitState::HalfOpen);
                                admitted_half_open = true;
                                break;
                            }
                            Err(_) => continue,
                        }
                    }
                    return Err(Box::new(CircuitOpenError {
                        breaker: self.config.name.clone(),
                        failure_count: self.counters.failures.load(Ordering::Acquire),
                        open_duration: Duration::from_millis(elapsed),
                    }));
                }
                STATE_HALF_OPEN => {
                    let inflight = self.counters.half_open_inflight.fetch_add(1, Ordering::AcqRel);
                    if inflight >= self.config.max_requests {
                        self.counters.half_open_inflight.fetch_sub(1, Ordering::Release);
                        return Err(Box::new(CircuitOpenError {
                            breaker: self.config.name.clone(),
                            failure_count: self.counters.failures.load(Ordering::Acquire),
                            open_duration: Duration::from_millis(0),
                        }));
                    }
                    admitted_half_open = true;
                    break;
                }
                STATE_CLOSED => break,
                _ => unreachable!("invalid circuit breaker state"),
            }
        }

        self.counters.requests.fetch_add(1, Ordering::AcqRel);
        self.counters.total_requests.fetch_add(1, Ordering::Relaxed);

        let result = match self.config.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, op()).await {
                Ok(r) => r,
                Err(_) => Err(Box::new(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("circuit breaker '{}' operation timed out", self.config.name),
                )) as BoxError),
            },
            None => op().await,
        };

        if admitted_half_open {
            self.counters.half_open_inflight.fetch_sub(1, Ordering::Release);
        }

        match &result {
            Ok(_) => self.on_success(),
            Err(_) => self.on_failure(),
        }

        result
    }

    fn on_success(&self) {
        self.counters.total_successes.fetch_add(1, Ordering::Relaxed);
        let current = self.counters.state.load(Ordering::Acquire);
        match current {
            STATE_HALF_OPEN => {
                let successes = self.counters.successes.fetch_add(1, Ordering::AcqRel) + 1;
                if successes >= self.config.success_threshold
                    && self
                        .counters
                        .state
                        .compare_exchange(STATE_HALF_OPEN, STATE_CLOSED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    self.counters.state_changed_at_millis.store(0, Ordering::Release);
                    self.counters.reset_window();
                    tracing::info!(breaker = %self.config.name, "circuit breaker closed");
                    self.fire_callback(CircuitState::HalfOpen, CircuitState::Closed);
                }
            }
            STATE_CLOSED => {
                self.counters.failures.store(0, Ordering::Release);
            }
            _ => {}
        }
    }

    fn on_failure(&self) {
        self.counters.total_failures.fetch_add(1, Ordering::Relaxed);
        let current = self.counters.state.load(Ordering::Acquire);
        let failures = self.counters.failures.fetch_add(1, Ordering::AcqRel) + 1;
        match current {
            STATE_HALF_OPEN => {
                if self
                    .counters
                    .state
                    .compare_exchange(STATE_HALF_OPEN, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.counters.state_changed_at_millis.store(self.now_millis(), Ordering::Release);
                    self.counters.reset_window();
                    tracing::warn!(breaker = %self.config.name, "half-open probe failed, circuit reopened");
                    self.fire_callback(CircuitState::HalfOpen, CircuitState::Open);
                }
            }
            STATE_CLOSED => {
                if failures >= self.config.failure_threshold
                    && self
                        .counters
                        .state
                        .compare_exchange(STATE_CLOSED, STATE_OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    self.counters.state_changed_at_millis.store(self.now_millis(), Ordering::Release);
                    self.counters.reset_window();
                    tracing::error!(breaker = %self.config.name, failures, "circuit breaker opened");
                    self.fire_callback(CircuitState::Closed, CircuitState::Open);
                }
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn io_err(msg: &str) -> BoxError {
        Box::new(std::io::Error::new(std::io::ErrorKind::Other, msg.to_string()))
    }

    fn config(failure_threshold: usize, recovery_timeout: Duration) -> CircuitBreakerConfig {
        CircuitBreakerConfig { failure_threshold, recovery_timeout, ..Default::default() }
    }

    #[derive(Debug, Clone)]
    struct ManualClock {
        now: Arc<AtomicU64>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self { now: Arc::new(AtomicU64::new(0)) }
        }

        fn advance(&self, millis: u64) {
            self.now.fetch_add(millis, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_millis(&self) -> u64 {
            self.now.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn starts_closed_and_admits() {
        let breaker = CircuitBreaker::new(config(3, Duration::from_secs(1)));
        let result = breaker.call(|| async { Ok::<_, BoxError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let breaker = CircuitBreaker::new(config(2, Duration::from_secs(10)));
        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<(), _>(io_err("fail")) }).await;
        }
        assert_eq!(breaker.state(), CircuitState::Open);

        let result: Result<(), BoxError> = breaker.call(|| async { Ok(()) }).await;
        let err = result.unwrap_err();
        assert!(err.downcast_ref::<CircuitOpenError>().is_some());
    }

    #[tokio::test]
    async fn half_open_single_failure_reopens_regardless_of_prior_successes() {
        let clock = ManualClock::new();
        let breaker = CircuitBreaker::new(config(1, Duration::from_millis(100))).with_clock(clock.clone());
        let _ = breaker.call(|| async { Err::<(), _>(io_err("fail")) }).await;
        clock.advance(150);

        let result: Result<(), BoxError> = breaker.call(|| async { Err(io_err("still failing")) }).await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_closes_after_success_threshold() {
        let clock = ManualClock::new();
        let cfg = CircuitBreakerConfig { success_threshold: 2, ..config(1, Duration::from_millis(100)) };
        let breaker = CircuitBreaker::new(cfg).with_clock(clock.clone());
        let _ = breaker.call(|| async { Err::<(), _>(io_err("fail")) }).await;
        clock.advance(150);

        let r1 = breaker.call(|| async { Ok::<_, BoxError>(1) }).await;
        assert!(r1.is_ok());
        assert_eq!(breaker.state(), CircuitState::HalfOpen);

        let r2 = breaker.call(|| async { Ok::<_, BoxError>(2) }).await;
        assert!(r2.is_ok());
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn successes_in_closed_state_reset_window() {
        let breaker = CircuitBreaker::new(config(3, Duration::from_secs(1)));
        for _ in 0..2 {
            let _ = breaker.call(|| async { Err::<(), _>(io_err("fail")) }).await;
        }
        let _ = breaker.call(|| async { Ok::<_, BoxError>(()) }).await;
        for _ in 0..2 {
            let result = breaker.call(|| async { Err::<(), _>(io_err("fail")) }).await;
            assert!(result.is_err());
        }
        assert_eq!(breaker.state(), CircuitState::Closed);
    }

    #[tokio::test]
    async fn totals_are_monotonic_across_transitions() {
        let breaker = CircuitBreaker::new(config(1, Duration::from_millis(10)));
        let _ = breaker.call(|| async { Err::<(), _>(io_err("fail")) }).await;
        assert_eq!(breaker.total_failures(), 1);
        assert_eq!(breaker.total_requests(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = breaker.call(|| async { Ok::<_, BoxError>(()) }).await;
        assert_eq!(breaker.total_successes(), 1);
        assert_eq!(breaker.total_requests(), 2);
    }

    #[tokio::test]
    async fn force_open_rejects_even_when_closed() {
        let breaker = CircuitBreaker::new(config(100, Duration::from_secs(1)));
        breaker.force_open();
        let result: Result<(), BoxError> = breaker.call(|| async { Ok(()) }).await;
        assert!(result.unwrap_err().downcast_ref::<CircuitOpenError>().is_some());
    }

    #[tokio::test]
    async fn reset_returns_to_closed_without_touching_totals() {
        let breaker = CircuitBreaker::new(config(1, Duration::from_secs(100)));
        let _ = breaker.call(|| async { Err::<(), _>(io_err("fail")) }).await;
        assert_eq!(breaker.state(), CircuitState::Open);
        breaker.reset();
        assert_eq!(breaker.state(), CircuitState::Closed);
        assert_eq!(breaker.total_failures(), 1);
        let result = breaker.call(|| async { Ok::<_, BoxError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }

    #[tokio::test]
    async fn state_change_callback_fires_on_transition() {
        let events: Arc<Mutex<Vec<(CircuitState, CircuitState)>>> = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        let breaker = CircuitBreaker::new(config(1, Duration::from_secs(100))).with_state_change_callback(
            move |old, new| {
                events_clone.lock().unwrap().push((old, new));
            },
        );
        let _ = breaker.call(|| async { Err::<(), _>(io_err("fail")) }).await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        let recorded = events.lock().unwrap();
        assert_eq!(recorded.as_slice(), &[(CircuitState::Closed, CircuitState::Open)]);
    }

    #[tokio::test]
    async fn per_breaker_timeout_counts_as_failure() {
        let cfg = CircuitBreakerConfig { timeout: Some(Duration::from_millis(20)), ..config(1, Duration::from_secs(100)) };
        let breaker = CircuitBreaker::new(cfg);
        let result: Result<(), BoxError> = breaker
            .call(|| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(())
            })
            .await;
        assert!(result.is_err());
        assert_eq!(breaker.state(), CircuitState::Open);
    }
}
