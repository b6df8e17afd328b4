//! Network Resilience Layer (`spec.md` §4.6): a shared circuit breaker plus a
//! per-[`OperationType`] configuration table, composing the timeout, retry,
//! and circuit-breaker layers in the order `Timeout(Retry(CircuitBreaker(fn)))`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};
use crate::error::{BoxError, ResilienceError};
use crate::retry::{RetryError, RetryPolicy};

/// The six operation kinds a caller may submit to the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationType {
    Read,
    Write,
    Delete,
    List,
    Sync,
    Query,
}

impl OperationType {
    pub const ALL: [OperationType; 6] = [
        OperationType::Read,
        OperationType::Write,
        OperationType::Delete,
        OperationType::List,
        OperationType::Sync,
        OperationType::Query,
    ];

    fn as_str(self) -> &'static str {
        match self {
            OperationType::Read => "read",
            OperationType::Write => "write",
            OperationType::Delete => "delete",
            OperationType::List => "list",
            OperationType::Sync => "sync",
            OperationType::Query => "query",
        }
    }
}

impl std::fmt::Display for OperationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-operation-type configuration.
#[derive(Debug, Clone)]
pub struct OperationConfig {
    pub timeout: Duration,
    pub retry_policy: RetryPolicy,
    pub enabled: bool,
}

impl Default for OperationConfig {
    fn default() -> Self {
        Self { timeout: Duration::from_secs(30), retry_policy: RetryPolicy::default(), enabled: true }
    }
}

/// Monotonic counters for a single [`OperationType`].
#[derive(Debug, Default)]
pub struct OperationStats {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    last_duration_nanos: AtomicU64,
}

impl OperationStats {
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub fn successful(&self) -> u64 {
        self.successful.load(Ordering::Relaxed)
    }

    pub fn failed(&self) -> u64 {
        self.failed.load(Ordering::Relaxed)
    }

    /// The duration of the most recently completed attempt.
    pub fn last_duration(&self) -> Duration {
        Duration::from_nanos(self.last_duration_nanos.load(Ordering::Relaxed))
    }

    fn record(&self, success: bool, elapsed: Duration) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
        self.last_duration_nanos.store(elapsed.as_nanos() as u64, Ordering::Relaxed);
    }
}

/// Owns a shared circuit breaker and the per-[`OperationType`] config/stats
/// tables. Built by [`crate::coordinator::ResilienceCoordinator`]; not
/// usually constructed directly by callers.
pub struct NetworkResilience {
    breaker: Arc<CircuitBreaker>,
    configs: RwLock<HashMap<OperationType, OperationConfig>>,
    stats: HashMap<OperationType, OperationStats>,
}

impl NetworkResilience {
    pub fn new(breaker_config: CircuitBreakerConfig) -> Self {
        let mut configs = HashMap::new();
        let mut stats = HashMap::new();
        for op in OperationType::ALL {
            configs.insert(op, OperationConfig::default());
            stats.insert(op, OperationStats::default());
        }
        Self { breaker: Arc::new(CircuitBreaker::new(breaker_config)), configs: RwLock::new(configs), stats }
    }

    pub fn breaker(&self) -> Arc<CircuitBreaker> {
        Arc::clone(&self.breaker)
    }

    pub async fn set_config(&self, op: OperationType, config: OperationConfig) {
        self.configs.write().await.insert(op, config);
    }

    pub fn stats(&self, op: OperationType) -> &OperationStats {
        &self.stats[&op]
    }

    /// §4.6 `Execute(opType, fn)`: gate on `enabled`, apply the operation's
    /// timeout around the whole retry loop, drive retries with the
    /// operation's policy, and run each attempt inside the shared breaker.
    pub async fn execute<T, F, Fut>(
        &self,
        op: OperationType,
        cancel: &CancellationToken,
        f: F,
    ) -> Result<T, ResilienceError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, BoxError>>,
    {
        let config = { self.configs.read().await.get(&op).cloned().unwrap_or_default() };
        if !config.enabled {
            return Err(ResilienceError::OperationDisabled(op));
        }

        let started = std::time::Instant::now();
        let breaker = Arc::clone(&self.breaker);
        let component = op.as_str();

        let attempt = || {
            let breaker = Arc::clone(&breaker);
            let f = &f;
            async move { breaker.call(|| f()).await }
        };

        let result = tokio::time::timeout(
            config.timeout,
            crate::retry::run(&config.retry_policy, cancel, component, attempt),
        )
        .await;

        let elapsed = started.elapsed();
        match result {
            Err(_) => {
                self.stats[&op].record(false, elapsed);
                Err(ResilienceError::Timeout { elapsed, timeout: config.timeout })
            }
            Ok(Ok(value)) => {
                self.stats[&op].record(true, elapsed);
                Ok(value)
            }
            Ok(Err(err)) => {
                self.stats[&op].record(false, elapsed);
                Err(retry_error_to_resilience(err))
            }
        }
    }
}

fn retry_error_to_resilience(err: RetryError) -> ResilienceError {
    match err {
        RetryError::CircuitOpen { breaker, failure_count, open_duration } => {
            ResilienceError::CircuitOpen { breaker, failure_count, open_duration }
        }
        RetryError::Cancelled => ResilienceError::Cancelled,
        RetryError::Exhausted { attempts, failures } => ResilienceError::RetryExhausted { attempts, failures },
        RetryError::NonRetryable(classified) => ResilienceError::Classified(classified),
    }
}
