//! Resilience Coordinator (`spec.md` §4.8): composes the circuit breaker,
//! retry engine, connection manager, health monitor, and recovery manager
//! behind a single entry point.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::backend::{Backend, BackendConnection, ConnectionManager, ConnectionManagerConfig};
use crate::circuit_breaker::CircuitBreakerConfig;
use crate::circuit_breaker_registry::CircuitBreakerRegistry;
use crate::classifier;
use crate::error::{BoxError, ResilienceError};
use crate::health::{ComponentHealthSnapshot, HealthError, HealthMonitor, HealthMonitorConfig, HealthProbe, HealthStatus};
use crate::network::{NetworkResilience, OperationConfig, OperationStats, OperationType};
use crate::workflow::{RecoveryManager, RecoveryManagerError, RecoveryWorkflow};

#[derive(Debug, Clone)]
pub struct ResilienceCoordinatorConfig {
    /// Shared breaker backing plain `Execute` calls (§4.6).
    pub network_breaker: CircuitBreakerConfig,
    /// `None` disables the connection manager; `ExecuteWithBackend` then
    /// fails fast with [`ResilienceError::NoConnectionManager`].
    pub connection_manager: Option<ConnectionManagerConfig>,
    /// Health monitor backing coordinator-level components registered via
    /// [`ResilienceCoordinator::register_health_component`] — distinct from
    /// the connection manager's own backend-health monitor.
    pub health: HealthMonitorConfig,
    /// Gates whether terminal failures are exposed as the fully classified
    /// [`ResilienceError::Classified`] (with `ErrorKind`) or left as the
    /// coarser sentinel kinds alone. See DESIGN.md for the Open Question
    /// this resolves.
    pub classify_errors: bool,
}

impl Default for ResilienceCoordinatorConfig {
    fn default() -> Self {
        Self {
            network_breaker: CircuitBreakerConfig::default(),
            connection_manager: Some(ConnectionManagerConfig::default()),
            health: HealthMonitorConfig::default(),
            classify_errors: true,
        }
    }
}

#[derive(Debug, Default)]
struct Metrics {
    total: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    recoveries: AtomicU64,
}

#[derive(Debug, Clone, Default)]
pub struct CoordinatorMetrics {
    pub total: u64,
    pub successful: u64,
    pub failed: u64,
    /// Successes achieved only after a failover or a workflow rollback.
    pub recoveries: u64,
    pub success_rate: f64,
}

#[derive(Debug, Clone)]
pub struct SystemHealthReport {
    pub overall: HealthStatus,
    pub components: HashMap<String, ComponentHealthSnapshot>,
    pub metrics: CoordinatorMetrics,
}

/// Owns the Connection Manager, Network Resilience, Health Monitor, and
/// Recovery Manager exclusively (§5 "Ownership and lifetime").
pub struct ResilienceCoordinator {
    network: NetworkResilience,
    connection_manager: Option<Arc<ConnectionManager>>,
    health: Arc<HealthMonitor>,
    recovery: Arc<RecoveryManager>,
    breaker_registry: CircuitBreakerRegistry,
    classify_errors: bool,
    metrics: Metrics,
    root_cancel: CancellationToken,
}

impl ResilienceCoordinator {
    pub fn new(config: ResilienceCoordinatorConfig) -> Arc<Self> {
        let network = NetworkResilience::new(config.network_breaker);
        let breaker_registry = CircuitBreakerRegistry::new();
        breaker_registry.register("network", network.breaker());

        let connection_manager = config.connection_manager.map(ConnectionManager::new);

        Arc::new(Self {
            network,
            connection_manager,
            health: HealthMonitor::new(config.health),
            recovery: RecoveryManager::new(),
            breaker_registry,
            classify_errors: config.classify_errors,
            metrics: Metrics::default(),
            root_cancel: CancellationToken::new(),
        })
    }

    /// `Execute(ctx, opType, fn)`: retry + shared circuit breaker, no
    /// backend selection.
    pub async fn execute_resilient_operation<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        op: OperationType,
        f: F,
    ) -> Result<T, ResilienceError>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<T, BoxError>>,
    {
        let result = self.network.execute(op, cancel, f).await;
        self.record(&result);
        result
    }

    /// `ExecuteWithBackend(ctx, opType, fn(ctx, backend))`: selects a
    /// backend via the Connection Manager and runs `f` under that
    /// backend's own breaker, with failover on non-circuit-open failure.
    pub async fn execute_resilient_operation_with_backend<T, F, Fut>(
        &self,
        cancel: &CancellationToken,
        _op: OperationType,
        f: F,
    ) -> Result<T, ResilienceError>
    where
        F: Fn(CancellationToken, Arc<BackendConnection>) -> Fut,
        Fut: std::future::Future<Output = Result<T, BoxError>>,
    {
        let manager = match &self.connection_manager {
            Some(manager) => manager,
            None => {
                self.metrics.total.fetch_add(1, Ordering::AcqRel);
                self.metrics.failed.fetch_add(1, Ordering::AcqRel);
                return Err(ResilienceError::NoConnectionManager);
            }
        };

        let cancel = cancel.clone();
        let result = manager.execute_with_failover(|backend| f(cancel.clone(), backend)).await;

        self.metrics.total.fetch_add(1, Ordering::AcqRel);
        match result {
            Ok((value, failed_over)) => {
                self.metrics.successful.fetch_add(1, Ordering::AcqRel);
                if failed_over {
                    self.metrics.recoveries.fetch_add(1, Ordering::AcqRel);
                }
                Ok(value)
            }
            Err(cause) => {
                self.metrics.failed.fetch_add(1, Ordering::AcqRel);
                if let Some(open) = cause.downcast_ref::<crate::circuit_breaker::CircuitOpenError>() {
                    return Err(ResilienceError::CircuitOpen {
                        breaker: open.breaker.clone(),
                        failure_count: open.failure_count,
                        open_duration: open.open_duration,
                    });
                }
                // when classification is disabled, skip the message-pattern
                // lookup and tag the cause as Unknown rather than guessing.
                let classified = if self.classify_errors {
                    classifier::classify_boxed(Some(cause), "connection_manager")
                        .expect("Some(cause) always yields a classification")
                } else {
                    crate::error::ClassifiedError::new(cause, crate::classifier::ErrorKind::Unknown, "connection_manager")
                };
                Err(ResilienceError::Classified(classified))
            }
        }
    }

    /// Replace the `{timeout, retryPolicy, enabled}` table entry for one
    /// [`OperationType`], consulted by the next `execute_resilient_operation`
    /// call against that type.
    pub async fn configure_operation(&self, op: OperationType, config: OperationConfig) {
        self.network.set_config(op, config).await;
    }

    pub fn operation_stats(&self, op: OperationType) -> &OperationStats {
        self.network.stats(op)
    }

    fn record<T>(&self, result: &Result<T, ResilienceError>) {
        self.metrics.total.fetch_add(1, Ordering::AcqRel);
        match result {
            Ok(_) => {
                self.metrics.successful.fetch_add(1, Ordering::AcqRel);
            }
            Err(_) => {
                self.metrics.failed.fetch_add(1, Ordering::AcqRel);
            }
        }
    }

    pub async fn add_backend(
        &self,
        backend: Backend,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<(), ResilienceError> {
        let manager = self.connection_manager.as_ref().ok_or(ResilienceError::NoConnectionManager)?;
        let id = backend.id.clone();
        manager
            .add_backend(backend, probe)
            .await
            .map_err(|e| ResilienceError::Classified(minimal_classified(e, "connection_manager")))?;
        if let Some(conn) = manager.get_connection(&id).await {
            self.breaker_registry.register(id, Arc::clone(conn.breaker()));
        }
        Ok(())
    }

    pub async fn remove_backend(&self, id: &str) -> Result<(), ResilienceError> {
        let manager = self.connection_manager.as_ref().ok_or(ResilienceError::NoConnectionManager)?;
        manager
            .remove_backend(id)
            .await
            .map_err(|e| ResilienceError::Classified(minimal_classified(e, "connection_manager")))?;
        self.breaker_registry.unregister(id);
        Ok(())
    }

    pub async fn register_health_component(
        self: &Arc<Self>,
        name: impl Into<String>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<(), HealthError> {
        self.health.register_component(name, probe).await
    }

    pub async fn create_recovery_workflow(
        self: &Arc<Self>,
        id: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Arc<RecoveryWorkflow>, RecoveryManagerError> {
        self.recovery.create_workflow(id, description).await
    }

    pub fn recovery_manager(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    pub fn breaker_registry(&self) -> &CircuitBreakerRegistry {
        &self.breaker_registry
    }

    pub fn root_cancellation(&self) -> &CancellationToken {
        &self.root_cancel
    }

    /// Aggregate of overall health level, per-component breakdowns across
    /// both the coordinator's own health monitor and the connection
    /// manager's backend monitor, and current metrics.
    pub async fn get_system_health(&self) -> SystemHealthReport {
        let mut components = self.health.snapshot_all().await;
        let mut overall = self.health.overall().await;

        if let Some(manager) = &self.connection_manager {
            let backend_health = manager.health();
            components.extend(backend_health.snapshot_all().await);
            let backend_overall = backend_health.overall().await;
            if worse(backend_overall, overall) {
                overall = backend_overall;
            }
        }

        SystemHealthReport { overall, components, metrics: self.get_metrics() }
    }

    pub fn get_metrics(&self) -> CoordinatorMetrics {
        let total = self.metrics.total.load(Ordering::Acquire);
        let successful = self.metrics.successful.load(Ordering::Acquire);
        let failed = self.metrics.failed.load(Ordering::Acquire);
        let recoveries = self.metrics.recoveries.load(Ordering::Acquire);
        let success_rate = if total == 0 { 0.0 } else { successful as f64 / total as f64 };
        CoordinatorMetrics { total, successful, failed, recoveries, success_rate }
    }

    pub fn reset_metrics(&self) {
        self.metrics.total.store(0, Ordering::Release);
        self.metrics.successful.store(0, Ordering::Release);
        self.metrics.failed.store(0, Ordering::Release);
        self.metrics.recoveries.store(0, Ordering::Release);
    }

    /// Cancel the root context and wait for background tasks (health
    /// probes, connection-manager supervisors) to observe it.
    pub async fn stop(&self) {
        self.root_cancel.cancel();
        self.health.stop().await;
        if let Some(manager) = &self.connection_manager {
            manager.stop().await;
        }
    }
}

fn worse(a: HealthStatus, b: HealthStatus) -> bool {
    fn severity(s: HealthStatus) -> u8 {
        match s {
            HealthStatus::Unknown => 0,
            HealthStatus::Healthy => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Unhealthy => 3,
            HealthStatus::Critical => 4,
        }
    }
    severity(a) > severity(b)
}

fn minimal_classified(cause: impl std::error::Error + Send + Sync + 'static, component: &str) -> crate::error::ClassifiedError {
    classifier::classify_boxed(Some(Box::new(cause)), component).expect("Some(cause) always yields a classification")
}
