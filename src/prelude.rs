//! Convenient re-exports for common resilience-core types.
pub use crate::{
    Backend, BackendConnection, BackendStatus, Backoff, BoxError, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerRegistry, CircuitOpenError, CircuitState, ClassifiedError, ConnectionManager, ConnectionManagerConfig,
    ErrorKind, HealthMonitor, HealthMonitorConfig, HealthProbe, HealthStatus, Jitter, NetworkResilience, OperationType,
    RecoveryAction, RecoveryManager, RecoveryWorkflow, ResilienceCoordinator, ResilienceCoordinatorConfig, ResilienceError,
    RetryPolicy, StateValidator,
};
