#![forbid(unsafe_code)]

//! # resilience-core
//!
//! A resilience core for arbitrary storage/network operations: a circuit
//! breaker, a per-operation retry engine with error classification, a
//! multi-backend connection manager with health-driven failover, and a
//! transactional recovery workflow engine with compensating rollback. The
//! [`ResilienceCoordinator`] composes all of these behind a single entry
//! point so a caller submits a typed operation and gets back either a
//! successful result or a classified failure — with retries, circuit
//! breaking, failover, and best-effort rollback already applied.
//!
//! ## Quick start
//!
//! ```rust
//! use resilience_core::{
//!     BoxError, OperationType, ResilienceCoordinator, ResilienceCoordinatorConfig,
//! };
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() {
//!     let coordinator = ResilienceCoordinator::new(ResilienceCoordinatorConfig {
//!         connection_manager: None,
//!         ..Default::default()
//!     });
//!     let cancel = CancellationToken::new();
//!
//!     let result = coordinator
//!         .execute_resilient_operation(&cancel, OperationType::Read, || async {
//!             Ok::<_, BoxError>(42)
//!         })
//!         .await;
//!     assert_eq!(result.unwrap(), 42);
//! }
//! ```

mod actions;
mod backend;
mod backoff;
mod circuit_breaker;
mod circuit_breaker_registry;
mod classifier;
mod clock;
mod coordinator;
mod error;
mod health;
mod jitter;
mod network;
mod retry;
mod sleeper;
mod workflow;

pub use actions::{DirectoryCreateAction, FileBackupAction, FileRestoreAction, NonEmptyStateValidator, PredicateStateValidator};
pub use backend::{
    Backend, BackendConnection, BackendStatus, ConnectionManager, ConnectionManagerConfig, ConnectionManagerError,
};
pub use backoff::Backoff;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitState};
pub use circuit_breaker_registry::CircuitBreakerRegistry;
pub use classifier::{classify, classify_boxed, classify_tagged, Classifiable, ErrorKind};
pub use clock::{Clock, MonotonicClock};
pub use coordinator::{CoordinatorMetrics, ResilienceCoordinator, ResilienceCoordinatorConfig, SystemHealthReport};
pub use error::{BoxError, ClassifiedError, ResilienceError, WorkflowStepError};
pub use health::{
    ComponentHealthSnapshot, HealthError, HealthMonitor, HealthMonitorConfig, HealthProbe, HealthStatus, HealthThresholds,
};
pub use jitter::Jitter;
pub use network::{NetworkResilience, OperationConfig, OperationStats, OperationType};
pub use retry::{RetryConfigError, RetryError, RetryPolicy};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use workflow::{
    RecoveryAction, RecoveryManager, RecoveryManagerError, RecoveryMetrics, RecoveryStep, RecoveryWorkflow, StateValidator,
    StateValidationError, StepState, WorkflowError, WorkflowState,
};

pub mod prelude;
