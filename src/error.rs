//! Error types for the resilience core.
//!
//! `ResilienceError` is the single error type returned by every public entry
//! point in this crate. It is intentionally not generic over the caller's
//! underlying error type: a [`crate::coordinator::ResilienceCoordinator`]
//! multiplexes operations of different [`crate::network::OperationType`]s,
//! each of which may fail with a different concrete error, so causes are
//! type-erased into [`BoxError`] at the point of classification.

use std::fmt;
use std::time::{Duration, Instant};

use crate::classifier::ErrorKind;
use crate::network::OperationType;

/// Cap on the number of failures retained inside `RetryExhausted` to avoid
/// unbounded growth on a pathological retry policy.
pub const MAX_RETRY_FAILURES: usize = 10;

/// A type-erased cause. Operations passed to the coordinator can fail with
/// any `std::error::Error + Send + Sync`; this is the common currency the
/// core stores it in once classified.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// An error classified at the boundary where an operation reported failure.
///
/// Immutable once constructed, per the data model in `spec.md` §3: nothing
/// downstream mutates `kind`, `retryable`, or `cause` after classification.
pub struct ClassifiedError {
    cause: BoxError,
    kind: ErrorKind,
    retryable: bool,
    component: String,
    timestamp: Instant,
}

impl ClassifiedError {
    pub(crate) fn new(cause: BoxError, kind: ErrorKind, component: impl Into<String>) -> Self {
        let retryable = kind.retryable();
        Self { cause, kind, retryable, component: component.into(), timestamp: Instant::now() }
    }

    /// The classification assigned to this failure.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Whether the retry engine should attempt this operation again.
    pub fn retryable(&self) -> bool {
        self.retryable
    }

    /// The component tag supplied at the classification boundary.
    pub fn component(&self) -> &str {
        &self.component
    }

    /// When this failure was classified.
    pub fn timestamp(&self) -> Instant {
        self.timestamp
    }

    /// Borrow the underlying cause.
    pub fn cause(&self) -> &(dyn std::error::Error + 'static) {
        self.cause.as_ref()
    }
}

impl fmt::Debug for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClassifiedError")
            .field("kind", &self.kind)
            .field("retryable", &self.retryable)
            .field("component", &self.component)
            .field("cause", &self.cause.to_string())
            .finish()
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {} ({:?}, retryable={})", self.component, self.cause, self.kind, self.retryable)
    }
}

impl std::error::Error for ClassifiedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

/// A step failure surfaced by the recovery workflow engine. Not parameterized
/// over the caller's error type for the same reason as [`ClassifiedError`]:
/// distinct steps in the same workflow may fail with distinct error types.
#[derive(Debug)]
pub struct WorkflowStepError {
    pub(crate) step_id: String,
    pub(crate) cause: BoxError,
}

impl WorkflowStepError {
    pub(crate) fn new(step_id: impl Into<String>, cause: BoxError) -> Self {
        Self { step_id: step_id.into(), cause }
    }

    pub fn step_id(&self) -> &str {
        &self.step_id
    }
}

impl fmt::Display for WorkflowStepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "workflow step '{}' failed: {}", self.step_id, self.cause)
    }
}

impl std::error::Error for WorkflowStepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

/// Unified error type for the resilience core.
///
/// The taxonomy is exactly the eight classifier kinds (carried inside
/// `Classified`/`RetryExhausted`) plus the sentinel kinds the core itself
/// produces: [`ResilienceError::CircuitOpen`], [`ResilienceError::OperationDisabled`],
/// [`ResilienceError::NoBackendsAvailable`], [`ResilienceError::NoConnectionManager`],
/// and [`ResilienceError::WorkflowStepFailed`]. Every variant wraps its cause so
/// callers can traverse the chain with `std::error::Error::source`.
#[derive(Debug)]
pub enum ResilienceError {
    /// The per-operation resilience timeout elapsed before the retried unit
    /// (circuit breaker + caller function) returned.
    Timeout { elapsed: Duration, timeout: Duration },
    /// The circuit breaker rejected the request without invoking the
    /// caller's function. Distinct from `Network`/`Transient` classification.
    CircuitOpen { breaker: String, failure_count: usize, open_duration: Duration },
    /// All retry attempts were exhausted on a retryable classification.
    RetryExhausted { attempts: usize, failures: Vec<ClassifiedError> },
    /// The final classification of a non-retryable (or exhausted) failure.
    Classified(ClassifiedError),
    /// `OperationConfig::enabled` was false for the requested operation type.
    OperationDisabled(OperationType),
    /// The connection manager has no available backend to select.
    NoBackendsAvailable,
    /// `ExecuteWithBackend` was called but no connection manager is configured.
    NoConnectionManager,
    /// A recovery workflow step failed; rollback of prior steps was attempted
    /// (see `source` chain / workflow state for rollback outcome).
    WorkflowStepFailed(WorkflowStepError),
    /// The caller's cancellation token fired during a suspension point.
    Cancelled,
}

impl fmt::Display for ResilienceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Timeout { elapsed, timeout } => {
                write!(f, "operation timed out after {:?} (limit: {:?})", elapsed, timeout)
            }
            Self::CircuitOpen { breaker, failure_count, open_duration } => write!(
                f,
                "circuit breaker '{}' open ({} failures, open for {:?})",
                breaker, failure_count, open_duration
            ),
            Self::RetryExhausted { attempts, failures } => {
                let last = failures.last().map(|e| e.to_string()).unwrap_or_default();
                write!(
                    f,
                    "retry exhausted after {} attempts ({} failures), last error: {}",
                    attempts,
                    failures.len(),
                    last
                )
            }
            Self::Classified(e) => write!(f, "{}", e),
            Self::OperationDisabled(op) => write!(f, "operation {:?} is disabled", op),
            Self::NoBackendsAvailable => write!(f, "no backends available"),
            Self::NoConnectionManager => write!(f, "no connection manager configured"),
            Self::WorkflowStepFailed(e) => write!(f, "{}", e),
            Self::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for ResilienceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            Self::Classified(e) => Some(e),
            Self::WorkflowStepFailed(e) => Some(e),
            _ => None,
        }
    }
}

impl ResilienceError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Self::CircuitOpen { .. })
    }

    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    pub fn is_operation_disabled(&self) -> bool {
        matches!(self, Self::OperationDisabled(_))
    }

    pub fn is_no_backends_available(&self) -> bool {
        matches!(self, Self::NoBackendsAvailable)
    }

    pub fn is_no_connection_manager(&self) -> bool {
        matches!(self, Self::NoConnectionManager)
    }

    pub fn is_workflow_step_failed(&self) -> bool {
        matches!(self, Self::WorkflowStepFailed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// The classification of the terminal failure, if this error wraps one.
    /// Present for `Classified` and for the last entry of `RetryExhausted`.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            Self::Classified(e) => Some(e.kind()),
            Self::RetryExhausted { failures, .. } => failures.last().map(|e| e.kind()),
            _ => None,
        }
    }
}
