//! Recovery Workflow Engine (`spec.md` §4.7): an append-only ordered
//! sequence of steps executed strictly in insertion order, with
//! compensating rollback in strict reverse order on any step failure or
//! cancellation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, WorkflowStepError};

/// `{Execute(ctx)→err, Rollback(ctx)→err, ID(), Description()}` from §6.
#[async_trait]
pub trait RecoveryAction: Send + Sync {
    async fn execute(&self, cancel: &CancellationToken) -> Result<(), BoxError>;
    async fn rollback(&self, cancel: &CancellationToken) -> Result<(), BoxError>;
    fn id(&self) -> &str;
    fn description(&self) -> &str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    Idle,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

pub struct RecoveryStep {
    action: Arc<dyn RecoveryAction>,
    state: RwLock<StepState>,
    start_time: RwLock<Option<Instant>>,
    end_time: RwLock<Option<Instant>>,
    error: RwLock<Option<String>>,
}

impl RecoveryStep {
    fn new(action: Arc<dyn RecoveryAction>) -> Self {
        Self {
            action,
            state: RwLock::new(StepState::Idle),
            start_time: RwLock::new(None),
            end_time: RwLock::new(None),
            error: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        self.action.id()
    }

    pub fn description(&self) -> &str {
        self.action.description()
    }

    pub async fn state(&self) -> StepState {
        *self.state.read().await
    }

    pub async fn error(&self) -> Option<String> {
        self.error.read().await.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    Idle,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

type WorkflowCompleteCallback = Arc<dyn Fn(String, bool) + Send + Sync>;
type StepCompleteCallback = Arc<dyn Fn(String, String) + Send + Sync>;

/// `{id, description, ordered sequence of steps, state, start/endTime, last
/// error}` from §3. Steps are append-only; `add_step` is rejected once the
/// workflow has started.
pub struct RecoveryWorkflow {
    pub id: String,
    pub description: String,
    steps: RwLock<Vec<Arc<RecoveryStep>>>,
    state: RwLock<WorkflowState>,
    start_time: RwLock<Option<Instant>>,
    end_time: RwLock<Option<Instant>>,
    last_error: RwLock<Option<String>>,
    on_complete: RwLock<Option<WorkflowCompleteCallback>>,
    on_step_complete: RwLock<Option<StepCompleteCallback>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WorkflowError {
    AlreadyStarted,
    WrongState { expected: &'static str },
}

impl std::fmt::Display for WorkflowError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyStarted => write!(f, "workflow has already started; steps are append-only before execution"),
            Self::WrongState { expected } => write!(f, "workflow is not in the expected state: {}", expected),
        }
    }
}

impl std::error::Error for WorkflowError {}

impl RecoveryWorkflow {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            id: id.into(),
            description: description.into(),
            steps: RwLock::new(Vec::new()),
            state: RwLock::new(WorkflowState::Idle),
            start_time: RwLock::new(None),
            end_time: RwLock::new(None),
            last_error: RwLock::new(None),
            on_complete: RwLock::new(None),
            on_step_complete: RwLock::new(None),
        })
    }

    pub async fn add_step(&self, action: Arc<dyn RecoveryAction>) -> Result<(), WorkflowError> {
        if *self.state.read().await != WorkflowState::Idle {
            return Err(WorkflowError::AlreadyStarted);
        }
        self.steps.write().await.push(Arc::new(RecoveryStep::new(action)));
        Ok(())
    }

    pub fn with_complete_callback(self: Arc<Self>, callback: WorkflowCompleteCallback) -> Arc<Self> {
        // installed before Execute is called; try_write never contends here.
        if let Ok(mut guard) = self.on_complete.try_write() {
            *guard = Some(callback);
        }
        self
    }

    pub fn with_step_complete_callback(self: Arc<Self>, callback: StepCompleteCallback) -> Arc<Self> {
        if let Ok(mut guard) = self.on_step_complete.try_write() {
            *guard = Some(callback);
        }
        self
    }

    pub async fn state(&self) -> WorkflowState {
        *self.state.read().await
    }

    pub async fn last_error(&self) -> Option<String> {
        self.last_error.read().await.clone()
    }

    pub async fn steps(&self) -> Vec<Arc<RecoveryStep>> {
        self.steps.read().await.clone()
    }

    /// Run every step in insertion order. On the first failure or a
    /// cancellation, already-completed steps are rolled back in reverse
    /// order before the workflow settles into `RolledBack`.
    pub async fn execute(&self, cancel: &CancellationToken) -> Result<(), BoxError> {
        *self.state.write().await = WorkflowState::InProgress;
        *self.start_time.write().await = Some(Instant::now());

        let steps = self.steps.read().await.clone();
        let mut executed: Vec<Arc<RecoveryStep>> = Vec::new();

        for step in steps.iter() {
            if cancel.is_cancelled() {
                let wrapped: BoxError = Box::new(WorkflowStepError::new(step.id(), cancelled_err()));
                return Err(self.fail_and_rollback(&executed, cancel, wrapped).await);
            }

            *step.state.write().await = StepState::InProgress;
            *step.start_time.write().await = Some(Instant::now());

            let outcome = tokio::select! {
                result = step.action.execute(cancel) => result,
                _ = cancel.cancelled() => Err(cancelled_err()),
            };
            *step.end_time.write().await = Some(Instant::now());

            match outcome {
                Ok(()) => {
                    *step.state.write().await = StepState::Completed;
                    executed.push(Arc::clone(step));
                    if let Some(cb) = self.on_step_complete.read().await.clone() {
                        let wf_id = self.id.clone();
                        let step_id = step.id().to_string();
                        tokio::spawn(async move { cb(wf_id, step_id) });
                    }
                }
                Err(cause) => {
                    *step.error.write().await = Some(cause.to_string());
                    *step.state.write().await = StepState::Failed;
                    let wrapped: BoxError = Box::new(WorkflowStepError::new(step.id(), cause));
                    return Err(self.fail_and_rollback(&executed, cancel, wrapped).await);
                }
            }
        }

        *self.state.write().await = WorkflowState::Completed;
        *self.end_time.write().await = Some(Instant::now());
        self.fire_complete(true).await;
        Ok(())
    }

    async fn fail_and_rollback(
        &self,
        executed: &[Arc<RecoveryStep>],
        cancel: &CancellationToken,
        err: BoxError,
    ) -> BoxError {
        *self.last_error.write().await = Some(err.to_string());
        self.rollback_steps(executed, cancel).await;
        *self.state.write().await = WorkflowState::RolledBack;
        *self.end_time.write().await = Some(Instant::now());
        self.fire_complete(false).await;
        err
    }

    /// Roll back `executed` in strict reverse order. Never short-circuits:
    /// every step gets a rollback attempt even if an earlier one failed.
    /// Returns the last rollback error, if any.
    async fn rollback_steps(&self, executed: &[Arc<RecoveryStep>], cancel: &CancellationToken) -> Option<BoxError> {
        let mut last_err = None;
        for step in executed.iter().rev() {
            match step.action.rollback(cancel).await {
                Ok(()) => {
                    *step.state.write().await = StepState::RolledBack;
                }
                Err(cause) => {
                    *step.error.write().await = Some(cause.to_string());
                    last_err = Some(cause);
                }
            }
        }
        last_err
    }

    /// Manually roll back every `Completed` step of a workflow that finished
    /// successfully.
    pub async fn rollback(&self, cancel: &CancellationToken) -> Result<(), BoxError> {
        if *self.state.read().await != WorkflowState::Completed {
            return Err(Box::new(WorkflowError::WrongState { expected: "Completed" }));
        }
        let steps = self.steps.read().await.clone();
        let completed: Vec<Arc<RecoveryStep>> = {
            let mut out = Vec::new();
            for step in steps {
                if step.state().await == StepState::Completed {
                    out.push(step);
                }
            }
            out
        };
        let last_err = self.rollback_steps(&completed, cancel).await;
        *self.state.write().await = WorkflowState::RolledBack;
        self.fire_complete(false).await;
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn fire_complete(&self, success: bool) {
        if let Some(cb) = self.on_complete.read().await.clone() {
            let id = self.id.clone();
            tokio::spawn(async move { cb(id, success) });
        }
    }
}

fn cancelled_err() -> BoxError {
    Box::new(std::io::Error::new(std::io::ErrorKind::Interrupted, "context cancelled"))
}

#[derive(Debug, Default, Clone)]
pub struct RecoveryMetrics {
    pub total: usize,
    pub successful: usize,
    pub failed: usize,
    pub rolled_back: usize,
    pub active: usize,
}

struct Counters {
    total: AtomicUsize,
    successful: AtomicUsize,
    failed: AtomicUsize,
    rolled_back: AtomicUsize,
    active: AtomicUsize,
    #[allow(dead_code)]
    created_at_millis: AtomicU64,
}

/// A validator run by `RecoveryManager::validate_state` before or after a
/// workflow; the first failure short-circuits the chain and names the
/// validator that rejected the state.
#[async_trait]
pub trait StateValidator: Send + Sync {
    async fn validate(&self, state: &str) -> Result<(), BoxError>;
    fn name(&self) -> &str;
}

#[derive(Debug)]
pub struct StateValidationError {
    validator: String,
    cause: BoxError,
}

impl std::fmt::Display for StateValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "state validator '{}' rejected state: {}", self.validator, self.cause)
    }
}

impl std::error::Error for StateValidationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.cause.as_ref())
    }
}

/// Owns the workflow table, aggregates completion counters via a callback
/// installed on every workflow it creates, and runs state validators.
pub struct RecoveryManager {
    workflows: RwLock<HashMap<String, Arc<RecoveryWorkflow>>>,
    validators: RwLock<Vec<Arc<dyn StateValidator>>>,
    counters: Counters,
}

#[derive(Debug, PartialEq, Eq)]
pub enum RecoveryManagerError {
    DuplicateWorkflow(String),
    NotFound(String),
    InProgress(String),
}

impl std::fmt::Display for RecoveryManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateWorkflow(id) => write!(f, "workflow '{}' already exists", id),
            Self::NotFound(id) => write!(f, "workflow '{}' not found", id),
            Self::InProgress(id) => write!(f, "workflow '{}' is in progress and cannot be removed", id),
        }
    }
}

impl std::error::Error for RecoveryManagerError {}

impl RecoveryManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            workflows: RwLock::new(HashMap::new()),
            validators: RwLock::new(Vec::new()),
            counters: Counters {
                total: AtomicUsize::new(0),
                successful: AtomicUsize::new(0),
                failed: AtomicUsize::new(0),
                rolled_back: AtomicUsize::new(0),
                active: AtomicUsize::new(0),
                created_at_millis: AtomicU64::new(0),
            },
        })
    }

    pub fn register_validator(&self, validator: Arc<dyn StateValidator>) {
        if let Ok(mut guard) = self.validators.try_write() {
            guard.push(validator);
        }
    }

    pub async fn create_workflow(
        self: &Arc<Self>,
        id: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<Arc<RecoveryWorkflow>, RecoveryManagerError> {
        let id = id.into();
        let mut workflows = self.workflows.write().await;
        if workflows.contains_key(&id) {
            return Err(RecoveryManagerError::DuplicateWorkflow(id));
        }

        let manager = Arc::clone(self);
        let workflow = RecoveryWorkflow::new(id.clone(), description).with_complete_callback(Arc::new(move |_id, success| {
            manager.counters.active.fetch_sub(1, Ordering::AcqRel);
            if success {
                manager.counters.successful.fetch_add(1, Ordering::AcqRel);
            } else {
                manager.counters.rolled_back.fetch_add(1, Ordering::AcqRel);
                manager.counters.failed.fetch_add(1, Ordering::AcqRel);
            }
        }));

        self.counters.total.fetch_add(1, Ordering::AcqRel);
        self.counters.active.fetch_add(1, Ordering::AcqRel);
        workflows.insert(id, Arc::clone(&workflow));
        Ok(workflow)
    }

    pub async fn get_workflow(&self, id: &str) -> Option<Arc<RecoveryWorkflow>> {
        self.workflows.read().await.get(id).cloned()
    }

    /// Remove a workflow, refusing while `InProgress` (§3 invariant c).
    pub async fn remove_workflow(&self, id: &str) -> Result<(), RecoveryManagerError> {
        let workflows = self.workflows.read().await;
        let workflow = workflows.get(id).ok_or_else(|| RecoveryManagerError::NotFound(id.to_string()))?;
        if workflow.state().await == WorkflowState::InProgress {
            return Err(RecoveryManagerError::InProgress(id.to_string()));
        }
        drop(workflows);
        self.workflows.write().await.remove(id);
        Ok(())
    }

    pub fn metrics(&self) -> RecoveryMetrics {
        RecoveryMetrics {
            total: self.counters.total.load(Ordering::Acquire),
            successful: self.counters.successful.load(Ordering::Acquire),
            failed: self.counters.failed.load(Ordering::Acquire),
            rolled_back: self.counters.rolled_back.load(Ordering::Acquire),
            active: self.counters.active.load(Ordering::Acquire),
        }
    }

    /// Run every registered validator against `state`; the first failure
    /// wins.
    pub async fn validate_state(&self, state: &str) -> Result<(), StateValidationError> {
        let validators = self.validators.read().await;
        for validator in validators.iter() {
            if let Err(cause) = validator.validate(state).await {
                return Err(StateValidationError { validator: validator.name().to_string(), cause });
            }
        }
        Ok(())
    }
}
