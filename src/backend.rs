//! Connection Manager (`spec.md` §4.5): holds backends with priority and
//! primary flags, selects the active backend from health, and fails over
//! on primary fault without corrupting in-flight retries.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use tokio::sync::RwLock;

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitOpenError, CircuitState};
use crate::error::BoxError;
use crate::health::{HealthMonitor, HealthMonitorConfig, HealthProbe, HealthStatus};

/// Immutable identity of a registered endpoint. Lower `priority` wins.
#[derive(Debug, Clone)]
pub struct Backend {
    pub id: String,
    pub name: String,
    pub address: String,
    pub priority: i64,
    pub primary: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Unknown,
    Active,
    Degraded,
    Inactive,
    Failed,
}

impl BackendStatus {
    fn from_health(status: HealthStatus) -> Self {
        match status {
            HealthStatus::Healthy => BackendStatus::Active,
            HealthStatus::Degraded => BackendStatus::Degraded,
            HealthStatus::Unhealthy | HealthStatus::Critical => BackendStatus::Inactive,
            HealthStatus::Unknown => BackendStatus::Unknown,
        }
    }

    fn is_available(self) -> bool {
        matches!(self, BackendStatus::Active | BackendStatus::Degraded)
    }
}

struct ConnectionState {
    status: BackendStatus,
    last_check: Option<Instant>,
}

/// The runtime binding of a [`Backend`] to its status and circuit breaker.
/// Status is written only by the health status-change callback; the
/// breaker is touched only by the execute path.
pub struct BackendConnection {
    backend: Backend,
    breaker: Arc<CircuitBreaker>,
    state: RwLock<ConnectionState>,
}

impl BackendConnection {
    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub async fn status(&self) -> BackendStatus {
        self.state.read().await.status
    }

    async fn is_available(&self) -> bool {
        let status = self.state.read().await.status;
        status.is_available() && !matches!(self.breaker.state(), CircuitState::Open)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConnectionManagerError {
    DuplicateBackend(String),
    NotFound(String),
}

impl std::fmt::Display for ConnectionManagerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DuplicateBackend(id) => write!(f, "backend '{}' is already registered", id),
            Self::NotFound(id) => write!(f, "backend '{}' is not registered", id),
        }
    }
}

impl std::error::Error for ConnectionManagerError {}

type FailoverCallback = Arc<dyn Fn(String, String) + Send + Sync>;
type BackendStatusCallback = Arc<dyn Fn(String, BackendStatus) + Send + Sync>;

#[derive(Debug, Clone)]
pub struct ConnectionManagerConfig {
    /// Template cloned (with the backend id substituted for `name`) for
    /// every backend's private circuit breaker.
    pub breaker_config: CircuitBreakerConfig,
    pub health: HealthMonitorConfig,
}

impl Default for ConnectionManagerConfig {
    fn default() -> Self {
        Self { breaker_config: CircuitBreakerConfig::default(), health: HealthMonitorConfig::default() }
    }
}

/// Owns the backend table and the health monitor that drives it. See
/// `spec.md` §4.5 for selection and failover rules.
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, Arc<BackendConnection>>>,
    primary: RwLock<Option<String>>,
    secondary: RwLock<Option<String>>,
    health: Arc<HealthMonitor>,
    breaker_config: CircuitBreakerConfig,
    on_failover: RwLock<Option<FailoverCallback>>,
    on_status_change: RwLock<Option<BackendStatusCallback>>,
}

impl ConnectionManager {
    pub fn new(config: ConnectionManagerConfig) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let weak = weak.clone();
            let health = HealthMonitor::new(config.health).with_status_change_callback(move |name, _old, new| {
                let weak = weak.clone();
                async move {
                    if let Some(manager) = weak.upgrade() {
                        manager.handle_health_status_change(name, new).await;
                    }
                }
            });

            Self {
                connections: RwLock::new(HashMap::new()),
                primary: RwLock::new(None),
                secondary: RwLock::new(None),
                health,
                breaker_config: config.breaker_config,
                on_failover: RwLock::new(None),
                on_status_change: RwLock::new(None),
            }
        })
    }

    pub fn with_failover_callback<F>(self: Arc<Self>, callback: F) -> Arc<Self>
    where
        F: Fn(String, String) + Send + Sync + 'static,
    {
        // can't use blocking_write here; caller is expected to install
        // callbacks before spawning traffic, so a best-effort try_write is
        // enough, matching the builder style of the other resilience types.
        if let Ok(mut guard) = self.on_failover.try_write() {
            *guard = Some(Arc::new(callback));
        }
        self
    }

    pub fn with_status_change_callback<F>(self: Arc<Self>, callback: F) -> Arc<Self>
    where
        F: Fn(String, BackendStatus) + Send + Sync + 'static,
    {
        if let Ok(mut guard) = self.on_status_change.try_write() {
            *guard = Some(Arc::new(callback));
        }
        self
    }

    async fn handle_health_status_change(&self, name: String, new: HealthStatus) {
        let mapped = BackendStatus::from_health(new);
        let changed = {
            let conns = self.connections.read().await;
            match conns.get(&name) {
                Some(conn) => {
                    let mut state = conn.state.write().await;
                    let prev = state.status;
                    state.status = mapped;
                    state.last_check = Some(Instant::now());
                    prev != mapped
                }
                None => false,
            }
        };
        if changed {
            if let Some(cb) = self.on_status_change.read().await.clone() {
                tokio::spawn(async move { cb(name, mapped) });
            }
        }
    }

    /// Register a backend and its probe. Updates primary/secondary per
    /// §4.5: `b.primary` or no current primary wins primary; otherwise a
    /// lower-priority (`<`) candidate becomes secondary.
    pub async fn add_backend(
        &self,
        backend: Backend,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<(), ConnectionManagerError> {
        let mut connections = self.connections.write().await;
        if connections.contains_key(&backend.id) {
            return Err(ConnectionManagerError::DuplicateBackend(backend.id));
        }

        let mut breaker_config = self.breaker_config.clone();
        breaker_config.name = backend.id.clone();
        let breaker = Arc::new(CircuitBreaker::new(breaker_config));

        let connection = Arc::new(BackendConnection {
            backend: backend.clone(),
            breaker,
            state: RwLock::new(ConnectionState { status: BackendStatus::Unknown, last_check: None }),
        });

        connections.insert(backend.id.clone(), connection);
        drop(connections);

        self.health
            .register_component(backend.id.clone(), probe)
            .await
            .map_err(|_| ConnectionManagerError::DuplicateBackend(backend.id.clone()))?;

        self.update_primary_secondary(&backend).await;
        Ok(())
    }

    async fn update_primary_secondary(&self, candidate: &Backend) {
        let mut primary = self.primary.write().await;
        if candidate.primary || primary.is_none() {
            let old_primary = primary.clone();
            *primary = Some(candidate.id.clone());
            drop(primary);
            // the bumped former primary becomes a secondary candidate too.
            if let Some(old_id) = old_primary {
                if old_id != candidate.id {
                    self.consider_secondary(&old_id).await;
                }
            }
            return;
        }
        drop(primary);
        self.consider_secondary(&candidate.id).await;
    }

    async fn consider_secondary(&self, candidate_id: &str) {
        let connections = self.connections.read().await;
        let candidate = match connections.get(candidate_id) {
            Some(c) => c.backend().clone(),
            None => return,
        };
        drop(connections);

        let mut secondary = self.secondary.write().await;
        let should_replace = match secondary.as_ref() {
            None => true,
            Some(current_id) => {
                let connections = self.connections.read().await;
                match connections.get(current_id) {
                    Some(current) => candidate.priority < current.backend().priority,
                    None => true,
                }
            }
        };
        if should_replace {
            *secondary = Some(candidate.id.clone());
        }
    }

    pub async fn remove_backend(&self, id: &str) -> Result<(), ConnectionManagerError> {
        let removed = {
            let mut connections = self.connections.write().await;
            connections.remove(id)
        };
        if removed.is_none() {
            return Err(ConnectionManagerError::NotFound(id.to_string()));
        }
        let _ = self.health.unregister_component(id).await;
        self.rescan_primary_secondary().await;
        Ok(())
    }

    /// Re-derive primary/secondary by best-priority availability, used
    /// after removal since the prior pointers may now be stale.
    async fn rescan_primary_secondary(&self) {
        let connections = self.connections.read().await;
        let mut candidates: Vec<Backend> = Vec::new();
        for conn in connections.values() {
            candidates.push(conn.backend().clone());
        }
        drop(connections);
        candidates.sort_by_key(|b| b.priority);

        let new_primary = candidates
            .iter()
            .find(|b| b.primary)
            .or_else(|| candidates.first())
            .map(|b| b.id.clone());
        let new_secondary = candidates
            .iter()
            .find(|b| Some(&b.id) != new_primary.as_ref())
            .map(|b| b.id.clone());

        *self.primary.write().await = new_primary;
        *self.secondary.write().await = new_secondary;
    }

    async fn connection(&self, id: &str) -> Option<Arc<BackendConnection>> {
        self.connections.read().await.get(id).cloned()
    }

    /// Public accessor for the coordinator, e.g. to register a backend's
    /// private breaker into a shared [`crate::circuit_breaker_registry::CircuitBreakerRegistry`].
    pub async fn get_connection(&self, id: &str) -> Option<Arc<BackendConnection>> {
        self.connection(id).await
    }

    /// The health monitor backing this manager's backends, for building an
    /// aggregate system health report.
    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub async fn stop(&self) {
        self.health.stop().await;
    }

    /// Primary if available, else secondary if available, else any
    /// available backend in unspecified order.
    pub async fn get_active_backend(&self) -> Option<Arc<BackendConnection>> {
        if let Some(id) = self.primary.read().await.clone() {
            if let Some(conn) = self.connection(&id).await {
                if conn.is_available().await {
                    return Some(conn);
                }
            }
        }
        if let Some(id) = self.secondary.read().await.clone() {
            if let Some(conn) = self.connection(&id).await {
                if conn.is_available().await {
                    return Some(conn);
                }
            }
        }
        let connections = self.connections.read().await;
        for conn in connections.values() {
            if conn.is_available().await {
                return Some(Arc::clone(conn));
            }
        }
        None
    }

    /// Run `op` under the primary's breaker; on a non-circuit-open failure,
    /// reassign primary to the current secondary and retry once under the
    /// new primary's breaker. Circuit-open failures propagate untouched
    /// because the secondary may already be the primary from a prior
    /// failover.
    ///
    /// Returns whether the value came back from the primary or only after a
    /// failover to the secondary, so a caller can count it as a recovery.
    pub async fn execute_with_failover<T, F, Fut>(&self, op: F) -> Result<(T, bool), BoxError>
    where
        F: Fn(Arc<BackendConnection>) -> Fut,
        Fut: std::future::Future<Output = Result<T, BoxError>>,
    {
        let primary_id = self.primary.read().await.clone().ok_or_else(no_backends_err)?;
        let primary = self.connection(&primary_id).await.ok_or_else(no_backends_err)?;

        let primary_clone = Arc::clone(&primary);
        let result = primary.breaker().call(|| op(Arc::clone(&primary_clone))).await;

        match result {
            Ok(value) => Ok((value, false)),
            Err(err) => {
                if err.downcast_ref::<CircuitOpenError>().is_some() {
                    return Err(err);
                }

                let secondary_id = self.secondary.read().await.clone();
                let secondary_id = match secondary_id {
                    Some(id) if id != primary_id => id,
                    _ => return Err(err),
                };
                let secondary = match self.connection(&secondary_id).await {
                    Some(conn) => conn,
                    None => return Err(err),
                };

                *self.primary.write().await = Some(secondary_id.clone());
                *self.secondary.write().await = Some(primary_id.clone());

                if let Some(cb) = self.on_failover.read().await.clone() {
                    let from = primary_id.clone();
                    let to = secondary_id.clone();
                    tokio::spawn(async move { cb(from, to) });
                }

                let secondary_clone = Arc::clone(&secondary);
                secondary.breaker().call(|| op(secondary_clone)).await.map(|value| (value, true))
            }
        }
    }
}

fn no_backends_err() -> BoxError {
    Box::new(std::io::Error::new(std::io::ErrorKind::NotFound, "no backends available"))
}
