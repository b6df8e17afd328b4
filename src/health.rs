//! Health Monitor (`spec.md` §4.4): one background task per registered
//! component runs a ticker, folding probe results into a per-component
//! hysteresis state machine (Healthy → Degraded → Unhealthy → Critical).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::BoxError;

/// A user-supplied health probe for one component.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn check(&self) -> Result<(), BoxError>;
}

#[async_trait]
impl<F, Fut> HealthProbe for F
where
    F: Fn() -> Fut + Send + Sync,
    Fut: std::future::Future<Output = Result<(), BoxError>> + Send,
{
    async fn check(&self) -> Result<(), BoxError> {
        (self)().await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HealthStatus {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
    Critical,
}

impl HealthStatus {
    /// Ordering used for "overall = max-severity across components". Unknown
    /// sorts below Healthy so a single unregistered/never-checked component
    /// does not mask a genuinely healthy fleet, but ties with no components
    /// registered still resolve to Unknown via `HealthMonitor::overall`.
    fn severity(self) -> u8 {
        match self {
            HealthStatus::Unknown => 0,
            HealthStatus::Healthy => 1,
            HealthStatus::Degraded => 2,
            HealthStatus::Unhealthy => 3,
            HealthStatus::Critical => 4,
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthThresholds {
    pub degraded: usize,
    pub unhealthy: usize,
    pub critical: usize,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self { degraded: 1, unhealthy: 3, critical: 5 }
    }
}

#[derive(Debug, Clone)]
pub struct HealthMonitorConfig {
    pub check_interval: Duration,
    pub probe_timeout: Duration,
    pub thresholds: HealthThresholds,
    pub max_recent_results: usize,
}

impl Default for HealthMonitorConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(5),
            thresholds: HealthThresholds::default(),
            max_recent_results: 20,
        }
    }
}

/// A deep-copied, race-free view of one component's health.
#[derive(Debug, Clone)]
pub struct ComponentHealthSnapshot {
    pub name: String,
    pub status: HealthStatus,
    pub consecutive_failures: usize,
    pub total_checks: u64,
    pub total_failures: u64,
    pub avg_duration: Duration,
    pub recent_results: Vec<bool>,
    pub last_check: Option<Instant>,
    pub last_healthy: Option<Instant>,
}

struct ComponentState {
    status: HealthStatus,
    consecutive_failures: usize,
    total_checks: u64,
    total_failures: u64,
    avg_duration: Duration,
    recent_results: VecDeque<bool>,
    last_check: Option<Instant>,
    last_healthy: Option<Instant>,
}

impl ComponentState {
    fn new() -> Self {
        Self {
            status: HealthStatus::Unknown,
            consecutive_failures: 0,
            total_checks: 0,
            total_failures: 0,
            avg_duration: Duration::ZERO,
            recent_results: VecDeque::new(),
            last_check: None,
            last_healthy: None,
        }
    }

    fn snapshot(&self, name: &str) -> ComponentHealthSnapshot {
        ComponentHealthSnapshot {
            name: name.to_string(),
            status: self.status,
            consecutive_failures: self.consecutive_failures,
            total_checks: self.total_checks,
            total_failures: self.total_failures,
            avg_duration: self.avg_duration,
            recent_results: self.recent_results.iter().copied().collect(),
            last_check: self.last_check,
            last_healthy: self.last_healthy,
        }
    }

    fn fold(&mut self, ok: bool, duration: Duration, thresholds: &HealthThresholds, max_recent: usize) -> (HealthStatus, HealthStatus) {
        let old = self.status;
        let now = Instant::now();

        self.total_checks += 1;
        let delta = duration.as_secs_f64() - self.avg_duration.as_secs_f64();
        let avg_secs = self.avg_duration.as_secs_f64() + delta / self.total_checks as f64;
        self.avg_duration = Duration::from_secs_f64(avg_secs.max(0.0));

        self.recent_results.push_back(ok);
        if self.recent_results.len() > max_recent {
            self.recent_results.pop_front();
        }
        self.last_check = Some(now);

        if ok {
            self.consecutive_failures = 0;
            self.status = HealthStatus::Healthy;
            self.last_healthy = Some(now);
        } else {
            self.total_failures += 1;
            self.consecutive_failures += 1;
            if self.consecutive_failures >= thresholds.critical {
                self.status = HealthStatus::Critical;
            } else if self.consecutive_failures >= thresholds.unhealthy {
                self.status = HealthStatus::Unhealthy;
            } else if self.consecutive_failures >= thresholds.degraded {
                self.status = HealthStatus::Degraded;
            }
        }

        (old, self.status)
    }
}

struct ComponentEntry {
    state: Arc<RwLock<ComponentState>>,
    task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum HealthError {
    AlreadyRegistered(String),
    NotFound(String),
}

impl std::fmt::Display for HealthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyRegistered(name) => write!(f, "component '{}' is already registered", name),
            Self::NotFound(name) => write!(f, "component '{}' is not registered", name),
        }
    }
}

impl std::error::Error for HealthError {}

type StatusChangeCallback =
    Arc<dyn Fn(String, HealthStatus, HealthStatus) -> futures::future::BoxFuture<'static, ()> + Send + Sync>;

/// Owns per-component background polling tasks and their folded health
/// state. Dropped tasks are cancelled via [`HealthMonitor::stop`].
pub struct HealthMonitor {
    config: HealthMonitorConfig,
    components: RwLock<HashMap<String, Arc<ComponentEntry>>>,
    on_status_change: Option<StatusChangeCallback>,
    cancel: CancellationToken,
}

impl HealthMonitor {
    pub fn new(config: HealthMonitorConfig) -> Arc<Self> {
        Arc::new(Self { config, components: RwLock::new(HashMap::new()), on_status_change: None, cancel: CancellationToken::new() })
    }

    pub fn with_status_change_callback<F, Fut>(mut self: Arc<Self>, callback: F) -> Arc<Self>
    where
        F: Fn(String, HealthStatus, HealthStatus) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        Arc::get_mut(&mut self)
            .expect("callback must be installed before the monitor is shared")
            .on_status_change = Some(Arc::new(move |name, old, new| Box::pin(callback(name, old, new))));
        self
    }

    /// Register a component and spawn its polling task.
    pub async fn register_component(
        self: &Arc<Self>,
        name: impl Into<String>,
        probe: Arc<dyn HealthProbe>,
    ) -> Result<(), HealthError> {
        let name = name.into();
        let mut components = self.components.write().await;
        if components.contains_key(&name) {
            return Err(HealthError::AlreadyRegistered(name));
        }

        let state = Arc::new(RwLock::new(ComponentState::new()));
        let monitor = Arc::clone(self);
        let task_name = name.clone();
        let task_state = Arc::clone(&state);
        let cancel = self.cancel.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = cancel.cancelled() => break,
                }

                let started = Instant::now();
                let outcome = tokio::select! {
                    result = tokio::time::timeout(monitor.config.probe_timeout, probe.check()) => {
                        matches!(result, Ok(Ok(())))
                    }
                    _ = cancel.cancelled() => break,
                };
                let elapsed = started.elapsed();

                let (old, new) = {
                    let mut guard = task_state.write().await;
                    guard.fold(outcome, elapsed, &monitor.config.thresholds, monitor.config.max_recent_results)
                };

                if old != new {
                    tracing::warn!(component = %task_name, ?old, ?new, "component health changed");
                    if let Some(cb) = monitor.on_status_change.clone() {
                        tokio::spawn(cb(task_name.clone(), old, new));
                    }
                } else {
                    tracing::debug!(component = %task_name, ?new, "health check completed");
                }
            }
        });

        components.insert(name, Arc::new(ComponentEntry { state, task: tokio::sync::Mutex::new(Some(task)) }));
        Ok(())
    }

    pub async fn unregister_component(&self, name: &str) -> Result<(), HealthError> {
        let mut components = self.components.write().await;
        match components.remove(name) {
            Some(entry) => {
                if let Some(handle) = entry.task.lock().await.take() {
                    handle.abort();
                }
                Ok(())
            }
            None => Err(HealthError::NotFound(name.to_string())),
        }
    }

    pub async fn snapshot(&self, name: &str) -> Option<ComponentHealthSnapshot> {
        let components = self.components.read().await;
        let entry = components.get(name)?;
        let state = entry.state.read().await;
        Some(state.snapshot(name))
    }

    /// Snapshot every registered component, keyed by name.
    pub async fn snapshot_all(&self) -> HashMap<String, ComponentHealthSnapshot> {
        let components = self.components.read().await;
        let mut out = HashMap::with_capacity(components.len());
        for (name, entry) in components.iter() {
            let state = entry.state.read().await;
            out.insert(name.clone(), state.snapshot(name));
        }
        out
    }

    /// Overall health = max-severity across components, or Unknown if none
    /// are registered.
    pub async fn overall(&self) -> HealthStatus {
        let components = self.components.read().await;
        let mut worst = HealthStatus::Unknown;
        for (name, entry) in components.iter() {
            let state = entry.state.read().await;
            let snap_status = state.snapshot(name).status;
            if snap_status.severity() > worst.severity() {
                worst = snap_status;
            }
        }
        worst
    }

    /// Count of components at each status level.
    pub async fn summary(&self) -> HashMap<HealthStatus, usize> {
        let components = self.components.read().await;
        let mut counts = HashMap::new();
        for entry in components.values() {
            let status = entry.state.read().await.status;
            *counts.entry(status).or_insert(0) += 1;
        }
        counts
    }

    /// Cancel every background task and wait for them to finish. Each task
    /// observes cancellation at its next `select!` point, so the wait is
    /// bounded by the longest outstanding probe timeout, not the check
    /// interval.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let components = self.components.read().await;
        for entry in components.values() {
            let handle = entry.task.lock().await.take();
            if let Some(handle) = handle {
                let _ = handle.await;
            }
        }
    }
}
