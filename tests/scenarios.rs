//! End-to-end scenario tests exercising the coordinator's public surface.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use resilience_core::{
    Backend, BoxError, CircuitBreakerConfig, ConnectionManagerConfig, HealthMonitorConfig, HealthProbe, OperationConfig,
    OperationType, RecoveryAction, ResilienceCoordinator, ResilienceCoordinatorConfig, RetryPolicy,
};
use tokio_util::sync::CancellationToken;

fn io_err(msg: &str) -> BoxError {
    Box::new(std::io::Error::new(std::io::ErrorKind::Other, msg.to_string()))
}

// S1: breaker trips after `failure_threshold` failures and the next call
// fails fast without invoking the operation.
#[tokio::test]
async fn s1_breaker_trip() {
    let coordinator = ResilienceCoordinator::new(ResilienceCoordinatorConfig {
        network_breaker: CircuitBreakerConfig { failure_threshold: 2, recovery_timeout: Duration::from_secs(60), ..Default::default() },
        connection_manager: None,
        ..Default::default()
    });
    coordinator
        .configure_operation(OperationType::Write, OperationConfig { retry_policy: RetryPolicy { max_retries: 0, ..Default::default() }, ..Default::default() })
        .await;

    let cancel = CancellationToken::new();
    let calls = Arc::new(AtomicUsize::new(0));

    for _ in 0..2 {
        let calls = calls.clone();
        let result: Result<(), _> = coordinator
            .execute_resilient_operation(&cancel, OperationType::Write, || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(io_err("boom"))
                }
            })
            .await;
        assert!(result.is_err());
    }
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let calls = calls.clone();
    let result: Result<(), _> = coordinator
        .execute_resilient_operation(&cancel, OperationType::Write, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        })
        .await;
    assert!(result.unwrap_err().is_circuit_open());
    assert_eq!(calls.load(Ordering::SeqCst), 2, "the third call must not invoke the function");
}

// S2: after the recovery timeout elapses, a successful probe closes the
// breaker again.
#[tokio::test]
async fn s2_recovery() {
    let coordinator = ResilienceCoordinator::new(ResilienceCoordinatorConfig {
        network_breaker: CircuitBreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_millis(30),
            success_threshold: 1,
            ..Default::default()
        },
        connection_manager: None,
        ..Default::default()
    });
    coordinator
        .configure_operation(OperationType::Read, OperationConfig { retry_policy: RetryPolicy { max_retries: 0, ..Default::default() }, ..Default::default() })
        .await;
    let cancel = CancellationToken::new();

    let result: Result<(), _> =
        coordinator.execute_resilient_operation(&cancel, OperationType::Read, || async { Err(io_err("down")) }).await;
    assert!(result.is_err());

    tokio::time::sleep(Duration::from_millis(50)).await;

    let result =
        coordinator.execute_resilient_operation(&cancel, OperationType::Read, || async { Ok::<_, BoxError>(1) }).await;
    assert_eq!(result.unwrap(), 1);
}

// S3: two transient failures then success yields exactly three attempts and
// a successful result.
#[tokio::test]
async fn s3_retry_to_success() {
    let coordinator = ResilienceCoordinator::new(ResilienceCoordinatorConfig {
        connection_manager: None,
        ..Default::default()
    });
    coordinator
        .configure_operation(
            OperationType::Read,
            OperationConfig {
                retry_policy: RetryPolicy::new(2, Duration::from_millis(5), Duration::from_millis(50), 2.0, false).unwrap(),
                ..Default::default()
            },
        )
        .await;
    let cancel = CancellationToken::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let a = attempts.clone();

    let result = coordinator
        .execute_resilient_operation(&cancel, OperationType::Read, move || {
            let a = a.clone();
            async move {
                let n = a.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(io_err("temporary failure"))
                } else {
                    Ok::<_, BoxError>(())
                }
            }
        })
        .await;
    assert!(result.is_ok());
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

// S4: a non-retryable classification stops after exactly one attempt.
#[tokio::test]
async fn s4_permanent_no_retry() {
    let coordinator = ResilienceCoordinator::new(ResilienceCoordinatorConfig {
        connection_manager: None,
        ..Default::default()
    });
    coordinator
        .configure_operation(
            OperationType::Read,
            OperationConfig {
                retry_policy: RetryPolicy::new(2, Duration::from_millis(5), Duration::from_millis(50), 2.0, false).unwrap(),
                ..Default::default()
            },
        )
        .await;
    let cancel = CancellationToken::new();
    let attempts = Arc::new(AtomicUsize::new(0));
    let a = attempts.clone();

    let result: Result<(), _> = coordinator
        .execute_resilient_operation(&cancel, OperationType::Read, move || {
            let a = a.clone();
            async move {
                a.fetch_add(1, Ordering::SeqCst);
                Err(Box::new(std::io::Error::new(std::io::ErrorKind::NotFound, "file not found")) as BoxError)
            }
        })
        .await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    let err = result.unwrap_err();
    let kind = err.kind().expect("classified error carries a kind");
    assert_eq!(kind, resilience_core::ErrorKind::Permanent);
}

// S5: the second of three steps fails; step one rolls back, step two is
// marked failed, step three never runs.
struct RecordingStep {
    name: &'static str,
    should_fail: bool,
    log: Arc<std::sync::Mutex<Vec<String>>>,
}

#[async_trait]
impl RecoveryAction for RecordingStep {
    async fn execute(&self, _cancel: &CancellationToken) -> Result<(), BoxError> {
        self.log.lock().unwrap().push(format!("{}:execute", self.name));
        if self.should_fail {
            return Err(io_err("step failed"));
        }
        Ok(())
    }

    async fn rollback(&self, _cancel: &CancellationToken) -> Result<(), BoxError> {
        self.log.lock().unwrap().push(format!("{}:rollback", self.name));
        Ok(())
    }

    fn id(&self) -> &str {
        self.name
    }

    fn description(&self) -> &str {
        self.name
    }
}

#[tokio::test]
async fn s5_workflow_rollback() {
    let coordinator = ResilienceCoordinator::new(ResilienceCoordinatorConfig {
        connection_manager: None,
        ..Default::default()
    });
    let log = Arc::new(std::sync::Mutex::new(Vec::new()));

    let workflow = coordinator.create_recovery_workflow("wf-1", "three step workflow").await.unwrap();
    workflow.add_step(Arc::new(RecordingStep { name: "step1", should_fail: false, log: log.clone() })).await.unwrap();
    workflow.add_step(Arc::new(RecordingStep { name: "step2", should_fail: true, log: log.clone() })).await.unwrap();
    workflow.add_step(Arc::new(RecordingStep { name: "step3", should_fail: false, log: log.clone() })).await.unwrap();

    let cancel = CancellationToken::new();
    let result = workflow.execute(&cancel).await;
    assert!(result.is_err());

    let steps = workflow.steps().await;
    assert_eq!(steps[0].state().await, resilience_core::StepState::RolledBack);
    assert_eq!(steps[1].state().await, resilience_core::StepState::Failed);
    assert_eq!(steps[2].state().await, resilience_core::StepState::Idle);
    assert_eq!(workflow.state().await, resilience_core::WorkflowState::RolledBack);

    let recorded = log.lock().unwrap().clone();
    assert_eq!(recorded, vec!["step1:execute", "step2:execute", "step1:rollback"]);
}

// S6: a failing primary probe hands traffic to a still-healthy secondary and
// fires the failover callback with (from, to).
struct FlakyProbe {
    healthy: Arc<std::sync::atomic::AtomicBool>,
}

#[async_trait]
impl HealthProbe for FlakyProbe {
    async fn check(&self) -> Result<(), BoxError> {
        if self.healthy.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(io_err("probe failed"))
        }
    }
}

struct AlwaysHealthy;

#[async_trait]
impl HealthProbe for AlwaysHealthy {
    async fn check(&self) -> Result<(), BoxError> {
        Ok(())
    }
}

#[tokio::test]
async fn s6_failover() {
    let coordinator = ResilienceCoordinator::new(ResilienceCoordinatorConfig {
        connection_manager: Some(ConnectionManagerConfig {
            health: HealthMonitorConfig {
                check_interval: Duration::from_millis(5),
                probe_timeout: Duration::from_millis(20),
                ..Default::default()
            },
            ..Default::default()
        }),
        ..Default::default()
    });

    let primary_healthy = Arc::new(std::sync::atomic::AtomicBool::new(true));
    coordinator
        .add_backend(
            Backend { id: "primary".into(), name: "primary".into(), address: "p:1".into(), priority: 1, primary: true },
            Arc::new(FlakyProbe { healthy: primary_healthy.clone() }),
        )
        .await
        .unwrap();
    coordinator
        .add_backend(
            Backend { id: "secondary".into(), name: "secondary".into(), address: "s:1".into(), priority: 2, primary: false },
            Arc::new(AlwaysHealthy),
        )
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(30)).await;
    primary_healthy.store(false, Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(60)).await;

    let cancel = CancellationToken::new();
    let result = coordinator
        .execute_resilient_operation_with_backend(&cancel, OperationType::Read, |_ctx, backend| async move {
            // the operation itself fails against a backend its own health
            // monitor has marked unavailable, mirroring a real unreachable host.
            if backend.status().await == resilience_core::BackendStatus::Active {
                Ok(backend.backend().id.clone())
            } else {
                Err(io_err("backend unreachable"))
            }
        })
        .await;
    assert_eq!(result.unwrap(), "secondary");
    assert_eq!(coordinator.get_metrics().recoveries, 1);
    coordinator.stop().await;
}
