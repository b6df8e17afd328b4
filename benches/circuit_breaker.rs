use criterion::{black_box, criterion_group, criterion_main, Criterion};
use resilience_core::{BoxError, CircuitBreaker, CircuitBreakerConfig};

use std::time::Duration;

fn circuit_breaker_throughput_success(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 10,
        recovery_timeout: Duration::from_secs(30),
        ..Default::default()
    });

    c.bench_function("circuit_breaker_success", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(breaker.call(|| async { Ok::<_, BoxError>(black_box(1)) }).await);
        });
    });
}

fn circuit_breaker_throughput_rejected(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let breaker = CircuitBreaker::new(CircuitBreakerConfig {
        failure_threshold: 1,
        recovery_timeout: Duration::from_secs(30),
        ..Default::default()
    });
    rt.block_on(async {
        let _ = breaker
            .call(|| async { Err::<(), BoxError>(Box::new(std::io::Error::new(std::io::ErrorKind::Other, "boom"))) })
            .await;
    });

    c.bench_function("circuit_breaker_open_rejection", |b| {
        b.to_async(&rt).iter(|| async {
            let _ = black_box(breaker.call(|| async { Ok::<_, BoxError>(1) }).await);
        });
    });
}

criterion_group!(benches, circuit_breaker_throughput_success, circuit_breaker_throughput_rejected);
criterion_main!(benches);
