//! Compile-time prelude coverage test.
use std::time::Duration;
use tower::{service_fn, ServiceBuilder, ServiceExt};
use tripwire::prelude::*;
use tripwire::InstantSleeper;

#[tokio::test]
async fn prelude_reexports_core_types() {
    let _backoff = Backoff::constant(Duration::from_millis(100));
    let _jitter = Jitter::None;
    let breakers = CircuitBreakerRegistry::of_defaults();
    let retries = RetryRegistry::<std::io::Error>::new(RetryConfig::default());
    let breaker: CircuitBreaker = breakers.circuit_breaker("svc");
    let retry: Retry<std::io::Error> = retries.retry("svc").with_sleeper(InstantSleeper);

    let svc = ServiceBuilder::new()
        .layer(RetryLayer::new(retry))
        .layer(CircuitBreakerLayer::new(breaker.clone()))
        .service(service_fn(|_req: ()| async { Ok::<_, std::io::Error>(()) }));
    svc.oneshot(()).await.expect("service call failed");
    assert_eq!(breaker.state(), CircuitState::Closed);

    let decorated = Decorators::of(|| async { Ok::<_, std::io::Error>(1) })
        .with_circuit_breaker(breaker)
        .with_fallback(|_: ResilienceError<std::io::Error>| 0);
    assert_eq!(decorated.call().await.unwrap(), 1);
    let _ = CircuitBreakerConfig::default();
    let _: Option<PolicyEvent> = None;
}
