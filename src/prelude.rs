//! Convenient re-exports for common tripwire types.
pub use crate::{
    backoff::Backoff,
    circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState},
    decorate::{decorate_circuit_breaker, decorate_retry, Decorators},
    error::ResilienceError,
    jitter::Jitter,
    layer::{CircuitBreakerLayer, RetryLayer},
    registry::{CircuitBreakerRegistry, RetryRegistry},
    retry::{Retry, RetryConfig},
    telemetry::PolicyEvent,
};
