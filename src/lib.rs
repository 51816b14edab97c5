#![forbid(unsafe_code)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # tripwire
//!
//! Circuit breaker and retry for async Rust.
//!
//! ## Features
//!
//! - **Circuit breakers** driven by a count-based sliding window, tripping on failure rate or
//!   slow-call rate, with half-open probing and manual state control
//! - **Retries** with bounded attempts, constant/linear/exponential/custom backoff and jitter
//! - **Composition**: `retry(circuit_breaker(operation))`, where every physical attempt is
//!   admitted and recorded by the breaker
//! - **Registries** handing out one shared instance per name
//! - **Events** for every transition and attempt, plus `tracing` logs
//! - **Tower layers** for both policies
//!
//! ## Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use tripwire::{CircuitBreakerConfig, CircuitBreakerRegistry, RetryConfig, RetryRegistry};
//!
//! #[tokio::main]
//! async fn main() {
//!     let breakers = CircuitBreakerRegistry::new(
//!         CircuitBreakerConfig::builder()
//!             .failure_rate_threshold(50.0)
//!             .minimum_number_of_calls(5)
//!             .wait_duration_in_open_state(Duration::from_secs(10))
//!             .build()
//!             .unwrap(),
//!     );
//!     let retries = RetryRegistry::<std::io::Error>::new(
//!         RetryConfig::builder().max_attempts(3).wait_duration(Duration::from_millis(10)).build().unwrap(),
//!     );
//!
//!     let breaker = breakers.circuit_breaker("backendA");
//!     let retry = retries.retry("backendA");
//!     let result = retry
//!         .execute(|| breaker.execute(|| async { Ok::<_, std::io::Error>("response") }))
//!         .await;
//!     assert_eq!(result.unwrap(), "response");
//! }
//! ```

pub mod backoff;
pub mod circuit_breaker;
pub mod clock;
pub mod decorate;
pub mod error;
pub mod jitter;
pub mod layer;
pub mod prelude;
pub mod registry;
pub mod retry;
pub mod sleeper;
pub mod sliding_window;
pub mod telemetry;

// Re-exports
pub use backoff::{Backoff, BackoffError, MAX_BACKOFF};
pub use circuit_breaker::{
    CallNotPermitted, CallOutcome, CircuitBreaker, CircuitBreakerConfig,
    CircuitBreakerConfigBuilder, CircuitBreakerMetrics, CircuitState, Permit,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use decorate::{decorate_circuit_breaker, decorate_retry, Decorators};
pub use error::{ConfigError, IllegalStateTransition, ResilienceError, MAX_RETRY_FAILURES};
pub use jitter::Jitter;
pub use layer::{CircuitBreakerLayer, CircuitBreakerService, RetryLayer, RetryService};
pub use registry::{
    CircuitBreakerRegistry, CircuitBreakerRegistryBuilder, RegistryError, RegistryEvent,
    RetryRegistry, RetryRegistryBuilder,
};
pub use retry::{Retry, RetryConfig, RetryConfigBuilder, RetryMetrics};
pub use sleeper::{InstantSleeper, Sleeper, TokioSleeper, TrackingSleeper};
pub use sliding_window::{Outcome, SlidingWindow, WindowSnapshot};
