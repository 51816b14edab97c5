//! Composition of breakers, retries and fallbacks around a raw operation.
//!
//! The canonical order is `retry(circuit_breaker(operation))`: every retry attempt asks the
//! breaker for a fresh permission, each physical call is recorded in the breaker's window, and
//! a breaker that opens mid-sequence turns the remaining attempts into `NotPermitted` failures
//! that still consume the retry budget.
//!
//! ```rust
//! use tripwire::{CircuitBreaker, Decorators, InstantSleeper, ResilienceError, Retry};
//!
//! #[derive(Debug)]
//! struct Unavailable;
//! impl std::fmt::Display for Unavailable { fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "unavailable") } }
//! impl std::error::Error for Unavailable {}
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let decorated = Decorators::of(|| async { Err::<String, _>(Unavailable) })
//!     .with_circuit_breaker(CircuitBreaker::of_defaults("backend"))
//!     .with_retry(Retry::of_defaults("backend").with_sleeper(InstantSleeper))
//!     .with_fallback(|error: ResilienceError<Unavailable>| match error.last_failure() {
//!         ResilienceError::NotPermitted { .. } => "circuit open".to_string(),
//!         _ => "recovered".to_string(),
//!     });
//! assert_eq!(decorated.call().await.unwrap(), "recovered");
//! # });
//! ```

use crate::circuit_breaker::CircuitBreaker;
use crate::error::ResilienceError;
use crate::retry::Retry;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;

/// Wrap `operation` so every invocation goes through `breaker`.
///
/// The returned closure is reusable and cheap to clone.
pub fn decorate_circuit_breaker<T, E, Fut, Op>(
    breaker: &CircuitBreaker,
    operation: Op,
) -> impl Fn() -> BoxFuture<'static, Result<T, ResilienceError<E>>> + Clone + Send + Sync
where
    Op: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: std::error::Error + Send + 'static,
{
    let breaker = breaker.clone();
    let operation = Arc::new(operation);
    move || -> BoxFuture<'static, Result<T, ResilienceError<E>>> {
        let breaker = breaker.clone();
        let operation = operation.clone();
        Box::pin(async move { breaker.execute(|| operation()).await })
    }
}

/// Wrap `operation` so every invocation goes through `retry`.
///
/// `operation` may fail with `E` or with a `ResilienceError<E>` (for example a breaker-decorated
/// operation).
pub fn decorate_retry<T, E, Err, Fut, Op>(
    retry: &Retry<E>,
    operation: Op,
) -> impl Fn() -> BoxFuture<'static, Result<T, ResilienceError<E>>> + Clone + Send + Sync
where
    Op: Fn() -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, Err>> + Send + 'static,
    Err: Into<ResilienceError<E>> + 'static,
    T: Send + 'static,
    E: std::error::Error + Send + Sync + 'static,
{
    let retry = retry.clone();
    let operation = Arc::new(operation);
    move || -> BoxFuture<'static, Result<T, ResilienceError<E>>> {
        let retry = retry.clone();
        let operation = operation.clone();
        Box::pin(async move { retry.execute(|| operation()).await })
    }
}

type Fallback<T, E> = Arc<dyn Fn(ResilienceError<E>) -> T + Send + Sync>;

/// Builder-style composition: breaker innermost, retry around it, fallback outermost,
/// regardless of the order the `with_*` methods are called in.
pub struct Decorators<T, E, Op> {
    operation: Op,
    breaker: Option<CircuitBreaker>,
    retry: Option<Retry<E>>,
    fallback: Option<Fallback<T, E>>,
}

impl<T, E, Op> Decorators<T, E, Op> {
    pub fn of(operation: Op) -> Self {
        Self { operation, breaker: None, retry: None, fallback: None }
    }

    pub fn with_circuit_breaker(mut self, breaker: CircuitBreaker) -> Self {
        self.breaker = Some(breaker);
        self
    }

    pub fn with_retry(mut self, retry: Retry<E>) -> Self {
        self.retry = Some(retry);
        self
    }

    /// Recover from the terminal error. The fallback sees the error after every other layer
    /// has given up, so it can switch on its kind.
    pub fn with_fallback<F>(mut self, fallback: F) -> Self
    where
        F: Fn(ResilienceError<E>) -> T + Send + Sync + 'static,
    {
        self.fallback = Some(Arc::new(fallback));
        self
    }

    /// Run the decorated operation once.
    pub async fn call<Fut>(&self) -> Result<T, ResilienceError<E>>
    where
        Op: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + 'static,
    {
        let operation = &self.operation;
        let result = match (&self.retry, &self.breaker) {
            (Some(retry), Some(breaker)) => retry.execute(move || breaker.execute(operation)).await,
            (Some(retry), None) => retry.execute(operation).await,
            (None, Some(breaker)) => breaker.execute(operation).await,
            (None, None) => operation().await.map_err(ResilienceError::Inner),
        };
        match (result, &self.fallback) {
            (Err(error), Some(fallback)) => {
                tracing::debug!(target: "tripwire::decorate", error = %error, "invoking fallback");
                Ok(fallback(error))
            }
            (result, _) => result,
        }
    }
}
