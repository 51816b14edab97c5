//! Retry engine for fallible async operations.
//!
//! Semantics:
//! - `max_attempts` counts total attempts (initial try + retries).
//! - `ResilienceError::Inner(E)` is retried when the `retry_on_error` predicate accepts it and no
//!   `ignore_error` predicate matches. `NotPermitted` from a wrapped breaker is retried unless
//!   `retry_on_not_permitted(false)`. A nested `RetryExhausted` is never retried.
//! - The backoff is called with the 1-indexed attempt that just failed; jitter then randomizes
//!   the delay. The wait goes through an injectable [`Sleeper`].
//! - A non-retryable error propagates unchanged and counts as `failed_without_retry`. Running
//!   out of attempts returns [`ResilienceError::RetryExhausted`] and counts as
//!   `failed_with_retry`. Exactly one counter moves per call.
//!
//! Example
//! ```rust
//! use std::time::Duration;
//! use tripwire::{Backoff, InstantSleeper, ResilienceError, Retry, RetryConfig};
//!
//! #[derive(Debug)]
//! struct MyErr;
//! impl std::fmt::Display for MyErr { fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result { write!(f, "oops") } }
//! impl std::error::Error for MyErr {}
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let config = RetryConfig::<MyErr>::builder()
//!     .max_attempts(3)
//!     .backoff(Backoff::exponential(Duration::from_millis(100)))
//!     .build()
//!     .unwrap();
//! let retry = Retry::new("backend", config).with_sleeper(InstantSleeper);
//! let result: Result<(), ResilienceError<MyErr>> = retry.execute(|| async { Err(MyErr) }).await;
//! assert!(result.unwrap_err().is_retry_exhausted());
//! assert_eq!(retry.metrics().failed_with_retry, 1);
//! # });
//! ```

use crate::clock::{Clock, MonotonicClock};
use crate::error::{ConfigError, MAX_RETRY_FAILURES};
use crate::telemetry::{EventPublisher, PolicyEvent, RetryEvent, RetryEventKind};
use crate::{Backoff, Jitter, ResilienceError, Sleeper, TokioSleeper};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const RESULT_REJECTED: &str = "result rejected by retry predicate";

type ErrorPredicate<E> = Arc<dyn Fn(&E) -> bool + Send + Sync>;

/// Immutable retry configuration. Build with [`RetryConfig::builder`].
pub struct RetryConfig<E> {
    max_attempts: usize,
    backoff: Backoff,
    jitter: Jitter,
    retry_on_error: ErrorPredicate<E>,
    ignore_errors: Vec<ErrorPredicate<E>>,
    retry_on_not_permitted: bool,
}

impl<E> Clone for RetryConfig<E> {
    fn clone(&self) -> Self {
        Self {
            max_attempts: self.max_attempts,
            backoff: self.backoff.clone(),
            jitter: self.jitter,
            retry_on_error: self.retry_on_error.clone(),
            ignore_errors: self.ignore_errors.clone(),
            retry_on_not_permitted: self.retry_on_not_permitted,
        }
    }
}

impl<E> std::fmt::Debug for RetryConfig<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("backoff", &self.backoff)
            .field("jitter", &self.jitter)
            .field("retry_on_error", &"<predicate>")
            .field("ignore_errors", &self.ignore_errors.len())
            .field("retry_on_not_permitted", &self.retry_on_not_permitted)
            .finish()
    }
}

impl<E> Default for RetryConfig<E> {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Backoff::default(),
            jitter: Jitter::None,
            retry_on_error: Arc::new(|_| true),
            ignore_errors: Vec::new(),
            retry_on_not_permitted: true,
        }
    }
}

impl<E> RetryConfig<E> {
    pub fn builder() -> RetryConfigBuilder<E> {
        RetryConfigBuilder::default()
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    pub fn jitter(&self) -> Jitter {
        self.jitter
    }

    pub fn retry_on_not_permitted(&self) -> bool {
        self.retry_on_not_permitted
    }

    fn is_retryable(&self, error: &ResilienceError<E>) -> bool {
        match error {
            ResilienceError::Inner(e) => {
                !self.ignore_errors.iter().any(|p| p(e)) && (self.retry_on_error)(e)
            }
            ResilienceError::NotPermitted { .. } => self.retry_on_not_permitted,
            ResilienceError::RetryExhausted { .. } => false,
        }
    }
}

/// Builder for [`RetryConfig`].
pub struct RetryConfigBuilder<E> {
    config: RetryConfig<E>,
}

impl<E> Default for RetryConfigBuilder<E> {
    fn default() -> Self {
        Self { config: RetryConfig::default() }
    }
}

impl<E> RetryConfigBuilder<E> {
    /// Total attempts (initial + retries). Must be > 0.
    pub fn max_attempts(mut self, attempts: usize) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    /// Constant wait between attempts.
    pub fn wait_duration(mut self, wait: Duration) -> Self {
        self.config.backoff = Backoff::constant(wait);
        self
    }

    /// Attempt-dependent wait.
    pub fn backoff<B>(mut self, backoff: B) -> Self
    where
        B: Into<Backoff>,
    {
        self.config.backoff = backoff.into();
        self
    }

    pub fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.config.jitter = jitter;
        self
    }

    /// Predicate deciding whether a domain error is retryable.
    pub fn retry_on_error<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.config.retry_on_error = Arc::new(predicate);
        self
    }

    /// Domain errors matching `predicate` are never retried.
    pub fn ignore_error<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.config.ignore_errors.push(Arc::new(predicate));
        self
    }

    /// Whether a breaker rejection consumes an attempt and retries. Defaults to true.
    pub fn retry_on_not_permitted(mut self, retry: bool) -> Self {
        self.config.retry_on_not_permitted = retry;
        self
    }

    pub fn build(self) -> Result<RetryConfig<E>, ConfigError> {
        if self.config.max_attempts == 0 {
            return Err(ConfigError::ZeroCount { field: "max_attempts", value: 0 });
        }
        Ok(self.config)
    }
}

/// Completed-call counters for one retry instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetryMetrics {
    pub successful_without_retry: u64,
    pub successful_with_retry: u64,
    pub failed_without_retry: u64,
    pub failed_with_retry: u64,
}

#[derive(Debug, Default)]
struct RetryCounters {
    successful_without_retry: AtomicU64,
    successful_with_retry: AtomicU64,
    failed_without_retry: AtomicU64,
    failed_with_retry: AtomicU64,
}

struct RetryShared<E> {
    name: Arc<str>,
    config: RetryConfig<E>,
    sleeper: Arc<dyn Sleeper>,
    clock: Arc<dyn Clock>,
    counters: RetryCounters,
    events: EventPublisher,
}

/// Named retry instance. Clones share configuration, counters and event consumers.
pub struct Retry<E> {
    inner: Arc<RetryShared<E>>,
}

impl<E> Clone for Retry<E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<E> std::fmt::Debug for Retry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retry")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .field("sleeper", &self.inner.sleeper)
            .finish()
    }
}

impl<E> Retry<E>
where
    E: std::error::Error + 'static,
{
    pub fn new(name: impl Into<Arc<str>>, config: RetryConfig<E>) -> Self {
        Self::from_parts(
            name.into(),
            config,
            Arc::new(MonotonicClock::default()),
            Arc::new(TokioSleeper),
        )
    }

    pub fn of_defaults(name: impl Into<Arc<str>>) -> Self {
        Self::new(name, RetryConfig::default())
    }

    /// Replace the sleeper used between attempts. Returns a fresh instance with zeroed metrics.
    pub fn with_sleeper<S: Sleeper + 'static>(self, sleeper: S) -> Self {
        let clock = self.inner.clock.clone();
        self.with_shared_parts(clock, Arc::new(sleeper))
    }

    /// Replace the clock used for event timestamps.
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        let sleeper = self.inner.sleeper.clone();
        self.with_shared_parts(Arc::new(clock), sleeper)
    }

    pub(crate) fn with_shared_parts(self, clock: Arc<dyn Clock>, sleeper: Arc<dyn Sleeper>) -> Self {
        Self::from_parts(self.inner.name.clone(), self.inner.config.clone(), clock, sleeper)
    }

    fn from_parts(
        name: Arc<str>,
        config: RetryConfig<E>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            inner: Arc::new(RetryShared {
                name,
                config,
                sleeper,
                clock,
                counters: RetryCounters::default(),
                events: EventPublisher::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &RetryConfig<E> {
        &self.inner.config
    }

    pub fn event_publisher(&self) -> &EventPublisher {
        &self.inner.events
    }

    pub fn ptr_eq(&self, other: &Retry<E>) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn metrics(&self) -> RetryMetrics {
        let c = &self.inner.counters;
        RetryMetrics {
            successful_without_retry: c.successful_without_retry.load(Ordering::Acquire),
            successful_with_retry: c.successful_with_retry.load(Ordering::Acquire),
            failed_without_retry: c.failed_without_retry.load(Ordering::Acquire),
            failed_with_retry: c.failed_with_retry.load(Ordering::Acquire),
        }
    }

    /// Execute `operation` until it succeeds, fails with a non-retryable error, or runs out of
    /// attempts.
    ///
    /// The operation may fail with `E` directly or with a `ResilienceError<E>` produced by an
    /// inner breaker.
    pub async fn execute<T, Err, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Err>>,
        Err: Into<ResilienceError<E>>,
    {
        self.run(operation, None).await
    }

    /// Like [`Retry::execute`], additionally retrying successful results for which
    /// `retry_on_result` returns true. When attempts run out the last result is returned as-is.
    pub async fn execute_with_result_predicate<T, Err, Fut, Op, P>(
        &self,
        operation: Op,
        retry_on_result: P,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Err>>,
        Err: Into<ResilienceError<E>>,
        P: Fn(&T) -> bool + Sync,
    {
        self.run(operation, Some(&retry_on_result)).await
    }

    async fn run<T, Err, Fut, Op>(
        &self,
        mut operation: Op,
        retry_on_result: Option<&(dyn Fn(&T) -> bool + Sync)>,
    ) -> Result<T, ResilienceError<E>>
    where
        Op: FnMut() -> Fut,
        Fut: Future<Output = Result<T, Err>>,
        Err: Into<ResilienceError<E>>,
    {
        let config = &self.inner.config;
        let counters = &self.inner.counters;
        let mut failures: Vec<ResilienceError<E>> = Vec::new();
        let mut attempt = 0;

        loop {
            attempt += 1;
            let outcome = operation().await.map_err(Into::into);
            match outcome {
                Ok(value) => {
                    let rejected = retry_on_result.is_some_and(|p| p(&value));
                    if !rejected {
                        let counter = if attempt == 1 {
                            &counters.successful_without_retry
                        } else {
                            &counters.successful_with_retry
                        };
                        counter.fetch_add(1, Ordering::AcqRel);
                        self.emit(RetryEventKind::Success { attempts: attempt });
                        return Ok(value);
                    }
                    if attempt >= config.max_attempts {
                        counters.failed_with_retry.fetch_add(1, Ordering::AcqRel);
                        tracing::warn!(
                            target: "tripwire::retry",
                            name = %self.inner.name,
                            attempts = attempt,
                            "retry exhausted with a rejected result"
                        );
                        self.emit(RetryEventKind::Error {
                            attempts: attempt,
                            error: RESULT_REJECTED.to_string(),
                        });
                        return Ok(value);
                    }
                    self.wait(attempt, RESULT_REJECTED.to_string()).await;
                }
                Err(error) => {
                    if !config.is_retryable(&error) {
                        counters.failed_without_retry.fetch_add(1, Ordering::AcqRel);
                        tracing::debug!(
                            target: "tripwire::retry",
                            name = %self.inner.name,
                            attempt,
                            error = %error,
                            "error is not retryable"
                        );
                        self.emit(RetryEventKind::IgnoredError { error: error.to_string() });
                        return Err(error);
                    }

                    let message = error.to_string();
                    failures.push(error);
                    if failures.len() > MAX_RETRY_FAILURES {
                        failures.remove(0);
                    }

                    if attempt >= config.max_attempts {
                        counters.failed_with_retry.fetch_add(1, Ordering::AcqRel);
                        tracing::warn!(
                            target: "tripwire::retry",
                            name = %self.inner.name,
                            attempts = attempt,
                            error = %message,
                            "retry exhausted"
                        );
                        self.emit(RetryEventKind::Error { attempts: attempt, error: message });
                        return Err(ResilienceError::retry_exhausted(
                            self.inner.name.clone(),
                            attempt,
                            failures,
                        ));
                    }
                    self.wait(attempt, message).await;
                }
            }
        }
    }

    async fn wait(&self, attempt: usize, error: String) {
        let config = &self.inner.config;
        let delay = config.jitter.apply(config.backoff.delay(attempt));
        tracing::debug!(
            target: "tripwire::retry",
            name = %self.inner.name,
            attempt,
            wait_ms = delay.as_millis() as u64,
            error = %error,
            "retrying after failed attempt"
        );
        self.emit(RetryEventKind::Retry { attempt, wait: delay, error });
        self.inner.sleeper.sleep(delay).await;
    }

    fn emit(&self, kind: RetryEventKind) {
        if !self.inner.events.has_consumers() {
            return;
        }
        self.inner.events.publish(&PolicyEvent::Retry(RetryEvent {
            name: self.inner.name.clone(),
            timestamp_millis: self.inner.clock.now_millis(),
            kind,
        }));
    }
}
