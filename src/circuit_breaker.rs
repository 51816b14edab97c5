//! Circuit breaker backed by a count-based sliding window.
//!
//! # States
//!
//! - **Closed**: every call is permitted and its outcome recorded. Once the window holds at least
//!   `minimum_number_of_calls` outcomes, the breaker opens as soon as the failure rate or the
//!   slow-call rate is strictly greater than its threshold.
//! - **Open**: every call is rejected with [`ResilienceError::NotPermitted`] without invoking the
//!   operation. With `automatic_transition_from_open_to_half_open` enabled the breaker reports
//!   `HalfOpen` once `wait_duration_in_open_state` has elapsed; otherwise it stays open until a
//!   manual transition.
//! - **HalfOpen**: at most `permitted_number_of_calls_in_half_open_state` trial calls are admitted.
//!   When that many outcomes are recorded the rates are evaluated again: tripped → Open,
//!   otherwise → Closed.
//!
//! ```text
//! Closed ──[rate > threshold]──> Open ──[wait elapsed]──> HalfOpen
//!   ▲                             ▲                          │
//!   │                             └──[trial rate > threshold]┤
//!   └───────────────────────[trials healthy]─────────────────┘
//! ```
//!
//! State, window, open timestamp and the half-open permit count share one mutex, so every
//! decision and the transition it causes form a single critical section. Events are queued
//! inside that section and delivered after the lock is released, so consumers see them in
//! decision order even when callers race. A caller that finds another thread already delivering
//! leaves its events to that thread.
//!
//! # Example
//! ```rust
//! use tripwire::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
//!
//! # tokio::runtime::Runtime::new().unwrap().block_on(async {
//! let config = CircuitBreakerConfig::builder()
//!     .failure_rate_threshold(50.0)
//!     .minimum_number_of_calls(5)
//!     .build()
//!     .unwrap();
//! let breaker = CircuitBreaker::new("backend", config);
//! let value = breaker.execute(|| async { Ok::<_, std::io::Error>(42) }).await.unwrap();
//! assert_eq!(value, 42);
//! assert_eq!(breaker.state(), CircuitState::Closed);
//! # });
//! ```

use crate::clock::{Clock, MonotonicClock};
use crate::error::{ConfigError, IllegalStateTransition, ResilienceError};
use crate::sliding_window::{Outcome, SlidingWindow, WindowSnapshot};
use crate::telemetry::{CircuitBreakerEvent, CircuitBreakerEventKind, EventPublisher, PolicyEvent};
use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

/// Current state of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    /// Normal operating mode.
    Closed,
    /// Short-circuits calls.
    Open,
    /// Trial mode allowing a limited number of calls to test recovery.
    HalfOpen,
}

impl CircuitState {
    /// Whether the state graph allows a manual transition from `self` to `to`.
    pub fn can_transition_to(self, to: CircuitState) -> bool {
        matches!(
            (self, to),
            (CircuitState::Closed, CircuitState::Open)
                | (CircuitState::Open, CircuitState::HalfOpen)
                | (CircuitState::HalfOpen, CircuitState::Open)
                | (CircuitState::HalfOpen, CircuitState::Closed)
        )
    }
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        })
    }
}

/// How one finished (or rejected) call was accounted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallOutcome {
    Success,
    SlowSuccess,
    Failure,
    SlowFailure,
    /// The error matched an ignore predicate; nothing was recorded.
    Ignored,
    /// The breaker rejected the call before execution.
    NotPermitted,
}

impl From<Outcome> for CallOutcome {
    fn from(outcome: Outcome) -> Self {
        match outcome {
            Outcome::Success => CallOutcome::Success,
            Outcome::SlowSuccess => CallOutcome::SlowSuccess,
            Outcome::Failure => CallOutcome::Failure,
            Outcome::SlowFailure => CallOutcome::SlowFailure,
        }
    }
}

/// Rejection returned by [`CircuitBreaker::try_acquire_permission`].
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("circuit breaker '{name}' is {state} and does not permit further calls")]
pub struct CallNotPermitted {
    pub name: Arc<str>,
    pub state: CircuitState,
}

impl CallNotPermitted {
    pub fn into_error<E>(self) -> ResilienceError<E> {
        ResilienceError::NotPermitted { name: self.name, state: self.state }
    }
}

/// Predicate over a call's error, used to decide whether it is recorded or ignored.
pub type ErrorPredicate = Arc<dyn Fn(&(dyn StdError + 'static)) -> bool + Send + Sync>;

/// Immutable breaker configuration. Build with [`CircuitBreakerConfig::builder`].
#[derive(Clone)]
pub struct CircuitBreakerConfig {
    failure_rate_threshold: f32,
    slow_call_rate_threshold: f32,
    slow_call_duration_threshold: Duration,
    minimum_number_of_calls: usize,
    sliding_window_size: usize,
    wait_duration_in_open_state: Duration,
    automatic_transition_from_open_to_half_open: bool,
    permitted_number_of_calls_in_half_open_state: usize,
    record_errors: Vec<ErrorPredicate>,
    ignore_errors: Vec<ErrorPredicate>,
}

impl fmt::Debug for CircuitBreakerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerConfig")
            .field("failure_rate_threshold", &self.failure_rate_threshold)
            .field("slow_call_rate_threshold", &self.slow_call_rate_threshold)
            .field("slow_call_duration_threshold", &self.slow_call_duration_threshold)
            .field("minimum_number_of_calls", &self.minimum_number_of_calls)
            .field("sliding_window_size", &self.sliding_window_size)
            .field("wait_duration_in_open_state", &self.wait_duration_in_open_state)
            .field(
                "automatic_transition_from_open_to_half_open",
                &self.automatic_transition_from_open_to_half_open,
            )
            .field(
                "permitted_number_of_calls_in_half_open_state",
                &self.permitted_number_of_calls_in_half_open_state,
            )
            .field("record_errors", &self.record_errors.len())
            .field("ignore_errors", &self.ignore_errors.len())
            .finish()
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_rate_threshold: 50.0,
            slow_call_rate_threshold: 100.0,
            slow_call_duration_threshold: Duration::from_secs(60),
            minimum_number_of_calls: 100,
            sliding_window_size: 100,
            wait_duration_in_open_state: Duration::from_secs(60),
            automatic_transition_from_open_to_half_open: false,
            permitted_number_of_calls_in_half_open_state: 10,
            record_errors: Vec::new(),
            ignore_errors: Vec::new(),
        }
    }
}

enum ErrorClass {
    Recorded,
    NotRecorded,
    Ignored,
}

impl CircuitBreakerConfig {
    pub fn builder() -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfigBuilder::default()
    }

    pub fn failure_rate_threshold(&self) -> f32 {
        self.failure_rate_threshold
    }

    pub fn slow_call_rate_threshold(&self) -> f32 {
        self.slow_call_rate_threshold
    }

    pub fn slow_call_duration_threshold(&self) -> Duration {
        self.slow_call_duration_threshold
    }

    pub fn minimum_number_of_calls(&self) -> usize {
        self.minimum_number_of_calls
    }

    pub fn sliding_window_size(&self) -> usize {
        self.sliding_window_size
    }

    pub fn wait_duration_in_open_state(&self) -> Duration {
        self.wait_duration_in_open_state
    }

    pub fn automatic_transition_from_open_to_half_open(&self) -> bool {
        self.automatic_transition_from_open_to_half_open
    }

    pub fn permitted_number_of_calls_in_half_open_state(&self) -> usize {
        self.permitted_number_of_calls_in_half_open_state
    }

    // Ignore wins over record; with no record predicates every error is recorded.
    fn classify(&self, error: &(dyn StdError + 'static)) -> ErrorClass {
        if self.ignore_errors.iter().any(|p| p(error)) {
            ErrorClass::Ignored
        } else if self.record_errors.is_empty() || self.record_errors.iter().any(|p| p(error)) {
            ErrorClass::Recorded
        } else {
            ErrorClass::NotRecorded
        }
    }

    fn closed_window(&self) -> SlidingWindow {
        SlidingWindow::new(self.sliding_window_size, self.minimum_number_of_calls)
    }

    fn half_open_window(&self) -> SlidingWindow {
        let permitted = self.permitted_number_of_calls_in_half_open_state;
        SlidingWindow::new(permitted, permitted)
    }
}

/// Builder for [`CircuitBreakerConfig`]; `build` validates every field.
#[derive(Default)]
pub struct CircuitBreakerConfigBuilder {
    config: CircuitBreakerConfig,
}

impl CircuitBreakerConfigBuilder {
    /// Failure percentage (0..=100) above which the breaker opens.
    pub fn failure_rate_threshold(mut self, percent: f32) -> Self {
        self.config.failure_rate_threshold = percent;
        self
    }

    /// Slow-call percentage (0..=100) above which the breaker opens.
    pub fn slow_call_rate_threshold(mut self, percent: f32) -> Self {
        self.config.slow_call_rate_threshold = percent;
        self
    }

    /// Calls taking at least this long count as slow.
    pub fn slow_call_duration_threshold(mut self, duration: Duration) -> Self {
        self.config.slow_call_duration_threshold = duration;
        self
    }

    /// Outcomes required before rates are evaluated; capped at the window size.
    pub fn minimum_number_of_calls(mut self, calls: usize) -> Self {
        self.config.minimum_number_of_calls = calls;
        self
    }

    pub fn sliding_window_size(mut self, size: usize) -> Self {
        self.config.sliding_window_size = size;
        self
    }

    pub fn wait_duration_in_open_state(mut self, wait: Duration) -> Self {
        self.config.wait_duration_in_open_state = wait;
        self
    }

    pub fn automatic_transition_from_open_to_half_open(mut self, enabled: bool) -> Self {
        self.config.automatic_transition_from_open_to_half_open = enabled;
        self
    }

    pub fn permitted_number_of_calls_in_half_open_state(mut self, calls: usize) -> Self {
        self.config.permitted_number_of_calls_in_half_open_state = calls;
        self
    }

    /// Record errors matching `predicate` as failures. Once any record rule is configured,
    /// errors matching none of them count as successes.
    pub fn record_error<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        self.config.record_errors.push(Arc::new(predicate));
        self
    }

    /// Record errors of concrete type `T` as failures.
    pub fn record_error_type<T: StdError + 'static>(self) -> Self {
        self.record_error(|e| e.is::<T>())
    }

    /// Errors matching `predicate` are not recorded at all.
    pub fn ignore_error<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn StdError + 'static)) -> bool + Send + Sync + 'static,
    {
        self.config.ignore_errors.push(Arc::new(predicate));
        self
    }

    /// Ignore errors of concrete type `T`.
    pub fn ignore_error_type<T: StdError + 'static>(self) -> Self {
        self.ignore_error(|e| e.is::<T>())
    }

    pub fn build(self) -> Result<CircuitBreakerConfig, ConfigError> {
        let c = self.config;
        for (field, value) in [
            ("failure_rate_threshold", c.failure_rate_threshold),
            ("slow_call_rate_threshold", c.slow_call_rate_threshold),
        ] {
            if !(0.0..=100.0).contains(&value) {
                return Err(ConfigError::InvalidRate { field, value });
            }
        }
        for (field, value) in [
            ("minimum_number_of_calls", c.minimum_number_of_calls),
            ("sliding_window_size", c.sliding_window_size),
            (
                "permitted_number_of_calls_in_half_open_state",
                c.permitted_number_of_calls_in_half_open_state,
            ),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroCount { field, value });
            }
        }
        for (field, value) in [
            ("slow_call_duration_threshold", c.slow_call_duration_threshold),
            ("wait_duration_in_open_state", c.wait_duration_in_open_state),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration { field, value });
            }
        }
        Ok(c)
    }
}

/// Point-in-time view of a breaker. Reading it has no side effects beyond the lazy
/// open → half-open check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    pub number_of_buffered_calls: usize,
    pub number_of_successful_calls: usize,
    pub number_of_failed_calls: usize,
    pub number_of_slow_calls: usize,
    pub number_of_slow_successful_calls: usize,
    pub number_of_slow_failed_calls: usize,
    pub number_of_not_permitted_calls: u64,
    /// Percentage, or `-1.0` below the minimum number of calls.
    pub failure_rate: f32,
    /// Percentage, or `-1.0` below the minimum number of calls.
    pub slow_call_rate: f32,
}

impl CircuitBreakerMetrics {
    fn from_window(state: CircuitState, window: WindowSnapshot, not_permitted: u64) -> Self {
        Self {
            state,
            number_of_buffered_calls: window.buffered_calls,
            number_of_successful_calls: window.successful_calls,
            number_of_failed_calls: window.failed_calls,
            number_of_slow_calls: window.slow_calls,
            number_of_slow_successful_calls: window.slow_successful_calls,
            number_of_slow_failed_calls: window.slow_failed_calls,
            number_of_not_permitted_calls: not_permitted,
            failure_rate: window.failure_rate,
            slow_call_rate: window.slow_call_rate,
        }
    }
}

#[derive(Debug)]
struct BreakerCore {
    state: CircuitState,
    window: SlidingWindow,
    opened_at_millis: u64,
    half_open_issued: usize,
    // Bumped on every transition so permits from an earlier cycle cannot free current slots.
    epoch: u64,
}

/// Admission granted by [`CircuitBreaker::try_acquire_permission`].
///
/// Hand it back through exactly one of [`CircuitBreaker::on_success`],
/// [`CircuitBreaker::on_error`] or [`CircuitBreaker::release_permission`].
#[derive(Debug)]
#[must_use = "complete the permit with on_success, on_error or release_permission"]
pub struct Permit {
    epoch: u64,
}

struct Shared {
    name: Arc<str>,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    core: Mutex<BreakerCore>,
    not_permitted: AtomicU64,
    events: EventPublisher,
    outbox: Mutex<Outbox>,
}

// Events queued in decision order. One caller at a time drains it; the rest only enqueue.
#[derive(Default)]
struct Outbox {
    queue: VecDeque<PolicyEvent>,
    draining: bool,
}

// Clears the draining flag if a consumer panics mid-drain.
struct DrainGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.outbox().draining = false;
        }
    }
}

/// Circuit breaker guarding calls to one dependency.
///
/// Clones share the same underlying state via `Arc`, so all handles observe and affect the same
/// circuit lifecycle.
#[derive(Clone)]
pub struct CircuitBreaker {
    inner: Arc<Shared>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.inner.name)
            .field("state", &self.lock().state)
            .field("config", &self.inner.config)
            .finish()
    }
}

type Pending = Vec<CircuitBreakerEventKind>;

impl CircuitBreaker {
    /// Create a closed breaker using the monotonic clock.
    pub fn new(name: impl Into<Arc<str>>, config: CircuitBreakerConfig) -> Self {
        Self::from_parts(name.into(), config, Arc::new(MonotonicClock::default()))
    }

    /// Create a breaker with the default configuration.
    pub fn of_defaults(name: impl Into<Arc<str>>) -> Self {
        Self::new(name, CircuitBreakerConfig::default())
    }

    /// Replace the clock (useful for deterministic tests). Returns a fresh, closed breaker.
    pub fn with_clock<C: Clock + 'static>(self, clock: C) -> Self {
        self.with_shared_clock(Arc::new(clock))
    }

    pub(crate) fn with_shared_clock(self, clock: Arc<dyn Clock>) -> Self {
        Self::from_parts(self.inner.name.clone(), self.inner.config.clone(), clock)
    }

    fn from_parts(name: Arc<str>, config: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let core = BreakerCore {
            state: CircuitState::Closed,
            window: config.closed_window(),
            opened_at_millis: 0,
            half_open_issued: 0,
            epoch: 0,
        };
        Self {
            inner: Arc::new(Shared {
                name,
                config,
                clock,
                core: Mutex::new(core),
                not_permitted: AtomicU64::new(0),
                events: EventPublisher::default(),
                outbox: Mutex::new(Outbox::default()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.inner.config
    }

    /// Publisher for this breaker's events.
    pub fn event_publisher(&self) -> &EventPublisher {
        &self.inner.events
    }

    /// Whether two handles refer to the same breaker.
    pub fn ptr_eq(&self, other: &CircuitBreaker) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lock(&self) -> MutexGuard<'_, BreakerCore> {
        self.inner.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn now_millis(&self) -> u64 {
        self.inner.clock.now_millis()
    }

    fn outbox(&self) -> MutexGuard<'_, Outbox> {
        self.inner.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` inside the critical section, then deliver the events it produced.
    ///
    /// Events are queued before the breaker lock is released, so consumers observe them in the
    /// order the decisions were made even when callers race.
    fn with_core<R>(&self, f: impl FnOnce(&mut BreakerCore, u64, &mut Pending) -> R) -> R {
        let now = self.now_millis();
        let mut pending = Pending::new();
        let result = {
            let mut core = self.lock();
            let result = f(&mut core, now, &mut pending);
            if !pending.is_empty() && self.inner.events.has_consumers() {
                let name = &self.inner.name;
                self.outbox().queue.extend(pending.into_iter().map(|kind| {
                    PolicyEvent::CircuitBreaker(CircuitBreakerEvent {
                        name: name.clone(),
                        timestamp_millis: now,
                        kind,
                    })
                }));
            }
            result
        };
        self.drain_outbox();
        result
    }

    // Never called with the breaker lock held, so consumers may call back into the breaker.
    fn drain_outbox(&self) {
        {
            let mut outbox = self.outbox();
            if outbox.draining || outbox.queue.is_empty() {
                return;
            }
            outbox.draining = true;
        }
        let mut guard = DrainGuard { breaker: self, armed: true };
        loop {
            let next = {
                let mut outbox = self.outbox();
                let next = outbox.queue.pop_front();
                // Hand off under the same lock so a concurrent enqueue is never stranded.
                if next.is_none() {
                    outbox.draining = false;
                }
                next
            };
            match next {
                Some(event) => self.inner.events.publish(&event),
                None => {
                    guard.armed = false;
                    return;
                }
            }
        }
    }

    /// Current state, applying the automatic open → half-open transition if it is due.
    pub fn state(&self) -> CircuitState {
        self.with_core(|core, now, pending| {
            self.refresh(core, now, pending);
            core.state
        })
    }

    /// Snapshot of the window counters and rates.
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let (state, window) = self.with_core(|core, now, pending| {
            self.refresh(core, now, pending);
            (core.state, core.window.snapshot())
        });
        CircuitBreakerMetrics::from_window(
            state,
            window,
            self.inner.not_permitted.load(Ordering::Acquire),
        )
    }

    /// Admission check. Open always rejects; half-open rejects once its trial quota is issued.
    pub fn try_acquire_permission(&self) -> Result<Permit, CallNotPermitted> {
        let decision = self.with_core(|core, now, pending| {
            self.refresh(core, now, pending);
            let permitted = match core.state {
                CircuitState::Closed => true,
                CircuitState::Open => false,
                CircuitState::HalfOpen => {
                    let quota = self.inner.config.permitted_number_of_calls_in_half_open_state;
                    if core.half_open_issued < quota {
                        core.half_open_issued += 1;
                        true
                    } else {
                        false
                    }
                }
            };
            if !permitted {
                pending.push(CircuitBreakerEventKind::NotPermitted);
            }
            (permitted, core.state, core.epoch)
        });
        match decision {
            (true, _, epoch) => Ok(Permit { epoch }),
            (false, state, _) => {
                self.inner.not_permitted.fetch_add(1, Ordering::AcqRel);
                tracing::debug!(
                    target: "tripwire::circuit_breaker",
                    name = %self.inner.name,
                    state = %state,
                    "call not permitted"
                );
                Err(CallNotPermitted { name: self.inner.name.clone(), state })
            }
        }
    }

    /// Give back a permission acquired for a call whose outcome will not be recorded.
    pub fn release_permission(&self, permit: Permit) {
        self.with_core(|core, _, _| Self::free_slot(core, &permit));
    }

    // Only a permit issued in the current half-open cycle frees a trial slot.
    fn free_slot(core: &mut BreakerCore, permit: &Permit) {
        if core.state == CircuitState::HalfOpen && core.epoch == permit.epoch {
            core.half_open_issued = core.half_open_issued.saturating_sub(1);
        }
    }

    /// Record a successful call that took `duration`.
    pub fn on_success(&self, _permit: Permit, duration: Duration) -> CallOutcome {
        self.record_success(duration)
    }

    fn record_success(&self, duration: Duration) -> CallOutcome {
        let slow = self.is_slow(duration);
        let outcome = Outcome::from_call(false, slow);
        self.with_core(|core, now, pending| {
            pending.push(CircuitBreakerEventKind::Success { duration });
            self.record(core, now, outcome, pending);
        });
        tracing::trace!(
            target: "tripwire::circuit_breaker",
            name = %self.inner.name,
            elapsed_ms = duration.as_millis() as u64,
            slow,
            "recorded a successful call"
        );
        outcome.into()
    }

    /// Record a failed call. The error is classified by the configured record/ignore rules:
    /// ignored errors leave the window untouched, unrecorded errors count as successes.
    pub fn on_error(
        &self,
        permit: Permit,
        duration: Duration,
        error: &(dyn StdError + 'static),
    ) -> CallOutcome {
        let message = error.to_string();
        match self.inner.config.classify(error) {
            ErrorClass::Ignored => {
                self.with_core(|core, _, pending| {
                    Self::free_slot(core, &permit);
                    pending
                        .push(CircuitBreakerEventKind::IgnoredError { duration, error: message });
                });
                tracing::debug!(
                    target: "tripwire::circuit_breaker",
                    name = %self.inner.name,
                    error = %error,
                    "recorded an error which has been ignored"
                );
                CallOutcome::Ignored
            }
            ErrorClass::NotRecorded => self.record_success(duration),
            ErrorClass::Recorded => {
                let outcome = Outcome::from_call(true, self.is_slow(duration));
                self.with_core(|core, now, pending| {
                    pending.push(CircuitBreakerEventKind::Error { duration, error: message });
                    self.record(core, now, outcome, pending);
                });
                tracing::debug!(
                    target: "tripwire::circuit_breaker",
                    name = %self.inner.name,
                    error = %error,
                    elapsed_ms = duration.as_millis() as u64,
                    "recorded an error"
                );
                outcome.into()
            }
        }
    }

    fn is_slow(&self, duration: Duration) -> bool {
        duration >= self.inner.config.slow_call_duration_threshold
    }

    fn refresh(&self, core: &mut BreakerCore, now: u64, pending: &mut Pending) {
        let config = &self.inner.config;
        if core.state == CircuitState::Open
            && config.automatic_transition_from_open_to_half_open
            && now.saturating_sub(core.opened_at_millis)
                >= config.wait_duration_in_open_state.as_millis() as u64
        {
            self.transition(core, CircuitState::HalfOpen, now, pending);
        }
    }

    fn record(&self, core: &mut BreakerCore, now: u64, outcome: Outcome, pending: &mut Pending) {
        core.window.record(outcome);
        match core.state {
            CircuitState::Closed => {
                if self.tripped(core, pending) {
                    self.transition(core, CircuitState::Open, now, pending);
                }
            }
            CircuitState::HalfOpen => {
                if core.window.is_full() {
                    let next = if self.tripped(core, pending) {
                        CircuitState::Open
                    } else {
                        CircuitState::Closed
                    };
                    self.transition(core, next, now, pending);
                }
            }
            // Late completions of calls admitted before the breaker opened.
            CircuitState::Open => {}
        }
    }

    fn tripped(&self, core: &BreakerCore, pending: &mut Pending) -> bool {
        if !core.window.has_minimum_calls() {
            return false;
        }
        let config = &self.inner.config;
        let failure_rate = core.window.failure_rate();
        let slow_call_rate = core.window.slow_call_rate();
        let mut tripped = false;
        if failure_rate > config.failure_rate_threshold {
            tracing::warn!(
                target: "tripwire::circuit_breaker",
                name = %self.inner.name,
                failure_rate,
                threshold = config.failure_rate_threshold,
                "exceeded failure rate threshold"
            );
            pending.push(CircuitBreakerEventKind::FailureRateExceeded { rate: failure_rate });
            tripped = true;
        }
        if slow_call_rate > config.slow_call_rate_threshold {
            tracing::warn!(
                target: "tripwire::circuit_breaker",
                name = %self.inner.name,
                slow_call_rate,
                threshold = config.slow_call_rate_threshold,
                "exceeded slow call rate threshold"
            );
            pending.push(CircuitBreakerEventKind::SlowCallRateExceeded { rate: slow_call_rate });
            tripped = true;
        }
        tripped
    }

    // An automatic trip into Open keeps the window so the rates that tripped it stay visible.
    fn transition(&self, core: &mut BreakerCore, to: CircuitState, now: u64, pending: &mut Pending) {
        let from = core.state;
        core.state = to;
        core.half_open_issued = 0;
        core.epoch = core.epoch.wrapping_add(1);
        match to {
            CircuitState::Open => core.opened_at_millis = now,
            CircuitState::HalfOpen => core.window = self.inner.config.half_open_window(),
            CircuitState::Closed => core.window = self.inner.config.closed_window(),
        }
        pending.push(CircuitBreakerEventKind::StateTransition { from, to });
        if to == CircuitState::Open {
            tracing::warn!(
                target: "tripwire::circuit_breaker",
                name = %self.inner.name,
                %from,
                %to,
                "circuit breaker changed state"
            );
        } else {
            tracing::info!(
                target: "tripwire::circuit_breaker",
                name = %self.inner.name,
                %from,
                %to,
                "circuit breaker changed state"
            );
        }
    }

    fn manual_transition(&self, to: CircuitState) -> Result<(), IllegalStateTransition> {
        self.with_core(|core, now, pending| {
            self.refresh(core, now, pending);
            let from = core.state;
            if !from.can_transition_to(to) {
                return Err(IllegalStateTransition { name: self.inner.name.clone(), from, to });
            }
            if to == CircuitState::Open {
                core.window = self.inner.config.closed_window();
            }
            self.transition(core, to, now, pending);
            Ok(())
        })
    }

    /// Force the breaker open. Legal from Closed and HalfOpen.
    pub fn transition_to_open_state(&self) -> Result<(), IllegalStateTransition> {
        self.manual_transition(CircuitState::Open)
    }

    /// Start probing. Legal from Open only.
    pub fn transition_to_half_open_state(&self) -> Result<(), IllegalStateTransition> {
        self.manual_transition(CircuitState::HalfOpen)
    }

    /// Close the breaker. Legal from HalfOpen only; use [`CircuitBreaker::reset`] otherwise.
    pub fn transition_to_closed_state(&self) -> Result<(), IllegalStateTransition> {
        self.manual_transition(CircuitState::Closed)
    }

    /// Administrative reset: Closed, empty window, not-permitted counter zeroed.
    pub fn reset(&self) {
        self.with_core(|core, _, pending| {
            core.state = CircuitState::Closed;
            core.window = self.inner.config.closed_window();
            core.opened_at_millis = 0;
            core.half_open_issued = 0;
            core.epoch = core.epoch.wrapping_add(1);
            self.inner.not_permitted.store(0, Ordering::Release);
            pending.push(CircuitBreakerEventKind::Reset);
        });
        tracing::info!(target: "tripwire::circuit_breaker", name = %self.inner.name, "circuit breaker reset");
    }

    /// Execute `operation` under breaker protection.
    ///
    /// # Errors
    /// Returns `ResilienceError::NotPermitted` without invoking `operation` when the breaker
    /// rejects the call, or `ResilienceError::Inner(E)` when the operation itself fails.
    pub async fn execute<T, E, Fut, Op>(&self, operation: Op) -> Result<T, ResilienceError<E>>
    where
        E: StdError + 'static,
        Fut: Future<Output = Result<T, E>>,
        Op: FnOnce() -> Fut,
    {
        let permit = self.try_acquire_permission().map_err(CallNotPermitted::into_error)?;

        // Releases the permit if the call is cancelled or panics before recording.
        struct PermitGuard<'a> {
            breaker: &'a CircuitBreaker,
            epoch: u64,
            armed: bool,
        }
        impl Drop for PermitGuard<'_> {
            fn drop(&mut self) {
                if self.armed {
                    self.breaker.release_permission(Permit { epoch: self.epoch });
                }
            }
        }
        let mut guard = PermitGuard { breaker: self, epoch: permit.epoch, armed: true };

        let start = self.now_millis();
        let result = operation().await;
        let duration = Duration::from_millis(self.now_millis().saturating_sub(start));
        guard.armed = false;

        match result {
            Ok(value) => {
                self.on_success(permit, duration);
                Ok(value)
            }
            Err(error) => {
                self.on_error(permit, duration, &error);
                Err(ResilienceError::Inner(error))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestError(&'static str);

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "TestError: {}", self.0)
        }
    }

    impl StdError for TestError {}

    fn breaker(config: CircuitBreakerConfig) -> (CircuitBreaker, ManualClock) {
        let clock = ManualClock::new();
        (CircuitBreaker::new("test", config).with_clock(clock.clone()), clock)
    }

    fn succeed(cb: &CircuitBreaker, duration: Duration) -> CallOutcome {
        let permit = cb.try_acquire_permission().unwrap();
        cb.on_success(permit, duration)
    }

    fn fail(cb: &CircuitBreaker, duration: Duration) -> CallOutcome {
        let permit = cb.try_acquire_permission().unwrap();
        cb.on_error(permit, duration, &TestError("x"))
    }

    fn config(min_calls: usize) -> CircuitBreakerConfigBuilder {
        CircuitBreakerConfig::builder().minimum_number_of_calls(min_calls)
    }

    #[test]
    fn builder_validates_fields() {
        assert!(matches!(
            CircuitBreakerConfig::builder().failure_rate_threshold(101.0).build(),
            Err(ConfigError::InvalidRate { field: "failure_rate_threshold", .. })
        ));
        assert!(matches!(
            CircuitBreakerConfig::builder().slow_call_rate_threshold(f32::NAN).build(),
            Err(ConfigError::InvalidRate { field: "slow_call_rate_threshold", .. })
        ));
        assert!(matches!(
            CircuitBreakerConfig::builder().sliding_window_size(0).build(),
            Err(ConfigError::ZeroCount { field: "sliding_window_size", .. })
        ));
        assert!(matches!(
            CircuitBreakerConfig::builder().permitted_number_of_calls_in_half_open_state(0).build(),
            Err(ConfigError::ZeroCount { .. })
        ));
        assert!(matches!(
            CircuitBreakerConfig::builder().wait_duration_in_open_state(Duration::ZERO).build(),
            Err(ConfigError::ZeroDuration { field: "wait_duration_in_open_state", .. })
        ));
    }

    #[test]
    fn defaults_match_documented_values() {
        let c = CircuitBreakerConfig::default();
        assert_eq!(c.failure_rate_threshold(), 50.0);
        assert_eq!(c.slow_call_rate_threshold(), 100.0);
        assert_eq!(c.slow_call_duration_threshold(), Duration::from_secs(60));
        assert_eq!(c.minimum_number_of_calls(), 100);
        assert_eq!(c.sliding_window_size(), 100);
        assert_eq!(c.wait_duration_in_open_state(), Duration::from_secs(60));
        assert!(!c.automatic_transition_from_open_to_half_open());
        assert_eq!(c.permitted_number_of_calls_in_half_open_state(), 10);
    }

    #[test]
    fn rate_equal_to_threshold_does_not_trip() {
        let (cb, _) = breaker(config(4).failure_rate_threshold(50.0).build().unwrap());
        succeed(&cb, Duration::ZERO);
        succeed(&cb, Duration::ZERO);
        fail(&cb, Duration::ZERO);
        fail(&cb, Duration::ZERO);
        assert_eq!(cb.metrics().failure_rate, 50.0);
        assert_eq!(cb.state(), CircuitState::Closed);

        fail(&cb, Duration::ZERO);
        assert_eq!(cb.metrics().failure_rate, 60.0);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn open_rejects_and_counts_not_permitted() {
        let (cb, _) = breaker(CircuitBreakerConfig::default());
        cb.transition_to_open_state().unwrap();
        let err = cb.try_acquire_permission().unwrap_err();
        assert_eq!(err.state, CircuitState::Open);
        assert_eq!(&*err.name, "test");
        assert!(cb.try_acquire_permission().is_err());
        let metrics = cb.metrics();
        assert_eq!(metrics.number_of_not_permitted_calls, 2);
        assert_eq!(metrics.number_of_buffered_calls, 0);
    }

    #[test]
    fn without_automatic_transition_open_waits_for_manual_command() {
        let (cb, clock) = breaker(
            CircuitBreakerConfig::builder()
                .wait_duration_in_open_state(Duration::from_secs(1))
                .build()
                .unwrap(),
        );
        cb.transition_to_open_state().unwrap();
        clock.advance(5_000);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(cb.try_acquire_permission().is_err());

        cb.transition_to_half_open_state().unwrap();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire_permission().is_ok());
    }

    #[test]
    fn automatic_transition_is_observable_by_state_query() {
        let (cb, clock) = breaker(
            CircuitBreakerConfig::builder()
                .automatic_transition_from_open_to_half_open(true)
                .wait_duration_in_open_state(Duration::from_secs(1))
                .build()
                .unwrap(),
        );
        cb.transition_to_open_state().unwrap();
        clock.advance(999);
        assert_eq!(cb.state(), CircuitState::Open);
        clock.advance(1);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn half_open_quota_rejects_extra_trial_calls() {
        let (cb, _) = breaker(
            CircuitBreakerConfig::builder()
                .permitted_number_of_calls_in_half_open_state(2)
                .build()
                .unwrap(),
        );
        cb.transition_to_open_state().unwrap();
        cb.transition_to_half_open_state().unwrap();
        let first = cb.try_acquire_permission().unwrap();
        assert!(cb.try_acquire_permission().is_ok());
        let rejected = cb.try_acquire_permission().unwrap_err();
        assert_eq!(rejected.state, CircuitState::HalfOpen);

        cb.release_permission(first);
        assert!(cb.try_acquire_permission().is_ok());
    }

    #[test]
    fn half_open_trial_outcomes_decide_next_state() {
        let half_open = || {
            let (cb, clock) = breaker(
                CircuitBreakerConfig::builder()
                    .permitted_number_of_calls_in_half_open_state(2)
                    .build()
                    .unwrap(),
            );
            cb.transition_to_open_state().unwrap();
            cb.transition_to_half_open_state().unwrap();
            (cb, clock)
        };

        let (cb, _) = half_open();
        fail(&cb, Duration::ZERO);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert_eq!(cb.metrics().failure_rate, -1.0);
        fail(&cb, Duration::ZERO);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.metrics().failure_rate, 100.0);
        assert_eq!(cb.metrics().number_of_buffered_calls, 2);

        let (cb, _) = half_open();
        succeed(&cb, Duration::ZERO);
        succeed(&cb, Duration::ZERO);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.metrics().number_of_buffered_calls, 0);
    }

    #[test]
    fn illegal_manual_transitions_leave_state_unchanged() {
        let (cb, _) = breaker(CircuitBreakerConfig::default());
        let err = cb.transition_to_half_open_state().unwrap_err();
        assert_eq!(err.from, CircuitState::Closed);
        assert_eq!(err.to, CircuitState::HalfOpen);
        assert_eq!(cb.state(), CircuitState::Closed);

        assert!(cb.transition_to_closed_state().is_err());
        cb.transition_to_open_state().unwrap();
        assert!(cb.transition_to_open_state().is_err());
        assert!(cb.transition_to_closed_state().is_err());
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn manual_open_clears_window() {
        let (cb, _) = breaker(config(5).build().unwrap());
        fail(&cb, Duration::ZERO);
        cb.transition_to_open_state().unwrap();
        assert_eq!(cb.metrics().number_of_buffered_calls, 0);
    }

    #[test]
    fn ignored_error_releases_half_open_permit() {
        let (cb, _) = breaker(
            CircuitBreakerConfig::builder()
                .permitted_number_of_calls_in_half_open_state(1)
                .ignore_error_type::<TestError>()
                .build()
                .unwrap(),
        );
        cb.transition_to_open_state().unwrap();
        cb.transition_to_half_open_state().unwrap();
        let permit = cb.try_acquire_permission().unwrap();
        assert_eq!(cb.on_error(permit, Duration::ZERO, &TestError("x")), CallOutcome::Ignored);
        assert_eq!(cb.metrics().number_of_buffered_calls, 0);
        assert!(cb.try_acquire_permission().is_ok());
    }

    #[test]
    fn slow_threshold_is_inclusive() {
        let (cb, _) = breaker(
            CircuitBreakerConfig::builder()
                .slow_call_duration_threshold(Duration::from_millis(100))
                .build()
                .unwrap(),
        );
        assert_eq!(succeed(&cb, Duration::from_millis(99)), CallOutcome::Success);
        assert_eq!(succeed(&cb, Duration::from_millis(100)), CallOutcome::SlowSuccess);
        assert_eq!(
            fail(&cb, Duration::from_millis(150)),
            CallOutcome::SlowFailure
        );
        let m = cb.metrics();
        assert_eq!(m.number_of_slow_calls, 2);
        assert_eq!(m.number_of_slow_failed_calls, 1);
    }

    #[test]
    fn reset_returns_to_closed_and_clears_counters() {
        let (cb, _) = breaker(CircuitBreakerConfig::default());
        cb.transition_to_open_state().unwrap();
        let _ = cb.try_acquire_permission();
        cb.reset();
        let m = cb.metrics();
        assert_eq!(m.state, CircuitState::Closed);
        assert_eq!(m.number_of_not_permitted_calls, 0);
    }

    #[test]
    fn transitions_publish_events_in_order() {
        let (cb, _) = breaker(config(1).failure_rate_threshold(0.0).build().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        cb.event_publisher().on_event(move |event| {
            if let Some(kind) = event.as_circuit_breaker() {
                sink.lock().unwrap().push(kind.clone());
            }
        });

        fail(&cb, Duration::ZERO);
        let _ = cb.try_acquire_permission();

        let seen = seen.lock().unwrap();
        assert!(matches!(seen[0], CircuitBreakerEventKind::Error { .. }));
        assert_eq!(seen[1], CircuitBreakerEventKind::FailureRateExceeded { rate: 100.0 });
        assert_eq!(
            seen[2],
            CircuitBreakerEventKind::StateTransition {
                from: CircuitState::Closed,
                to: CircuitState::Open
            }
        );
        assert_eq!(seen[3], CircuitBreakerEventKind::NotPermitted);
    }

    #[tokio::test]
    async fn execute_times_calls_with_breaker_clock() {
        let (cb, clock) = breaker(
            CircuitBreakerConfig::builder()
                .slow_call_duration_threshold(Duration::from_millis(2_900))
                .build()
                .unwrap(),
        );
        let value = cb
            .execute(move || async move {
                clock.advance(3_000);
                Ok::<_, TestError>("Slowness")
            })
            .await
            .unwrap();
        assert_eq!(value, "Slowness");
        assert_eq!(cb.metrics().number_of_slow_successful_calls, 1);
    }

    #[tokio::test]
    async fn execute_short_circuits_when_open() {
        let (cb, _) = breaker(CircuitBreakerConfig::default());
        cb.transition_to_open_state().unwrap();
        let calls = AtomicUsize::new(0);
        let counter = &calls;
        let result = cb
            .execute(move || async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(())
            })
            .await;
        assert!(result.unwrap_err().is_not_permitted());
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancelled_half_open_call_returns_its_permit() {
        let (cb, _) = breaker(
            CircuitBreakerConfig::builder()
                .permitted_number_of_calls_in_half_open_state(1)
                .build()
                .unwrap(),
        );
        cb.transition_to_open_state().unwrap();
        cb.transition_to_half_open_state().unwrap();

        let pending = cb.execute(|| futures::future::pending::<Result<(), TestError>>());
        let timed_out =
            tokio::time::timeout(Duration::from_millis(10), pending).await.is_err();
        assert!(timed_out);
        assert!(cb.try_acquire_permission().is_ok());
    }

    fn single_trial_half_open() -> CircuitBreaker {
        let (cb, _) = breaker(
            CircuitBreakerConfig::builder()
                .permitted_number_of_calls_in_half_open_state(1)
                .build()
                .unwrap(),
        );
        cb.transition_to_open_state().unwrap();
        cb.transition_to_half_open_state().unwrap();
        cb
    }

    #[test]
    fn permit_from_earlier_half_open_cycle_does_not_free_a_slot() {
        let cb = single_trial_half_open();
        let stale = cb.try_acquire_permission().unwrap();
        cb.transition_to_open_state().unwrap();
        cb.transition_to_half_open_state().unwrap();

        let current = cb.try_acquire_permission().unwrap();
        cb.release_permission(stale);
        assert!(cb.try_acquire_permission().is_err());

        cb.release_permission(current);
        assert!(cb.try_acquire_permission().is_ok());
    }

    #[test]
    fn stale_ignored_error_does_not_free_a_slot() {
        let (cb, _) = breaker(
            CircuitBreakerConfig::builder()
                .permitted_number_of_calls_in_half_open_state(1)
                .ignore_error_type::<TestError>()
                .build()
                .unwrap(),
        );
        cb.transition_to_open_state().unwrap();
        cb.transition_to_half_open_state().unwrap();
        let stale = cb.try_acquire_permission().unwrap();
        cb.transition_to_open_state().unwrap();
        cb.transition_to_half_open_state().unwrap();
        let _current = cb.try_acquire_permission().unwrap();

        assert_eq!(cb.on_error(stale, Duration::ZERO, &TestError("x")), CallOutcome::Ignored);
        assert!(cb.try_acquire_permission().is_err());
    }

    #[tokio::test]
    async fn cancelled_trial_from_earlier_cycle_keeps_quota() {
        let cb = single_trial_half_open();
        let mut parked = Box::pin(cb.execute(|| futures::future::pending::<Result<(), TestError>>()));
        assert!(futures::poll!(parked.as_mut()).is_pending());

        cb.transition_to_open_state().unwrap();
        cb.transition_to_half_open_state().unwrap();
        let _current = cb.try_acquire_permission().unwrap();
        drop(parked);

        assert!(cb.try_acquire_permission().is_err());
        assert_eq!(cb.metrics().number_of_not_permitted_calls, 1);
    }

    #[test]
    fn racing_transitions_reach_consumers_in_decision_order() {
        let (cb, _) = breaker(CircuitBreakerConfig::default());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        cb.event_publisher().on_event(move |event| {
            if let Some(CircuitBreakerEventKind::StateTransition { from, to }) =
                event.as_circuit_breaker()
            {
                sink.lock().unwrap().push((*from, *to));
            }
        });

        std::thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..500 {
                        let _ = cb.transition_to_open_state();
                        let _ = cb.transition_to_half_open_state();
                        let _ = cb.transition_to_closed_state();
                    }
                });
            }
        });

        let seen = seen.lock().unwrap();
        assert!(!seen.is_empty());
        assert_eq!(seen[0].0, CircuitState::Closed);
        for pair in seen.windows(2) {
            assert_eq!(pair[0].1, pair[1].0, "transition chain broken: {pair:?}");
        }
        assert_eq!(seen.last().map(|t| t.1), Some(cb.state()));
    }

    #[test]
    fn consumer_may_call_back_into_the_breaker() {
        let (cb, _) = breaker(config(1).build().unwrap());
        let observed = Arc::new(Mutex::new(Vec::new()));
        let sink = observed.clone();
        let handle = cb.clone();
        cb.event_publisher().on_event(move |event| {
            if let Some(CircuitBreakerEventKind::StateTransition { .. }) = event.as_circuit_breaker() {
                // Rejected here, so this consumer queues a NotPermitted event while delivering.
                let _ = handle.try_acquire_permission();
                sink.lock().unwrap().push(handle.state());
            }
        });

        fail(&cb, Duration::ZERO);

        assert_eq!(*observed.lock().unwrap(), vec![CircuitState::Open]);
        assert_eq!(cb.metrics().number_of_not_permitted_calls, 1);
    }
}
