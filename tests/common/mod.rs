#![allow(dead_code)]

use std::fmt;
use tripwire::{CircuitBreaker, CircuitState, ManualClock, ResilienceError};

/// Generic runtime failure of the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerFault;

impl fmt::Display for ServerFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Server fault")
    }
}

impl std::error::Error for ServerFault {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusinessError;

impl fmt::Display for BusinessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "business rule violated")
    }
}

impl std::error::Error for BusinessError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtherBusinessError;

impl fmt::Display for OtherBusinessError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "other business rule violated")
    }
}

impl std::error::Error for OtherBusinessError {}

/// Stand-in for a remote dependency. Slow calls advance the shared manual clock instead of
/// sleeping, so breakers built on the same clock time them deterministically.
#[derive(Debug, Clone, Default)]
pub struct ExternalService {
    pub clock: ManualClock,
}

pub const SLOW_CALL_MILLIS: u64 = 3_000;

impl ExternalService {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn success(&self) -> Result<&'static str, ServerFault> {
        Ok("Success")
    }

    pub async fn failure(&self) -> Result<&'static str, ServerFault> {
        Err(ServerFault)
    }

    pub async fn slowness(&self) -> Result<&'static str, ServerFault> {
        self.clock.advance(SLOW_CALL_MILLIS);
        Ok("Slowness")
    }

    pub async fn business_failure(&self) -> Result<&'static str, BusinessError> {
        Err(BusinessError)
    }

    pub async fn other_business_failure(&self) -> Result<&'static str, OtherBusinessError> {
        Err(OtherBusinessError)
    }
}

/// Replace any terminal error with a fixed recovery value.
pub fn recover<E>(result: Result<&'static str, ResilienceError<E>>) -> &'static str {
    result.unwrap_or("Recovery")
}

pub fn assert_counts(cb: &CircuitBreaker, state: CircuitState, buffered: usize, ok: usize, failed: usize) {
    let m = cb.metrics();
    assert_eq!(m.state, state, "state");
    assert_eq!(m.number_of_buffered_calls, buffered, "buffered calls");
    assert_eq!(m.number_of_successful_calls, ok, "successful calls");
    assert_eq!(m.number_of_failed_calls, failed, "failed calls");
}
