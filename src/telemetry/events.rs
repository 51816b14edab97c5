use crate::circuit_breaker::CircuitState;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "telemetry-json")]
use serde_json::json;

/// Events emitted by breakers and retries.
///
/// Every event carries the emitting instance's name and a millisecond timestamp taken from
/// that instance's clock, so consumers can order and attribute them.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicyEvent {
    CircuitBreaker(CircuitBreakerEvent),
    Retry(RetryEvent),
}

/// An event emitted by one circuit breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerEvent {
    pub name: Arc<str>,
    pub timestamp_millis: u64,
    pub kind: CircuitBreakerEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CircuitBreakerEventKind {
    /// A permitted call succeeded.
    Success { duration: Duration },
    /// A permitted call failed with an error counted as a failure.
    Error { duration: Duration, error: String },
    /// A permitted call failed with an error that is not counted at all.
    IgnoredError { duration: Duration, error: String },
    /// A call was rejected without invoking the operation.
    NotPermitted,
    StateTransition { from: CircuitState, to: CircuitState },
    FailureRateExceeded { rate: f32 },
    SlowCallRateExceeded { rate: f32 },
    Reset,
}

/// An event emitted by one retry instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryEvent {
    pub name: Arc<str>,
    pub timestamp_millis: u64,
    pub kind: RetryEventKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryEventKind {
    /// Attempt `attempt` failed; waiting `wait` before the next one.
    Retry { attempt: usize, wait: Duration, error: String },
    /// The call succeeded after `attempts` attempts (1 = no retry).
    Success { attempts: usize },
    /// The call failed for good after `attempts` attempts.
    Error { attempts: usize, error: String },
    /// The error was not retryable; the call failed on its first classification.
    IgnoredError { error: String },
}

impl PolicyEvent {
    pub fn name(&self) -> &str {
        match self {
            PolicyEvent::CircuitBreaker(e) => &e.name,
            PolicyEvent::Retry(e) => &e.name,
        }
    }

    pub fn timestamp_millis(&self) -> u64 {
        match self {
            PolicyEvent::CircuitBreaker(e) => e.timestamp_millis,
            PolicyEvent::Retry(e) => e.timestamp_millis,
        }
    }

    /// The breaker event, if this is one.
    pub fn as_circuit_breaker(&self) -> Option<&CircuitBreakerEventKind> {
        match self {
            PolicyEvent::CircuitBreaker(e) => Some(&e.kind),
            PolicyEvent::Retry(_) => None,
        }
    }

    /// The retry event, if this is one.
    pub fn as_retry(&self) -> Option<&RetryEventKind> {
        match self {
            PolicyEvent::Retry(e) => Some(&e.kind),
            PolicyEvent::CircuitBreaker(_) => None,
        }
    }
}

impl fmt::Display for PolicyEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PolicyEvent::CircuitBreaker(e) => write!(f, "CircuitBreaker[{}]::{}", e.name, e.kind),
            PolicyEvent::Retry(e) => write!(f, "Retry[{}]::{}", e.name, e.kind),
        }
    }
}

impl fmt::Display for CircuitBreakerEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Success { duration } => write!(f, "Success(duration={:?})", duration),
            Self::Error { duration, error } => {
                write!(f, "Error(duration={:?}, error={})", duration, error)
            }
            Self::IgnoredError { duration, error } => {
                write!(f, "IgnoredError(duration={:?}, error={})", duration, error)
            }
            Self::NotPermitted => write!(f, "NotPermitted"),
            Self::StateTransition { from, to } => write!(f, "StateTransition({} -> {})", from, to),
            Self::FailureRateExceeded { rate } => write!(f, "FailureRateExceeded({})", rate),
            Self::SlowCallRateExceeded { rate } => write!(f, "SlowCallRateExceeded({})", rate),
            Self::Reset => write!(f, "Reset"),
        }
    }
}

impl fmt::Display for RetryEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry { attempt, wait, error } => {
                write!(f, "Retry(#{}, wait={:?}, error={})", attempt, wait, error)
            }
            Self::Success { attempts } => write!(f, "Success(attempts={})", attempts),
            Self::Error { attempts, error } => {
                write!(f, "Error(attempts={}, error={})", attempts, error)
            }
            Self::IgnoredError { error } => write!(f, "IgnoredError(error={})", error),
        }
    }
}

#[cfg_attr(not(feature = "telemetry-json"), allow(dead_code))]
#[inline]
fn clamp_u64(val: u128) -> u64 {
    val.min(u128::from(u64::MAX)) as u64
}

/// Convert a PolicyEvent into a JSON value for sinks.
#[cfg(feature = "telemetry-json")]
pub fn event_to_json(event: &PolicyEvent) -> serde_json::Value {
    let mut value = match event {
        PolicyEvent::CircuitBreaker(e) => match &e.kind {
            CircuitBreakerEventKind::Success { duration } => json!({
                "kind": "circuit_success",
                "duration_ms": clamp_u64(duration.as_millis()),
            }),
            CircuitBreakerEventKind::Error { duration, error } => json!({
                "kind": "circuit_error",
                "duration_ms": clamp_u64(duration.as_millis()),
                "error": error,
            }),
            CircuitBreakerEventKind::IgnoredError { duration, error } => json!({
                "kind": "circuit_ignored_error",
                "duration_ms": clamp_u64(duration.as_millis()),
                "error": error,
            }),
            CircuitBreakerEventKind::NotPermitted => json!({ "kind": "circuit_not_permitted" }),
            CircuitBreakerEventKind::StateTransition { from, to } => json!({
                "kind": "circuit_state_transition",
                "from": from.to_string(),
                "to": to.to_string(),
            }),
            CircuitBreakerEventKind::FailureRateExceeded { rate } => {
                json!({ "kind": "circuit_failure_rate_exceeded", "rate": rate })
            }
            CircuitBreakerEventKind::SlowCallRateExceeded { rate } => {
                json!({ "kind": "circuit_slow_call_rate_exceeded", "rate": rate })
            }
            CircuitBreakerEventKind::Reset => json!({ "kind": "circuit_reset" }),
        },
        PolicyEvent::Retry(e) => match &e.kind {
            RetryEventKind::Retry { attempt, wait, error } => json!({
                "kind": "retry_attempt",
                "attempt": *attempt,
                "wait_ms": clamp_u64(wait.as_millis()),
                "error": error,
            }),
            RetryEventKind::Success { attempts } => {
                json!({ "kind": "retry_success", "attempts": *attempts })
            }
            RetryEventKind::Error { attempts, error } => {
                json!({ "kind": "retry_error", "attempts": *attempts, "error": error })
            }
            RetryEventKind::IgnoredError { error } => {
                json!({ "kind": "retry_ignored_error", "error": error })
            }
        },
    };
    value["name"] = json!(event.name());
    value["timestamp_ms"] = json!(event.timestamp_millis());
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transition() -> PolicyEvent {
        PolicyEvent::CircuitBreaker(CircuitBreakerEvent {
            name: "a".into(),
            timestamp_millis: 42,
            kind: CircuitBreakerEventKind::StateTransition {
                from: CircuitState::Closed,
                to: CircuitState::Open,
            },
        })
    }

    #[test]
    fn display_includes_name_and_kind() {
        assert_eq!(transition().to_string(), "CircuitBreaker[a]::StateTransition(CLOSED -> OPEN)");

        let retry = PolicyEvent::Retry(RetryEvent {
            name: "b".into(),
            timestamp_millis: 0,
            kind: RetryEventKind::Retry {
                attempt: 1,
                wait: Duration::from_millis(500),
                error: "Server fault".into(),
            },
        });
        assert_eq!(retry.to_string(), "Retry[b]::Retry(#1, wait=500ms, error=Server fault)");
    }

    #[test]
    fn accessors_split_by_source() {
        let event = transition();
        assert_eq!(event.name(), "a");
        assert_eq!(event.timestamp_millis(), 42);
        assert!(event.as_circuit_breaker().is_some());
        assert!(event.as_retry().is_none());
    }

    #[cfg(feature = "telemetry-json")]
    #[test]
    fn json_carries_name_and_timestamp() {
        let v = event_to_json(&transition());
        assert_eq!(v["kind"], "circuit_state_transition");
        assert_eq!(v["from"], "CLOSED");
        assert_eq!(v["to"], "OPEN");
        assert_eq!(v["name"], "a");
        assert_eq!(v["timestamp_ms"], 42);
    }
}
