//! Error types for the circuit breaker and retry policies
use crate::circuit_breaker::CircuitState;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Cap the number of stored failures inside RetryExhausted to avoid unbounded growth.
pub const MAX_RETRY_FAILURES: usize = 10;

/// Unified error type produced by decorated calls.
#[derive(Debug, Clone)]
pub enum ResilienceError<E> {
    /// The circuit breaker rejected the call without invoking the operation.
    NotPermitted {
        /// Name of the breaker that rejected the call.
        name: Arc<str>,
        /// State the breaker was in when it rejected.
        state: CircuitState,
    },
    /// All retry attempts were exhausted.
    RetryExhausted {
        /// Name of the retry instance.
        name: Arc<str>,
        /// Number of attempts made.
        attempts: usize,
        /// Most recent failures, oldest first; the last entry is the terminal error.
        failures: Arc<Vec<ResilienceError<E>>>,
    },
    /// The underlying operation failed
    Inner(E),
}

impl<E: fmt::Display> fmt::Display for ResilienceError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotPermitted { name, state } => {
                write!(f, "circuit breaker '{}' is {} and does not permit further calls", name, state)
            }
            Self::RetryExhausted { name, attempts, failures } => {
                let recorded = failures.len();
                let truncated_note = if recorded < *attempts {
                    format!(" (recorded last {} failures)", recorded)
                } else {
                    String::new()
                };
                match failures.last() {
                    Some(last) => write!(
                        f,
                        "retry '{}' exhausted after {} attempts{}; last error: {}",
                        name, attempts, truncated_note, last
                    ),
                    None => write!(
                        f,
                        "retry '{}' exhausted after {} attempts{}; no recorded failures",
                        name, attempts, truncated_note
                    ),
                }
            }
            Self::Inner(e) => write!(f, "{}", e),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for ResilienceError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Inner(e) => Some(e),
            Self::RetryExhausted { failures, .. } => {
                failures.last().map(|e| e as &dyn std::error::Error)
            }
            Self::NotPermitted { .. } => None,
        }
    }
}

impl<E> From<E> for ResilienceError<E> {
    fn from(error: E) -> Self {
        ResilienceError::Inner(error)
    }
}

impl<E> ResilienceError<E> {
    /// Construct a `RetryExhausted` variant, keeping only the most recent `MAX_RETRY_FAILURES`.
    pub fn retry_exhausted(
        name: impl Into<Arc<str>>,
        attempts: usize,
        failures: Vec<ResilienceError<E>>,
    ) -> Self {
        let trimmed = if failures.len() > MAX_RETRY_FAILURES {
            let skip = failures.len() - MAX_RETRY_FAILURES;
            failures.into_iter().skip(skip).collect()
        } else {
            failures
        };
        ResilienceError::RetryExhausted {
            name: name.into(),
            attempts,
            failures: Arc::new(trimmed),
        }
    }

    /// Check if the breaker rejected this call.
    pub fn is_not_permitted(&self) -> bool {
        matches!(self, Self::NotPermitted { .. })
    }

    /// Check if this error is due to retry exhaustion
    pub fn is_retry_exhausted(&self) -> bool {
        matches!(self, Self::RetryExhausted { .. })
    }

    /// Check if this error wraps an inner error.
    pub fn is_inner(&self) -> bool {
        matches!(self, Self::Inner(_))
    }

    /// Get the inner error if this is an Inner variant
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Borrow the inner error if present.
    pub fn as_inner(&self) -> Option<&E> {
        match self {
            Self::Inner(e) => Some(e),
            _ => None,
        }
    }

    /// Access all recorded failures for RetryExhausted, if present.
    pub fn failures(&self) -> Option<&[ResilienceError<E>]> {
        match self {
            Self::RetryExhausted { failures, .. } => Some(failures.as_slice()),
            _ => None,
        }
    }

    /// Terminal failure of an exhausted retry, or `self` for every other variant.
    pub fn last_failure(&self) -> &ResilienceError<E> {
        match self {
            Self::RetryExhausted { failures, .. } => match failures.last() {
                Some(last) => last.last_failure(),
                None => self,
            },
            other => other,
        }
    }

    /// Domain error at the end of the chain, looking through retry exhaustion.
    pub fn root_inner(&self) -> Option<&E> {
        self.last_failure().as_inner()
    }

    /// Access retry exhaustion info as (attempts, recorded_failures).
    pub fn retry_exhausted_info(&self) -> Option<(usize, usize)> {
        match self {
            Self::RetryExhausted { attempts, failures, .. } => Some((*attempts, failures.len())),
            _ => None,
        }
    }
}

/// A manual state transition that the breaker's state graph does not allow.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("circuit breaker '{name}' tried an illegal state transition from {from} to {to}")]
pub struct IllegalStateTransition {
    /// Breaker name.
    pub name: Arc<str>,
    /// State the breaker was in (and remains in).
    pub from: CircuitState,
    /// Requested target state.
    pub to: CircuitState,
}

/// Errors produced while validating policy configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum ConfigError {
    /// A percentage threshold outside `0..=100` (or not a number).
    #[error("{field} must be within 0..=100 (got {value})")]
    InvalidRate {
        /// Configuration field.
        field: &'static str,
        /// Value provided by caller.
        value: f32,
    },
    /// A count that must be at least one.
    #[error("{field} must be >= 1 (got {value})")]
    ZeroCount {
        /// Configuration field.
        field: &'static str,
        /// Value provided by caller.
        value: usize,
    },
    /// A duration that must be positive.
    #[error("{field} must be > 0 (got {value:?})")]
    ZeroDuration {
        /// Configuration field.
        field: &'static str,
        /// Value provided by caller.
        value: Duration,
    },
}
