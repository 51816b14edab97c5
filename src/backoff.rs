//! Wait strategies between retry attempts.
//!
//! The retry engine calls [`Backoff::delay`] with the 1-indexed number of the attempt that just
//! failed, so the wait before the second attempt is `delay(1)`. `delay(0)` is always zero.
//! Computations that would overflow saturate to [`MAX_BACKOFF`] (1 day).
//!
//! ```rust
//! use std::time::Duration;
//! use tripwire::Backoff;
//!
//! let backoff = Backoff::exponential(Duration::from_millis(100))
//!     .with_max(Duration::from_secs(2))
//!     .unwrap();
//! assert_eq!(backoff.delay(1), Duration::from_millis(100));
//! assert_eq!(backoff.delay(2), Duration::from_millis(200));
//! assert_eq!(backoff.delay(6), Duration::from_secs(2));
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Maximum delay used when calculations overflow (1 day).
pub const MAX_BACKOFF: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors returned by backoff configuration.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum BackoffError {
    #[error("with_max is only valid for linear or exponential backoff")]
    MaxNotSupported,
    #[error("max must be greater than zero")]
    MaxMustBePositive,
    #[error("max ({max:?}) must be >= base ({base:?})")]
    MaxLessThanBase { base: Duration, max: Duration },
    #[error("multiplier must be finite and >= 1.0 (got {0})")]
    InvalidMultiplier(f64),
}

type DelayFn = Arc<dyn Fn(usize) -> Duration + Send + Sync>;

#[derive(Clone)]
enum BackoffKind {
    Fixed(Duration),
    Linear { base: Duration, max: Option<Duration> },
    Exponential { base: Duration, multiplier: f64, max: Option<Duration> },
    Custom(DelayFn),
}

impl fmt::Debug for BackoffKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackoffKind::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            BackoffKind::Linear { base, max } => {
                f.debug_struct("Linear").field("base", base).field("max", max).finish()
            }
            BackoffKind::Exponential { base, multiplier, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("multiplier", multiplier)
                .field("max", max)
                .finish(),
            BackoffKind::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}

/// Backoff strategy: attempt number → wait duration.
#[derive(Debug, Clone)]
pub struct Backoff {
    kind: BackoffKind,
}

impl Backoff {
    /// Same wait before every retry.
    pub fn constant(delay: Duration) -> Self {
        Self { kind: BackoffKind::Fixed(delay) }
    }

    /// `base * attempt`.
    pub fn linear(base: Duration) -> Self {
        Self { kind: BackoffKind::Linear { base, max: None } }
    }

    /// `base * 2^(attempt - 1)`.
    pub fn exponential(base: Duration) -> Self {
        Self { kind: BackoffKind::Exponential { base, multiplier: 2.0, max: None } }
    }

    /// `base * multiplier^(attempt - 1)`; the multiplier must be finite and >= 1.
    pub fn exponential_with_multiplier(
        base: Duration,
        multiplier: f64,
    ) -> Result<Self, BackoffError> {
        if !multiplier.is_finite() || multiplier < 1.0 {
            return Err(BackoffError::InvalidMultiplier(multiplier));
        }
        Ok(Self { kind: BackoffKind::Exponential { base, multiplier, max: None } })
    }

    /// Caller-supplied function of the failed attempt number.
    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(usize) -> Duration + Send + Sync + 'static,
    {
        Self { kind: BackoffKind::Custom(Arc::new(f)) }
    }

    /// Cap linear or exponential growth at `max`.
    pub fn with_max(mut self, max: Duration) -> Result<Self, BackoffError> {
        if max.is_zero() {
            return Err(BackoffError::MaxMustBePositive);
        }
        match &mut self.kind {
            BackoffKind::Linear { base, max: existing }
            | BackoffKind::Exponential { base, max: existing, .. } => {
                if max < *base {
                    return Err(BackoffError::MaxLessThanBase { base: *base, max });
                }
                *existing = Some(max);
                Ok(self)
            }
            BackoffKind::Fixed(_) | BackoffKind::Custom(_) => Err(BackoffError::MaxNotSupported),
        }
    }

    /// Wait after the 1-indexed `attempt` failed.
    pub fn delay(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let raw = match &self.kind {
            BackoffKind::Fixed(d) => *d,
            BackoffKind::Linear { base, max } => {
                let factor = attempt.min(u32::MAX as usize) as u32;
                let linear = base.checked_mul(factor).unwrap_or(MAX_BACKOFF);
                max.map_or(linear, |m| linear.min(m))
            }
            BackoffKind::Exponential { base, multiplier, max } => {
                let exponent = attempt.saturating_sub(1).min(i32::MAX as usize) as i32;
                let nanos = base.as_nanos() as f64 * multiplier.powi(exponent);
                let grown = if nanos.is_finite() && nanos < MAX_BACKOFF.as_nanos() as f64 {
                    Duration::from_nanos(nanos as u64)
                } else {
                    MAX_BACKOFF
                };
                max.map_or(grown, |m| grown.min(m))
            }
            BackoffKind::Custom(f) => f(attempt),
        };
        raw.min(MAX_BACKOFF)
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Backoff::constant(Duration::from_millis(500))
    }
}
