//! Count-based sliding window of call outcomes.
//!
//! Keeps the last `capacity` outcomes in a ring buffer and maintains aggregate counters
//! incrementally on insert/evict, so rates are O(1) to read. Rates are percentages computed as
//! `100.0 * count / buffered` in `f32`; below the minimum number of calls they report `-1.0`.

use std::collections::VecDeque;

/// Sentinel rate reported while fewer than `minimum_number_of_calls` outcomes are buffered.
pub const RATE_NOT_AVAILABLE: f32 = -1.0;

/// Recorded outcome of one permitted call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    SlowSuccess,
    Failure,
    SlowFailure,
}

impl Outcome {
    pub fn from_call(failed: bool, slow: bool) -> Self {
        match (failed, slow) {
            (false, false) => Outcome::Success,
            (false, true) => Outcome::SlowSuccess,
            (true, false) => Outcome::Failure,
            (true, true) => Outcome::SlowFailure,
        }
    }

    pub fn is_failure(self) -> bool {
        matches!(self, Outcome::Failure | Outcome::SlowFailure)
    }

    pub fn is_slow(self) -> bool {
        matches!(self, Outcome::SlowSuccess | Outcome::SlowFailure)
    }
}

/// Point-in-time view of a window's counters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WindowSnapshot {
    pub buffered_calls: usize,
    pub successful_calls: usize,
    pub failed_calls: usize,
    pub slow_calls: usize,
    pub slow_successful_calls: usize,
    pub slow_failed_calls: usize,
    pub failure_rate: f32,
    pub slow_call_rate: f32,
}

#[derive(Debug, Clone)]
pub struct SlidingWindow {
    buffer: VecDeque<Outcome>,
    capacity: usize,
    minimum_calls: usize,
    failed: usize,
    slow_successful: usize,
    slow_failed: usize,
}

impl SlidingWindow {
    /// A window of `capacity` slots that reports rates once `minimum_calls` are buffered.
    ///
    /// `capacity` is raised to at least one and `minimum_calls` is clamped into `1..=capacity`.
    pub fn new(capacity: usize, minimum_calls: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: VecDeque::with_capacity(capacity),
            capacity,
            minimum_calls: minimum_calls.clamp(1, capacity),
            failed: 0,
            slow_successful: 0,
            slow_failed: 0,
        }
    }

    /// Append an outcome, evicting the oldest one when full. Returns the evicted outcome.
    pub fn record(&mut self, outcome: Outcome) -> Option<Outcome> {
        let evicted = if self.buffer.len() == self.capacity {
            let oldest = self.buffer.pop_front();
            if let Some(old) = oldest {
                self.adjust(old, false);
            }
            oldest
        } else {
            None
        };
        self.buffer.push_back(outcome);
        self.adjust(outcome, true);
        evicted
    }

    fn adjust(&mut self, outcome: Outcome, add: bool) {
        let counter = match outcome {
            Outcome::Success => return,
            Outcome::Failure => &mut self.failed,
            Outcome::SlowSuccess => &mut self.slow_successful,
            Outcome::SlowFailure => {
                if add {
                    self.failed += 1;
                } else {
                    self.failed -= 1;
                }
                &mut self.slow_failed
            }
        };
        if add {
            *counter += 1;
        } else {
            *counter -= 1;
        }
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
        self.failed = 0;
        self.slow_successful = 0;
        self.slow_failed = 0;
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn minimum_calls(&self) -> usize {
        self.minimum_calls
    }

    pub fn buffered_calls(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() == self.capacity
    }

    /// Whether enough calls are buffered for the rates to be evaluated.
    pub fn has_minimum_calls(&self) -> bool {
        self.buffer.len() >= self.minimum_calls
    }

    pub fn failed_calls(&self) -> usize {
        self.failed
    }

    pub fn successful_calls(&self) -> usize {
        self.buffer.len() - self.failed
    }

    pub fn slow_calls(&self) -> usize {
        self.slow_successful + self.slow_failed
    }

    pub fn slow_successful_calls(&self) -> usize {
        self.slow_successful
    }

    pub fn slow_failed_calls(&self) -> usize {
        self.slow_failed
    }

    /// Percentage of failures, or [`RATE_NOT_AVAILABLE`] below the minimum.
    pub fn failure_rate(&self) -> f32 {
        self.rate_of(self.failed)
    }

    /// Percentage of slow calls, or [`RATE_NOT_AVAILABLE`] below the minimum.
    pub fn slow_call_rate(&self) -> f32 {
        self.rate_of(self.slow_calls())
    }

    fn rate_of(&self, count: usize) -> f32 {
        if !self.has_minimum_calls() {
            return RATE_NOT_AVAILABLE;
        }
        count as f32 * 100.0 / self.buffer.len() as f32
    }

    pub fn snapshot(&self) -> WindowSnapshot {
        WindowSnapshot {
            buffered_calls: self.buffered_calls(),
            successful_calls: self.successful_calls(),
            failed_calls: self.failed_calls(),
            slow_calls: self.slow_calls(),
            slow_successful_calls: self.slow_successful,
            slow_failed_calls: self.slow_failed,
            failure_rate: self.failure_rate(),
            slow_call_rate: self.slow_call_rate(),
        }
    }
}
