//! Event stream for breakers and retries.
//!
//! Every breaker and retry owns an [`EventPublisher`]. Consumers attach either a plain callback
//! ([`EventPublisher::on_event`]) or a `tower::Service<PolicyEvent>` sink
//! ([`EventPublisher::forward_to`]). Callbacks run synchronously and never while a breaker lock
//! is held. A breaker delivers its events in the order its decisions were made; a retry delivers
//! each call's events in attempt order. Sinks are driven on the ambient tokio runtime; without
//! one, sink delivery is skipped.
//!
//! ```rust
//! use tripwire::telemetry::{EventPublisher, MemorySink};
//!
//! let publisher = EventPublisher::default();
//! let sink = MemorySink::new();
//! let captured = sink.clone();
//! publisher.on_event(move |event| captured.push(event.clone()));
//! assert_eq!(publisher.consumer_count(), 1);
//! ```

pub mod events;
pub mod sinks;

pub use events::{
    CircuitBreakerEvent, CircuitBreakerEventKind, PolicyEvent, RetryEvent, RetryEventKind,
};
#[cfg(feature = "telemetry-json")]
pub use events::event_to_json;
pub use sinks::{emit_best_effort, LogSink, MemorySink, NullSink, StreamingSink, TelemetrySink};

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

/// Callback invoked for each emitted event.
pub type EventConsumer = Arc<dyn Fn(&PolicyEvent) + Send + Sync>;

/// Fan-out point for one instance's events. Clones share the same consumer list.
#[derive(Clone, Default)]
pub struct EventPublisher {
    consumers: Arc<RwLock<Vec<EventConsumer>>>,
}

impl fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventPublisher").field("consumers", &self.consumer_count()).finish()
    }
}

impl EventPublisher {
    /// Register a callback.
    pub fn on_event<F>(&self, consumer: F)
    where
        F: Fn(&PolicyEvent) + Send + Sync + 'static,
    {
        self.consumers.write().unwrap_or_else(PoisonError::into_inner).push(Arc::new(consumer));
    }

    /// Forward every event to a tower sink on the current tokio runtime.
    pub fn forward_to<S>(&self, sink: S)
    where
        S: TelemetrySink + Sync,
        S::Future: Send + 'static,
    {
        self.on_event(move |event| {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(emit_best_effort(sink.clone(), event.clone()));
            }
        });
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub(crate) fn has_consumers(&self) -> bool {
        self.consumer_count() > 0
    }

    pub(crate) fn publish(&self, event: &PolicyEvent) {
        // Snapshot so a consumer may subscribe further consumers without deadlocking.
        let consumers: Vec<EventConsumer> =
            self.consumers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for consumer in consumers {
            consumer(event);
        }
    }
}
