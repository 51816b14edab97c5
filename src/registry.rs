//! Named registries for circuit breakers and retries.
//!
//! A registry lazily creates one instance per name and hands out clones of it afterwards. The
//! configuration for a new instance is, in order of precedence: the config passed to the
//! `*_with_config` lookup, a per-name config added with `add_config`, the registry default.
//! Instances created by one registry share its clock (and, for retries, its sleeper).
//!
//! ```rust
//! use tripwire::{CircuitBreakerRegistry, RegistryEvent};
//!
//! let registry = CircuitBreakerRegistry::builder()
//!     .on_event(|event| {
//!         if let RegistryEvent::Added(cb) = event {
//!             println!("created {}", cb.name());
//!         }
//!     })
//!     .build();
//! let a = registry.circuit_breaker("backendA");
//! let b = registry.circuit_breaker("backendA");
//! assert!(a.ptr_eq(&b));
//! ```

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::clock::{Clock, MonotonicClock};
use crate::retry::{Retry, RetryConfig};
use crate::sleeper::{Sleeper, TokioSleeper};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, warn};

/// Lifecycle change of a registry entry.
#[derive(Debug, Clone)]
pub enum RegistryEvent<I> {
    Added(I),
    Removed(I),
    Replaced { old: I, new: I },
}

/// Callback invoked for each registry event.
pub type RegistryConsumer<I> = Arc<dyn Fn(&RegistryEvent<I>) + Send + Sync>;

/// Errors from registry administration.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry entry '{name}' not found")]
    NotFound { name: String },
}

type Factory<I, C> = Box<dyn Fn(Arc<str>, C) -> I + Send + Sync>;

/// Name → instance map shared by the concrete registries.
struct Registry<I, C> {
    kind: &'static str,
    entries: RwLock<HashMap<String, I>>,
    default_config: C,
    configs: RwLock<HashMap<String, C>>,
    consumers: RwLock<Vec<RegistryConsumer<I>>>,
    factory: Factory<I, C>,
}

impl<I: Clone, C: Clone> Registry<I, C> {
    fn new(
        kind: &'static str,
        default_config: C,
        configs: HashMap<String, C>,
        consumers: Vec<RegistryConsumer<I>>,
        factory: Factory<I, C>,
    ) -> Self {
        Self {
            kind,
            entries: RwLock::new(HashMap::new()),
            default_config,
            configs: RwLock::new(configs),
            consumers: RwLock::new(consumers),
            factory,
        }
    }

    fn publish(&self, event: RegistryEvent<I>) {
        let consumers = self.consumers.read().unwrap_or_else(PoisonError::into_inner).clone();
        for consumer in consumers {
            consumer(&event);
        }
    }

    fn config_for(&self, name: &str) -> C {
        self.configs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .unwrap_or_else(|| self.default_config.clone())
    }

    // Construction happens under the write lock so concurrent first lookups build one instance.
    fn get_or_create(&self, name: &str, config: Option<C>) -> I {
        if let Some(existing) = self.find(name) {
            return existing;
        }
        let created = {
            let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(existing) = entries.get(name) {
                return existing.clone();
            }
            let config = config.unwrap_or_else(|| self.config_for(name));
            let instance = (self.factory)(Arc::from(name), config);
            entries.insert(name.to_string(), instance.clone());
            instance
        };
        debug!(target: "tripwire::registry", kind = self.kind, name, "registry entry created");
        self.publish(RegistryEvent::Added(created.clone()));
        created
    }

    fn find(&self, name: &str) -> Option<I> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).get(name).cloned()
    }

    fn remove(&self, name: &str) -> Option<I> {
        let removed = self.entries.write().unwrap_or_else(PoisonError::into_inner).remove(name);
        if let Some(instance) = &removed {
            debug!(target: "tripwire::registry", kind = self.kind, name, "registry entry removed");
            self.publish(RegistryEvent::Removed(instance.clone()));
        }
        removed
    }

    fn replace(&self, name: &str, instance: I) -> Option<I> {
        let old = self
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(name.to_string(), instance.clone());
        match &old {
            Some(previous) => {
                warn!(
                    target: "tripwire::registry",
                    kind = self.kind,
                    name,
                    "registry entry replaced; last registration wins"
                );
                self.publish(RegistryEvent::Replaced { old: previous.clone(), new: instance });
            }
            None => self.publish(RegistryEvent::Added(instance)),
        }
        old
    }

    fn names(&self) -> Vec<String> {
        let mut names: Vec<String> =
            self.entries.read().unwrap_or_else(PoisonError::into_inner).keys().cloned().collect();
        names.sort();
        names
    }

    fn all(&self) -> Vec<(String, I)> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        let mut all: Vec<(String, I)> =
            entries.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }

    fn add_config(&self, name: impl Into<String>, config: C) {
        self.configs.write().unwrap_or_else(PoisonError::into_inner).insert(name.into(), config);
    }

    fn on_event(&self, consumer: RegistryConsumer<I>) {
        self.consumers.write().unwrap_or_else(PoisonError::into_inner).push(consumer);
    }
}

/// Registry of named circuit breakers.
#[derive(Clone)]
pub struct CircuitBreakerRegistry {
    inner: Arc<Registry<CircuitBreaker, CircuitBreakerConfig>>,
}

impl fmt::Debug for CircuitBreakerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreakerRegistry").field("names", &self.names()).finish()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::of_defaults()
    }
}

impl CircuitBreakerRegistry {
    pub fn builder() -> CircuitBreakerRegistryBuilder {
        CircuitBreakerRegistryBuilder::default()
    }

    /// Registry whose breakers use [`CircuitBreakerConfig::default`].
    pub fn of_defaults() -> Self {
        Self::builder().build()
    }

    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self::builder().default_config(default_config).build()
    }

    /// The breaker named `name`, created on first lookup.
    pub fn circuit_breaker(&self, name: &str) -> CircuitBreaker {
        self.inner.get_or_create(name, None)
    }

    /// The breaker named `name`, created with `config` if it does not exist yet. An existing
    /// breaker is returned unchanged.
    pub fn circuit_breaker_with_config(
        &self,
        name: &str,
        config: CircuitBreakerConfig,
    ) -> CircuitBreaker {
        self.inner.get_or_create(name, Some(config))
    }

    pub fn find(&self, name: &str) -> Option<CircuitBreaker> {
        self.inner.find(name)
    }

    pub fn remove(&self, name: &str) -> Option<CircuitBreaker> {
        self.inner.remove(name)
    }

    /// Register `breaker` under `name`, returning the breaker it displaced.
    pub fn replace(&self, name: &str, breaker: CircuitBreaker) -> Option<CircuitBreaker> {
        self.inner.replace(name, breaker)
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.names()
    }

    /// Every breaker, sorted by name.
    pub fn all(&self) -> Vec<(String, CircuitBreaker)> {
        self.inner.all()
    }

    /// Per-name configuration used when `name` is first created.
    pub fn add_config(&self, name: impl Into<String>, config: CircuitBreakerConfig) {
        self.inner.add_config(name, config);
    }

    pub fn default_config(&self) -> &CircuitBreakerConfig {
        &self.inner.default_config
    }

    pub fn on_event<F>(&self, consumer: F)
    where
        F: Fn(&RegistryEvent<CircuitBreaker>) + Send + Sync + 'static,
    {
        self.inner.on_event(Arc::new(consumer));
    }

    /// Reset a breaker by name, erroring if missing.
    pub fn reset(&self, name: &str) -> Result<(), RegistryError> {
        match self.inner.find(name) {
            Some(breaker) => {
                breaker.reset();
                Ok(())
            }
            None => Err(RegistryError::NotFound { name: name.to_string() }),
        }
    }

    /// Breaker states sorted by name.
    pub fn snapshot(&self) -> Vec<(String, CircuitState)> {
        self.inner.all().into_iter().map(|(name, cb)| (name, cb.state())).collect()
    }
}

/// Builder for [`CircuitBreakerRegistry`].
#[derive(Default)]
pub struct CircuitBreakerRegistryBuilder {
    default_config: CircuitBreakerConfig,
    configs: HashMap<String, CircuitBreakerConfig>,
    consumers: Vec<RegistryConsumer<CircuitBreaker>>,
    clock: Option<Arc<dyn Clock>>,
}

impl CircuitBreakerRegistryBuilder {
    pub fn default_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.default_config = config;
        self
    }

    pub fn add_config(mut self, name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        self.configs.insert(name.into(), config);
        self
    }

    /// Clock shared by every breaker this registry creates.
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    pub fn on_event<F>(mut self, consumer: F) -> Self
    where
        F: Fn(&RegistryEvent<CircuitBreaker>) + Send + Sync + 'static,
    {
        self.consumers.push(Arc::new(consumer));
        self
    }

    pub fn build(self) -> CircuitBreakerRegistry {
        let clock: Arc<dyn Clock> =
            self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default()));
        let factory: Factory<CircuitBreaker, CircuitBreakerConfig> =
            Box::new(move |name, config| {
                CircuitBreaker::new(name, config).with_shared_clock(clock.clone())
            });
        CircuitBreakerRegistry {
            inner: Arc::new(Registry::new(
                "circuit_breaker",
                self.default_config,
                self.configs,
                self.consumers,
                factory,
            )),
        }
    }
}

/// Registry of named retries for domain error type `E`.
pub struct RetryRegistry<E> {
    inner: Arc<Registry<Retry<E>, RetryConfig<E>>>,
}

impl<E> Clone for RetryRegistry<E> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<E> fmt::Debug for RetryRegistry<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryRegistry").field("kind", &self.inner.kind).finish()
    }
}

impl<E> Default for RetryRegistry<E>
where
    E: std::error::Error + 'static,
{
    fn default() -> Self {
        Self::of_defaults()
    }
}

impl<E> RetryRegistry<E>
where
    E: std::error::Error + 'static,
{
    pub fn builder() -> RetryRegistryBuilder<E> {
        RetryRegistryBuilder::default()
    }

    pub fn of_defaults() -> Self {
        Self::builder().build()
    }

    pub fn new(default_config: RetryConfig<E>) -> Self {
        Self::builder().default_config(default_config).build()
    }

    /// The retry named `name`, created on first lookup.
    pub fn retry(&self, name: &str) -> Retry<E> {
        self.inner.get_or_create(name, None)
    }

    pub fn retry_with_config(&self, name: &str, config: RetryConfig<E>) -> Retry<E> {
        self.inner.get_or_create(name, Some(config))
    }

    pub fn find(&self, name: &str) -> Option<Retry<E>> {
        self.inner.find(name)
    }

    pub fn remove(&self, name: &str) -> Option<Retry<E>> {
        self.inner.remove(name)
    }

    pub fn replace(&self, name: &str, retry: Retry<E>) -> Option<Retry<E>> {
        self.inner.replace(name, retry)
    }

    pub fn names(&self) -> Vec<String> {
        self.inner.names()
    }

    pub fn all(&self) -> Vec<(String, Retry<E>)> {
        self.inner.all()
    }

    pub fn add_config(&self, name: impl Into<String>, config: RetryConfig<E>) {
        self.inner.add_config(name, config);
    }

    pub fn on_event<F>(&self, consumer: F)
    where
        F: Fn(&RegistryEvent<Retry<E>>) + Send + Sync + 'static,
    {
        self.inner.on_event(Arc::new(consumer));
    }
}

/// Builder for [`RetryRegistry`].
pub struct RetryRegistryBuilder<E> {
    default_config: RetryConfig<E>,
    configs: HashMap<String, RetryConfig<E>>,
    consumers: Vec<RegistryConsumer<Retry<E>>>,
    clock: Option<Arc<dyn Clock>>,
    sleeper: Option<Arc<dyn Sleeper>>,
}

impl<E> Default for RetryRegistryBuilder<E> {
    fn default() -> Self {
        Self {
            default_config: RetryConfig::default(),
            configs: HashMap::new(),
            consumers: Vec::new(),
            clock: None,
            sleeper: None,
        }
    }
}

impl<E> RetryRegistryBuilder<E>
where
    E: std::error::Error + 'static,
{
    pub fn default_config(mut self, config: RetryConfig<E>) -> Self {
        self.default_config = config;
        self
    }

    pub fn add_config(mut self, name: impl Into<String>, config: RetryConfig<E>) -> Self {
        self.configs.insert(name.into(), config);
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Some(Arc::new(clock));
        self
    }

    /// Sleeper shared by every retry this registry creates.
    pub fn with_sleeper<S: Sleeper + 'static>(mut self, sleeper: S) -> Self {
        self.sleeper = Some(Arc::new(sleeper));
        self
    }

    pub fn on_event<F>(mut self, consumer: F) -> Self
    where
        F: Fn(&RegistryEvent<Retry<E>>) + Send + Sync + 'static,
    {
        self.consumers.push(Arc::new(consumer));
        self
    }

    pub fn build(self) -> RetryRegistry<E> {
        let clock: Arc<dyn Clock> =
            self.clock.unwrap_or_else(|| Arc::new(MonotonicClock::default()));
        let sleeper: Arc<dyn Sleeper> = self.sleeper.unwrap_or_else(|| Arc::new(TokioSleeper));
        let factory: Factory<Retry<E>, RetryConfig<E>> = Box::new(move |name, config| {
            Retry::new(name, config).with_shared_parts(clock.clone(), sleeper.clone())
        });
        RetryRegistry {
            inner: Arc::new(Registry::new(
                "retry",
                self.default_config,
                self.configs,
                self.consumers,
                factory,
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tracing_subscriber::fmt::writer::BoxMakeWriter;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone)]
    struct SharedWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for SharedWriter {
        type Writer = SharedGuard;
        fn make_writer(&'a self) -> Self::Writer {
            SharedGuard(self.0.clone())
        }
    }

    struct SharedGuard(Arc<Mutex<Vec<u8>>>);
    impl std::io::Write for SharedGuard {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }
        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn replace_warns_and_last_registration_wins() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let writer = SharedWriter(buffer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_writer(BoxMakeWriter::new(writer))
            .with_target(true)
            .without_time()
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let registry = CircuitBreakerRegistry::of_defaults();
        let first = registry.circuit_breaker("svc");
        let second = CircuitBreaker::of_defaults("svc");
        let displaced = registry.replace("svc", second.clone()).expect("entry present");

        assert!(displaced.ptr_eq(&first));
        assert!(registry.circuit_breaker("svc").ptr_eq(&second));

        let logs = String::from_utf8(buffer.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("registry entry replaced"), "warning should be emitted on replace");
    }

    #[test]
    fn lookups_are_idempotent_per_name() {
        let registry = CircuitBreakerRegistry::of_defaults();
        let a = registry.circuit_breaker("a");
        assert!(registry.circuit_breaker("a").ptr_eq(&a));
        assert!(!registry.circuit_breaker("b").ptr_eq(&a));
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn config_precedence() {
        let named = CircuitBreakerConfig::builder().sliding_window_size(7).build().unwrap();
        let explicit = CircuitBreakerConfig::builder().sliding_window_size(3).build().unwrap();
        let registry = CircuitBreakerRegistry::builder().add_config("named", named).build();

        assert_eq!(registry.circuit_breaker("named").config().sliding_window_size(), 7);
        assert_eq!(registry.circuit_breaker("other").config().sliding_window_size(), 100);
        assert_eq!(
            registry.circuit_breaker_with_config("explicit", explicit.clone()).config().sliding_window_size(),
            3
        );
        // An existing breaker keeps its original configuration.
        assert_eq!(
            registry.circuit_breaker_with_config("other", explicit).config().sliding_window_size(),
            100
        );
    }

    #[test]
    fn events_cover_add_remove_replace() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        let registry = CircuitBreakerRegistry::builder()
            .on_event(move |event| {
                let label = match event {
                    RegistryEvent::Added(cb) => format!("added {}", cb.name()),
                    RegistryEvent::Removed(cb) => format!("removed {}", cb.name()),
                    RegistryEvent::Replaced { new, .. } => format!("replaced {}", new.name()),
                };
                log.lock().unwrap().push(label);
            })
            .build();

        registry.circuit_breaker("a");
        registry.circuit_breaker("a");
        registry.replace("a", CircuitBreaker::of_defaults("a"));
        assert!(registry.remove("a").is_some());
        assert!(registry.remove("a").is_none());

        assert_eq!(*seen.lock().unwrap(), vec!["added a", "replaced a", "removed a"]);
    }

    #[test]
    fn reset_and_snapshot_by_name() {
        let registry = CircuitBreakerRegistry::of_defaults();
        registry.circuit_breaker("b").transition_to_open_state().unwrap();
        registry.circuit_breaker("a");
        assert_eq!(
            registry.snapshot(),
            vec![("a".to_string(), CircuitState::Closed), ("b".to_string(), CircuitState::Open)]
        );
        registry.reset("b").unwrap();
        assert_eq!(registry.circuit_breaker("b").state(), CircuitState::Closed);
        assert_eq!(
            registry.reset("missing"),
            Err(RegistryError::NotFound { name: "missing".into() })
        );
    }

    #[test]
    fn breakers_share_the_registry_clock() {
        let clock = ManualClock::new();
        let config = CircuitBreakerConfig::builder()
            .automatic_transition_from_open_to_half_open(true)
            .wait_duration_in_open_state(Duration::from_secs(5))
            .build()
            .unwrap();
        let registry =
            CircuitBreakerRegistry::builder().default_config(config).with_clock(clock.clone()).build();
        let cb = registry.circuit_breaker("a");
        cb.transition_to_open_state().unwrap();
        clock.advance(5_000);
        assert_eq!(cb.state(), CircuitState::HalfOpen);
    }

    #[test]
    fn concurrent_first_lookups_create_one_instance() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let registry = CircuitBreakerRegistry::builder()
            .on_event(move |event| {
                if matches!(event, RegistryEvent::Added(_)) {
                    counter.fetch_add(1, Ordering::SeqCst);
                }
            })
            .build();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = registry.clone();
                std::thread::spawn(move || registry.circuit_breaker("shared"))
            })
            .collect();
        let breakers: Vec<CircuitBreaker> =
            handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        assert!(breakers.iter().all(|cb| cb.ptr_eq(&breakers[0])));
    }

    #[derive(Debug)]
    struct TestError;

    impl fmt::Display for TestError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "test error")
        }
    }

    impl std::error::Error for TestError {}

    #[tokio::test]
    async fn retries_share_the_registry_sleeper() {
        let sleeper = crate::TrackingSleeper::new();
        let registry = RetryRegistry::<TestError>::builder()
            .add_config("quick", RetryConfig::builder().max_attempts(2).build().unwrap())
            .with_sleeper(sleeper.clone())
            .build();

        let retry = registry.retry("quick");
        assert!(registry.retry("quick").ptr_eq(&retry));
        assert_eq!(registry.retry("default").config().max_attempts(), 3);

        let result = retry.execute(|| async { Err::<(), _>(TestError) }).await;
        assert!(result.unwrap_err().is_retry_exhausted());
        assert_eq!(sleeper.calls(), 1);
        assert_eq!(registry.names(), vec!["default".to_string(), "quick".to_string()]);
    }
}
