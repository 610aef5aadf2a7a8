//! Registry of named circuit breakers, one per downstream dependency.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::BreakerOptions;
use crate::resilience::circuit_breaker::{
    BreakerStatus, CircuitBreaker, CircuitState, StateObserver,
};

/// Well-known dependency names.
pub const REASONING_PROVIDER: &str = "reasoning_provider";
pub const MESSAGE_SEND: &str = "message_send";
pub const DATA_STORE: &str = "data_store";

/// Owns every breaker for the process lifetime.
///
/// Breakers are isolated: failures recorded against one name never affect
/// another.
pub struct CircuitBreakerRegistry {
    breakers: RwLock<HashMap<String, Arc<CircuitBreaker>>>,
    defaults: BreakerOptions,
    observer: Option<StateObserver>,
}

impl CircuitBreakerRegistry {
    /// Create an empty registry using `defaults` for breakers created
    /// without explicit options.
    pub fn new(defaults: BreakerOptions) -> Self {
        Self {
            breakers: RwLock::new(HashMap::new()),
            defaults,
            observer: None,
        }
    }

    /// Observer attached to every breaker this registry creates from now on.
    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Return the breaker named `name`, creating it on first use.
    ///
    /// `options` only apply when the breaker is created; an existing breaker
    /// keeps the thresholds it was built with.
    pub fn get(&self, name: &str, options: Option<BreakerOptions>) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.read().get(name) {
            return Arc::clone(existing);
        }

        let mut breakers = self.breakers.write();
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            let options = options.unwrap_or_else(|| self.defaults.clone());
            tracing::debug!(
                circuit = name,
                failure_threshold = options.failure_threshold,
                success_threshold = options.success_threshold,
                "Registered circuit breaker"
            );
            let breaker = CircuitBreaker::new(name, options);
            let breaker = match &self.observer {
                Some(observer) => breaker.with_observer(Arc::clone(observer)),
                None => breaker,
            };
            Arc::new(breaker)
        });
        Arc::clone(breaker)
    }

    /// Remove a breaker. Holders of the `Arc` keep a working instance.
    pub fn remove(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.write().remove(name)
    }

    /// Status of every breaker, sorted by name.
    pub fn all_status(&self) -> Vec<BreakerStatus> {
        let mut statuses: Vec<BreakerStatus> =
            self.breakers.read().values().map(|b| b.status()).collect();
        statuses.sort_by(|a, b| a.name.cmp(&b.name));
        statuses
    }

    /// Names of breakers currently open, sorted.
    pub fn open_circuits(&self) -> Vec<String> {
        let mut open: Vec<String> = self
            .breakers
            .read()
            .values()
            .filter(|b| b.state() == CircuitState::Open)
            .map(|b| b.name().to_string())
            .collect();
        open.sort();
        open
    }

    /// Close every breaker.
    pub fn reset_all(&self) {
        let breakers: Vec<Arc<CircuitBreaker>> = self.breakers.read().values().cloned().collect();
        for breaker in breakers {
            breaker.reset();
        }
        tracing::info!("All circuit breakers reset");
    }

    pub fn len(&self) -> usize {
        self.breakers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.read().is_empty()
    }
}

impl Default for CircuitBreakerRegistry {
    fn default() -> Self {
        Self::new(BreakerOptions::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::circuit_breaker::StateChange;
    use std::time::Duration;

    fn tight() -> BreakerOptions {
        BreakerOptions {
            failure_threshold: 1,
            success_threshold: 1,
            reset_timeout: Duration::from_secs(60),
            call_timeout: None,
        }
    }

    #[tokio::test]
    async fn get_returns_same_instance() {
        let registry = CircuitBreakerRegistry::default();
        let a = registry.get(REASONING_PROVIDER, None);
        let b = registry.get(REASONING_PROVIDER, Some(tight()));
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.options().failure_threshold, 5);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn breakers_are_isolated() {
        let registry = CircuitBreakerRegistry::new(tight());
        let calendar = registry.get("calendar", None);
        let llm = registry.get(REASONING_PROVIDER, None);

        let _ = calendar
            .execute(|| async { Err::<(), _>("calendar down") })
            .await;

        assert!(calendar.is_open());
        assert_eq!(llm.state(), CircuitState::Closed);
        assert!(llm.execute(|| async { Ok::<_, String>(1) }).await.is_ok());
        assert_eq!(registry.open_circuits(), vec!["calendar".to_string()]);
    }

    #[tokio::test]
    async fn removed_breaker_starts_fresh() {
        let registry = CircuitBreakerRegistry::new(tight());
        let old = registry.get("calendar", None);
        let _ = old.execute(|| async { Err::<(), _>("calendar down") }).await;
        assert!(old.is_open());

        let removed = registry.remove("calendar").unwrap();
        assert!(Arc::ptr_eq(&old, &removed));
        assert!(registry.is_empty());
        assert!(registry.remove("calendar").is_none());

        let fresh = registry.get("calendar", None);
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_eq!(fresh.state(), CircuitState::Closed);
        assert!(old.is_open());
    }

    #[tokio::test]
    async fn all_status_and_reset_all() {
        let registry = CircuitBreakerRegistry::new(tight());
        for name in [MESSAGE_SEND, DATA_STORE] {
            let _ = registry
                .get(name, None)
                .execute(|| async { Err::<(), _>("down") })
                .await;
        }

        let statuses = registry.all_status();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses[0].name, DATA_STORE);
        assert!(statuses.iter().all(|s| s.state == CircuitState::Open));

        registry.reset_all();
        assert!(registry.open_circuits().is_empty());
    }

    #[tokio::test]
    async fn registry_observer_is_attached() {
        let count = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let sink = Arc::clone(&count);
        let registry = CircuitBreakerRegistry::new(tight()).with_observer(Arc::new(move |_: &StateChange| {
            sink.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        }));

        let _ = registry
            .get(MESSAGE_SEND, None)
            .execute(|| async { Err::<(), _>("down") })
            .await;
        assert_eq!(count.load(std::sync::atomic::Ordering::SeqCst), 1);
    }
}
