//! Circuit breaker around a single downstream dependency.
//!
//! ```text
//! Closed   → Open:     failure_threshold consecutive failures
//! Open     → HalfOpen: first call after reset_timeout (before it executes)
//! HalfOpen → Closed:   success_threshold consecutive probe successes
//! HalfOpen → Open:     any probe failure
//! ```
//!
//! Only one probe runs at a time while half-open; concurrent callers are
//! rejected as if the circuit were still open.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::config::BreakerOptions;
use crate::error::CircuitError;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        };
        write!(f, "{s}")
    }
}

/// Passed to the observer on every state transition.
#[derive(Debug, Clone, Serialize)]
pub struct StateChange {
    pub name: String,
    pub from: CircuitState,
    pub to: CircuitState,
    pub failure_count: u32,
    pub last_error: Option<String>,
}

/// Callback invoked on state transitions.
pub type StateObserver = Arc<dyn Fn(&StateChange) + Send + Sync>;

/// Per-call counters. Rejected calls count too.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BreakerStats {
    pub total_calls: u64,
    pub successful_calls: u64,
    pub failed_calls: u64,
    pub rejected_calls: u64,
    pub timeouts: u64,
    /// Admitted calls whose future was dropped before settling.
    pub abandoned_calls: u64,
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub stats: BreakerStats,
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    next_attempt_at: Option<Instant>,
    next_attempt_wall: Option<DateTime<Utc>>,
    last_error: Option<String>,
    probe_in_flight: bool,
    stats: BreakerStats,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            next_attempt_at: None,
            next_attempt_wall: None,
            last_error: None,
            probe_in_flight: false,
            stats: BreakerStats::default(),
        }
    }
}

/// Guards one dependency and fails fast once it is unhealthy.
pub struct CircuitBreaker {
    name: String,
    options: BreakerOptions,
    inner: Mutex<BreakerInner>,
    observer: Option<StateObserver>,
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, options: BreakerOptions) -> Self {
        Self {
            name: name.into(),
            options: BreakerOptions {
                failure_threshold: options.failure_threshold.max(1),
                success_threshold: options.success_threshold.max(1),
                ..options
            },
            inner: Mutex::new(BreakerInner::new()),
            observer: None,
        }
    }

    /// Attach a state-transition observer.
    pub fn with_observer(mut self, observer: StateObserver) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn options(&self) -> &BreakerOptions {
        &self.options
    }

    /// Current state (no transition is performed by looking).
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Run `f` through the breaker.
    ///
    /// While open, returns `CircuitError::Open` without calling `f`.
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut call = self.admit()?;

        let result = match self.options.call_timeout {
            Some(timeout) => match tokio::time::timeout(timeout, f()).await {
                Ok(inner) => inner.map_err(CircuitError::Failed),
                Err(_) => Err(CircuitError::Timeout {
                    name: self.name.clone(),
                    timeout,
                }),
            },
            None => f().await.map_err(CircuitError::Failed),
        };

        match &result {
            Ok(_) => call.succeed(),
            Err(err) => {
                let timed_out = matches!(err, CircuitError::Timeout { .. });
                call.fail(err.to_string(), timed_out);
            }
        }

        result
    }

    /// Force the breaker back to closed and clear its counters.
    /// Call statistics are kept.
    pub fn reset(&self) {
        let change = {
            let mut inner = self.inner.lock();
            let change = self.transition(&mut inner, CircuitState::Closed);
            inner.failure_count = 0;
            inner.success_count = 0;
            inner.next_attempt_at = None;
            inner.next_attempt_wall = None;
            inner.last_error = None;
            inner.probe_in_flight = false;
            change
        };
        self.notify(change);
    }

    /// Snapshot for introspection.
    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock();
        BreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            next_attempt_at: inner.next_attempt_wall,
            last_error: inner.last_error.clone(),
            stats: inner.stats.clone(),
        }
    }

    fn admit<E>(&self) -> Result<CallPermit<'_>, CircuitError<E>> {
        let (permit, change) = {
            let mut inner = self.inner.lock();
            inner.stats.total_calls += 1;

            match inner.state {
                CircuitState::Closed => (Ok(false), None),
                CircuitState::Open => {
                    let now = Instant::now();
                    match inner.next_attempt_at {
                        Some(at) if now < at => {
                            inner.stats.rejected_calls += 1;
                            (
                                Err(CircuitError::Open {
                                    name: self.name.clone(),
                                    retry_after: at - now,
                                }),
                                None,
                            )
                        }
                        _ => {
                            let change = self.transition(&mut inner, CircuitState::HalfOpen);
                            inner.success_count = 0;
                            inner.probe_in_flight = true;
                            (Ok(true), change)
                        }
                    }
                }
                CircuitState::HalfOpen if inner.probe_in_flight => {
                    inner.stats.rejected_calls += 1;
                    (
                        Err(CircuitError::Open {
                            name: self.name.clone(),
                            retry_after: Duration::ZERO,
                        }),
                        None,
                    )
                }
                CircuitState::HalfOpen => {
                    inner.probe_in_flight = true;
                    (Ok(true), None)
                }
            }
        };
        self.notify(change);

        if permit.is_err() {
            tracing::debug!(circuit = %self.name, "Call rejected by open circuit");
        }

        permit.map(|probe| CallPermit {
            breaker: self,
            probe,
            settled: false,
        })
    }

    fn record_success(&self, probe: bool) {
        let change = {
            let mut inner = self.inner.lock();
            inner.stats.successful_calls += 1;
            if probe {
                inner.probe_in_flight = false;
            }

            match inner.state {
                CircuitState::Closed => {
                    inner.failure_count = 0;
                    None
                }
                CircuitState::HalfOpen => {
                    inner.success_count += 1;
                    if inner.success_count >= self.options.success_threshold {
                        let change = self.transition(&mut inner, CircuitState::Closed);
                        inner.failure_count = 0;
                        inner.success_count = 0;
                        inner.next_attempt_at = None;
                        inner.next_attempt_wall = None;
                        inner.last_error = None;
                        change
                    } else {
                        None
                    }
                }
                // A call admitted while closed finished after the circuit opened.
                CircuitState::Open => None,
            }
        };
        self.notify(change);
    }

    fn record_failure(&self, probe: bool, error: String, timed_out: bool) {
        let change = {
            let mut inner = self.inner.lock();
            inner.stats.failed_calls += 1;
            if timed_out {
                inner.stats.timeouts += 1;
            }
            if probe {
                inner.probe_in_flight = false;
            }
            inner.failure_count += 1;
            inner.last_error = Some(error);

            let should_open = match inner.state {
                CircuitState::Closed => inner.failure_count >= self.options.failure_threshold,
                CircuitState::HalfOpen => true,
                CircuitState::Open => false,
            };

            if should_open {
                let change = self.transition(&mut inner, CircuitState::Open);
                inner.success_count = 0;
                inner.next_attempt_at = Some(Instant::now() + self.options.reset_timeout);
                inner.next_attempt_wall = chrono::Duration::from_std(self.options.reset_timeout)
                    .ok()
                    .map(|d| Utc::now() + d);
                change
            } else {
                None
            }
        };
        self.notify(change);
    }

    /// Admitted call dropped mid-flight. Counts toward neither success nor
    /// failure, and frees the probe slot.
    fn record_abandoned(&self, probe: bool) {
        let mut inner = self.inner.lock();
        inner.stats.abandoned_calls += 1;
        if probe {
            inner.probe_in_flight = false;
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) -> Option<StateChange> {
        if inner.state == to {
            return None;
        }
        let change = StateChange {
            name: self.name.clone(),
            from: inner.state,
            to,
            failure_count: inner.failure_count,
            last_error: inner.last_error.clone(),
        };
        inner.state = to;
        Some(change)
    }

    fn notify(&self, change: Option<StateChange>) {
        let Some(change) = change else {
            return;
        };

        if change.to == CircuitState::Open {
            tracing::warn!(
                circuit = %change.name,
                from = %change.from,
                failure_count = change.failure_count,
                last_error = change.last_error.as_deref().unwrap_or(""),
                reset_timeout_ms = self.options.reset_timeout.as_millis() as u64,
                "Circuit opened"
            );
        } else {
            tracing::info!(
                circuit = %change.name,
                from = %change.from,
                to = %change.to,
                "Circuit state changed"
            );
        }

        if let Some(observer) = &self.observer {
            observer(&change);
        }
    }
}

/// Outstanding call. Frees the half-open probe slot if the caller's future
/// is dropped before the call settles.
struct CallPermit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    settled: bool,
}

impl CallPermit<'_> {
    fn succeed(&mut self) {
        self.settled = true;
        self.breaker.record_success(self.probe);
    }

    fn fail(&mut self, error: String, timed_out: bool) {
        self.settled = true;
        self.breaker.record_failure(self.probe, error, timed_out);
    }
}

impl Drop for CallPermit<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_abandoned(self.probe);
        }
    }
}
