//! Orchestrator counters.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

/// Snapshot returned by `Orchestrator::stats`.
#[derive(Debug, Clone, Serialize)]
pub struct OrchestratorStats {
    pub total_processed: u64,
    pub total_errors: u64,
    pub total_deadlocks: u64,
    pub total_timeouts: u64,
    pub total_overloaded: u64,
    /// Running mean over every terminal processing attempt.
    pub average_processing_ms: f64,
    pub active_locks: usize,
    pub queue_sizes: BTreeMap<String, usize>,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: u64,
}

impl OrchestratorStats {
    pub fn queued_total(&self) -> usize {
        self.queue_sizes.values().sum()
    }
}

#[derive(Debug, Default, Clone)]
struct Counters {
    total_processed: u64,
    total_errors: u64,
    total_deadlocks: u64,
    total_timeouts: u64,
    total_overloaded: u64,
    timed_attempts: u64,
    average_ms: f64,
}

impl Counters {
    fn observe(&mut self, duration: Duration) {
        self.timed_attempts += 1;
        let sample = duration.as_secs_f64() * 1000.0;
        self.average_ms += (sample - self.average_ms) / self.timed_attempts as f64;
    }
}

/// Thread-safe counter set. Each terminal outcome is recorded exactly once
/// by the orchestrator.
pub(crate) struct StatsRecorder {
    counters: Mutex<Counters>,
    started: Mutex<(Instant, DateTime<Utc>)>,
}

impl StatsRecorder {
    pub(crate) fn new() -> Self {
        Self {
            counters: Mutex::new(Counters::default()),
            started: Mutex::new((Instant::now(), Utc::now())),
        }
    }

    pub(crate) fn record_success(&self, duration: Duration) {
        let mut counters = self.counters.lock();
        counters.total_processed += 1;
        counters.observe(duration);
    }

    pub(crate) fn record_failure(&self, duration: Duration, timed_out: bool) {
        let mut counters = self.counters.lock();
        counters.total_errors += 1;
        if timed_out {
            counters.total_timeouts += 1;
        }
        counters.observe(duration);
    }

    /// An error with no processing attempt behind it, e.g. a queued message
    /// dropped after too many retries. Not part of the average.
    pub(crate) fn record_dropped(&self) {
        self.counters.lock().total_errors += 1;
    }

    pub(crate) fn record_overloaded(&self) {
        self.counters.lock().total_overloaded += 1;
    }

    pub(crate) fn record_deadlocks(&self, count: u64) {
        self.counters.lock().total_deadlocks += count;
    }

    pub(crate) fn snapshot(
        &self,
        active_locks: usize,
        queue_sizes: BTreeMap<String, usize>,
    ) -> OrchestratorStats {
        let counters = self.counters.lock().clone();
        let (started, started_at) = *self.started.lock();
        OrchestratorStats {
            total_processed: counters.total_processed,
            total_errors: counters.total_errors,
            total_deadlocks: counters.total_deadlocks,
            total_timeouts: counters.total_timeouts,
            total_overloaded: counters.total_overloaded,
            average_processing_ms: counters.average_ms,
            active_locks,
            queue_sizes,
            started_at,
            uptime_secs: started.elapsed().as_secs(),
        }
    }

    pub(crate) fn reset(&self) {
        *self.counters.lock() = Counters::default();
        *self.started.lock() = (Instant::now(), Utc::now());
    }
}
