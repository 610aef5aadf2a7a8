//! Conversation lock and queue manager.
//!
//! Guarantees at most one in-flight processing attempt per conversation,
//! strict arrival order within a conversation, and a global ceiling on the
//! number of conversations processed at once.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use crate::config::OrchestratorConfig;
use crate::error::ProcessingError;
use crate::inbound::InboundMessage;
use crate::orchestrator::events::{EventBus, LifecycleEvent, ReleaseReason};
use crate::orchestrator::lock::{
    Admit, AdvanceStep, ConversationLock, ConversationTable, HolderState, LockTicket, QueueEntry,
    Released,
};
use crate::orchestrator::processor::{
    MessageProcessor, ProcessingContext, ProcessingOutcome, Reply,
};
use crate::orchestrator::stats::{OrchestratorStats, StatsRecorder};

/// Owner label for locks taken by `submit`.
const SUBMIT_OWNER: &str = "submit";

/// How long a timed-out task gets to unwind after abort before its lock is
/// released anyway.
const ABORT_WAIT: Duration = Duration::from_secs(1);

/// Serializes processing per conversation.
pub struct Orchestrator {
    config: OrchestratorConfig,
    table: Mutex<ConversationTable>,
    stats: StatsRecorder,
    events: EventBus,
    tracker: TaskTracker,
    shutdown: CancellationToken,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            table: Mutex::new(ConversationTable::default()),
            stats: StatsRecorder::new(),
            events: EventBus::new(),
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Submit a message for processing.
    ///
    /// Runs the processor right away when the conversation is free, queues
    /// the message behind the current holder otherwise. Never returns an
    /// error: failures come back as `Failed` with the fallback reply.
    pub async fn submit(
        self: &Arc<Self>,
        conversation_id: &str,
        message: InboundMessage,
        processor: Arc<dyn MessageProcessor>,
    ) -> ProcessingOutcome {
        self.events.emit(LifecycleEvent::Received {
            conversation_id: conversation_id.to_string(),
            message_id: message.id.clone(),
        });

        // Lazy recovery: a lock held past the timeout does not block us.
        self.is_locked(conversation_id);

        let message_id = message.id.clone();
        let admit = self.table.lock().admit(
            conversation_id,
            QueueEntry::new(message, processor),
            self.config.max_concurrent_contacts,
            self.config.max_queue_size,
            SUBMIT_OWNER,
        );

        match admit {
            Admit::Acquired { lock, entry } => self.run_locked(lock, entry).await,
            Admit::Queued {
                position,
                evicted,
                schedule,
            } => {
                let evicted_message_id = evicted.map(|entry| entry.message.id);
                if let Some(evicted_id) = &evicted_message_id {
                    tracing::warn!(
                        conversation_id,
                        evicted_id = %evicted_id,
                        "Queue full, dropped oldest queued message"
                    );
                }
                tracing::debug!(conversation_id, message_id = %message_id, position, "Message queued");
                self.events.emit(LifecycleEvent::Queued {
                    conversation_id: conversation_id.to_string(),
                    message_id,
                    position,
                    evicted_message_id,
                });
                if schedule {
                    self.schedule_advance(conversation_id.to_string());
                }
                ProcessingOutcome::Queued { position }
            }
            Admit::Overloaded { active, entry } => {
                let error = ProcessingError::Overloaded {
                    active,
                    max: self.config.max_concurrent_contacts,
                };
                tracing::warn!(conversation_id, active, "Rejecting message: {}", error);
                self.stats.record_overloaded();
                self.emit_error(conversation_id, Some(entry.message.id), &error);
                ProcessingOutcome::Overloaded {
                    reply: self.fallback_reply(),
                }
            }
        }
    }

    /// Run one attempt under `lock`. The lock is released before returning.
    async fn run_locked(
        self: &Arc<Self>,
        lock: ConversationLock,
        entry: QueueEntry,
    ) -> ProcessingOutcome {
        let lease = LockLease::new(Arc::clone(self), &lock);
        let conversation_id = lock.conversation_id.clone();
        let message_id = entry.message.id.clone();
        let timeout = self.config.processing_timeout;

        tracing::info!(
            conversation_id = %conversation_id,
            process_id = %lock.process_id,
            owner = %lock.owner_label,
            "Conversation lock acquired"
        );
        self.events.emit(LifecycleEvent::LockAcquired {
            conversation_id: conversation_id.clone(),
            process_id: lock.process_id,
            owner_label: lock.owner_label.clone(),
        });

        let ctx = ProcessingContext::new(
            conversation_id.clone(),
            lock.process_id,
            entry.attempts + 1,
            timeout.saturating_sub(lock.age()),
            lock.cancel.clone(),
        );
        let QueueEntry {
            message, processor, ..
        } = entry;

        // The deadline counts from lock creation, same as lock age.
        let deadline = tokio::time::Instant::from_std(lock.started) + timeout;
        let started = Instant::now();
        let mut task = tokio::spawn(async move { processor.process(message, ctx).await });
        self.table
            .lock()
            .attach_task(&conversation_id, lock.process_id, task.abort_handle());

        let result = tokio::time::timeout_at(deadline, &mut task).await;
        let duration = started.elapsed();

        let attempt: Result<Reply, ProcessingError> = match result {
            Ok(Ok(Ok(reply))) => Ok(reply),
            Ok(Ok(Err(e))) => Err(ProcessingError::Failed {
                conversation_id: conversation_id.clone(),
                reason: e.to_string(),
            }),
            Ok(Err(join_err)) if join_err.is_panic() => Err(ProcessingError::Panicked {
                conversation_id: conversation_id.clone(),
            }),
            Ok(Err(join_err)) => Err(ProcessingError::Failed {
                conversation_id: conversation_id.clone(),
                reason: join_err.to_string(),
            }),
            Err(_) => {
                task.abort();
                // Let the aborted future drop before the conversation frees up
                let _ = tokio::time::timeout(ABORT_WAIT, &mut task).await;
                Err(ProcessingError::Timeout {
                    conversation_id: conversation_id.clone(),
                    timeout,
                })
            }
        };

        let (outcome, reason) = match attempt {
            Ok(reply) if reply.is_deliverable() => {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    duration_ms = duration.as_millis() as u64,
                    "Message processed"
                );
                self.stats.record_success(duration);
                (
                    ProcessingOutcome::Processed { reply, duration },
                    ReleaseReason::Completed,
                )
            }
            Ok(_) => {
                let error = ProcessingError::InvalidReply {
                    conversation_id: conversation_id.clone(),
                    reason: "empty payload".to_string(),
                };
                tracing::warn!(conversation_id = %conversation_id, "{}, using fallback", error);
                self.stats.record_success(duration);
                (
                    ProcessingOutcome::Processed {
                        reply: self.fallback_reply(),
                        duration,
                    },
                    ReleaseReason::Completed,
                )
            }
            Err(error) => {
                let timed_out = matches!(error, ProcessingError::Timeout { .. });
                tracing::warn!(conversation_id = %conversation_id, kind = error.kind(), "{}", error);
                self.stats.record_failure(duration, timed_out);
                self.emit_error(&conversation_id, Some(message_id.clone()), &error);
                let reason = if timed_out {
                    ReleaseReason::TimedOut
                } else {
                    ReleaseReason::Failed
                };
                (
                    ProcessingOutcome::Failed {
                        reply: self.fallback_reply(),
                        error,
                    },
                    reason,
                )
            }
        };

        if let Some(reply) = outcome.reply() {
            self.events.emit(LifecycleEvent::Processed {
                conversation_id,
                message_id,
                reply: reply.clone(),
                duration_ms: duration.as_millis() as u64,
            });
        }

        lease.complete(reason);
        outcome
    }

    /// Release `conversation_id` if `process_id` (when given) is still the
    /// holder. Fires the lock's token and schedules queue advancement.
    fn release_generation(
        self: &Arc<Self>,
        conversation_id: &str,
        process_id: Option<Uuid>,
        reason: ReleaseReason,
    ) -> bool {
        let released = self.table.lock().release(conversation_id, process_id);
        let Some(released) = released else {
            return false;
        };
        self.finish_release(released, reason);
        true
    }

    /// Cancel the lock's token, abort any task still running under it and
    /// hand the queue on.
    fn finish_release(self: &Arc<Self>, released: Released, reason: ReleaseReason) {
        let Released {
            lock,
            task,
            schedule,
        } = released;
        lock.cancel.cancel();
        if let Some(task) = task {
            task.abort();
        }
        let held_ms = lock.age().as_millis() as u64;
        tracing::info!(
            conversation_id = %lock.conversation_id,
            process_id = %lock.process_id,
            ?reason,
            held_ms,
            "Conversation lock released"
        );
        self.events.emit(LifecycleEvent::LockReleased {
            conversation_id: lock.conversation_id.clone(),
            process_id: lock.process_id,
            reason,
            held_ms,
        });
        if schedule {
            self.schedule_advance(lock.conversation_id);
        }
    }

    /// Start the queue head after `queue_advance_delay` on a tracked task.
    fn schedule_advance(self: &Arc<Self>, conversation_id: String) {
        if self.shutdown.is_cancelled() || tokio::runtime::Handle::try_current().is_err() {
            self.table.lock().unmark_advancing(&conversation_id);
            return;
        }

        let this = Arc::clone(self);
        let delay = self.config.queue_advance_delay;
        let shutdown = self.shutdown.clone();
        self.tracker.spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    this.table.lock().unmark_advancing(&conversation_id);
                }
                _ = tokio::time::sleep(delay) => {
                    this.advance_queue(conversation_id).await;
                }
            }
        });
    }

    async fn advance_queue(self: Arc<Self>, conversation_id: String) {
        let step = self.table.lock().advance(
            &conversation_id,
            self.config.max_concurrent_contacts,
            self.config.max_queue_attempts,
        );

        match step {
            AdvanceStep::Idle | AdvanceStep::Busy => {}
            AdvanceStep::Retry { attempts } => {
                tracing::debug!(
                    conversation_id = %conversation_id,
                    attempts,
                    "At capacity, retrying queued message later"
                );
                self.schedule_advance(conversation_id);
            }
            AdvanceStep::Exhausted { entry, more } => {
                let error = ProcessingError::QueueAttemptsExhausted {
                    conversation_id: conversation_id.clone(),
                    attempts: entry.attempts,
                };
                tracing::warn!(conversation_id = %conversation_id, "{}", error);
                self.stats.record_dropped();
                self.emit_error(&conversation_id, Some(entry.message.id), &error);
                if more {
                    self.schedule_advance(conversation_id);
                }
            }
            AdvanceStep::Start { lock, entry } => {
                self.run_locked(lock, entry).await;
            }
        }
    }

    /// Whether `conversation_id` is locked.
    ///
    /// A stale lock is released on the spot and counted as a deadlock. Locks
    /// taken with `try_acquire` go stale after `processing_timeout`; locks
    /// with a running processor get the same amount again on top, since the
    /// processor's own deadline frees them first.
    pub fn is_locked(self: &Arc<Self>, conversation_id: &str) -> bool {
        let state = self.table.lock().holder_state(
            conversation_id,
            self.config.processing_timeout,
            self.stale_grace(),
        );
        let stale = match state {
            HolderState::Free => return false,
            HolderState::Held => return true,
            HolderState::Stale(process_id) => process_id,
        };

        if self.release_generation(conversation_id, Some(stale), ReleaseReason::Stale) {
            tracing::warn!(conversation_id, "Released stale conversation lock");
            self.stats.record_deadlocks(1);
            return false;
        }
        self.table.lock().holder(conversation_id).is_some()
    }

    /// Emergency unlock. `Some(id)` releases that conversation and returns 1
    /// or 0; `None` releases every lock and returns how many were held.
    pub fn force_release(self: &Arc<Self>, conversation_id: Option<&str>) -> usize {
        match conversation_id {
            Some(id) => {
                let released = self.release_generation(id, None, ReleaseReason::Forced);
                if released {
                    tracing::warn!(conversation_id = id, "Force-released conversation lock");
                }
                usize::from(released)
            }
            None => {
                let released = self.table.lock().release_all();
                let count = released.len();
                for lock in released {
                    self.finish_release(lock, ReleaseReason::Forced);
                }
                if count > 0 {
                    tracing::warn!(count, "Force-released all conversation locks");
                }
                count
            }
        }
    }

    /// Take a conversation for an external owner (e.g. a human operator).
    ///
    /// Refused while the conversation is locked or has queued messages, and
    /// at the global ceiling. The lock goes stale like any other.
    pub fn try_acquire(self: &Arc<Self>, conversation_id: &str, owner_label: &str) -> Option<LockTicket> {
        self.is_locked(conversation_id);
        let lock = self.table.lock().try_acquire(
            conversation_id,
            owner_label,
            self.config.max_concurrent_contacts,
        )?;
        tracing::info!(conversation_id, owner = owner_label, "Conversation lock acquired manually");
        self.events.emit(LifecycleEvent::LockAcquired {
            conversation_id: conversation_id.to_string(),
            process_id: lock.process_id,
            owner_label: lock.owner_label.clone(),
        });
        Some(lock.ticket())
    }

    /// Release a lock taken with `try_acquire`. False if that generation is
    /// no longer held.
    pub fn release(self: &Arc<Self>, ticket: &LockTicket) -> bool {
        self.release_generation(
            &ticket.conversation_id,
            Some(ticket.process_id),
            ReleaseReason::Manual,
        )
    }

    /// Release every stale lock (see `is_locked`). Returns the affected
    /// conversations, sorted.
    pub fn sweep_stale_locks(self: &Arc<Self>) -> Vec<String> {
        let stale = self
            .table
            .lock()
            .stale_locks(self.config.processing_timeout, self.stale_grace());
        let mut released: Vec<String> = stale
            .into_iter()
            .filter(|(id, process_id)| {
                self.release_generation(id, Some(*process_id), ReleaseReason::Stale)
            })
            .map(|(id, _)| id)
            .collect();
        released.sort();

        if !released.is_empty() {
            tracing::warn!(
                count = released.len(),
                conversations = ?released,
                "Resolved deadlocked conversations"
            );
            self.stats.record_deadlocks(released.len() as u64);
            self.events.emit(LifecycleEvent::DeadlocksResolved {
                count: released.len(),
                conversations: released.clone(),
            });
        }
        released
    }

    pub fn queue_len(&self, conversation_id: &str) -> usize {
        self.table.lock().queue_len(conversation_id)
    }

    pub fn active_count(&self) -> usize {
        self.table.lock().active_count()
    }

    /// Snapshot of held locks, sorted by conversation.
    pub fn locks(&self) -> Vec<ConversationLock> {
        let mut locks: Vec<ConversationLock> = self.table.lock().locks().cloned().collect();
        locks.sort_by(|a, b| a.conversation_id.cmp(&b.conversation_id));
        locks
    }

    pub fn stats(&self) -> OrchestratorStats {
        let (active, queue_sizes) = {
            let table = self.table.lock();
            let sizes: BTreeMap<String, usize> = table
                .queue_sizes()
                .map(|(id, len)| (id.clone(), len))
                .collect();
            (table.active_count(), sizes)
        };
        self.stats.snapshot(active, queue_sizes)
    }

    /// Drop all locks and queues and reset the counters.
    pub fn cleanup(&self) {
        let locks = self.table.lock().clear();
        for released in &locks {
            released.lock.cancel.cancel();
            if let Some(task) = &released.task {
                task.abort();
            }
        }
        self.stats.reset();
        tracing::info!(released = locks.len(), "Orchestrator state cleared");
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.events.subscribe()
    }

    /// Stop scheduling background work and wait for pending tasks.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        tracing::info!("Orchestrator stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub(crate) fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    fn stale_grace(&self) -> Duration {
        self.config.processing_timeout
    }

    fn fallback_reply(&self) -> Reply {
        Reply::fallback(self.config.fallback_reply.clone())
    }

    fn emit_error(&self, conversation_id: &str, message_id: Option<String>, error: &ProcessingError) {
        self.events.emit(LifecycleEvent::Error {
            conversation_id: conversation_id.to_string(),
            message_id,
            kind: error.kind().to_string(),
            error: error.to_string(),
        });
    }
}

/// Releases its lock generation when dropped.
///
/// Dropped without `complete` means the submitting future went away
/// mid-attempt: the release aborts the processing task and the attempt is
/// counted as an error.
struct LockLease {
    orchestrator: Arc<Orchestrator>,
    conversation_id: String,
    process_id: Uuid,
    started: Instant,
    reason: Option<ReleaseReason>,
}

impl LockLease {
    fn new(orchestrator: Arc<Orchestrator>, lock: &ConversationLock) -> Self {
        Self {
            orchestrator,
            conversation_id: lock.conversation_id.clone(),
            process_id: lock.process_id,
            started: Instant::now(),
            reason: None,
        }
    }

    fn complete(mut self, reason: ReleaseReason) {
        self.reason = Some(reason);
    }
}

impl Drop for LockLease {
    fn drop(&mut self) {
        let reason = match self.reason {
            Some(reason) => reason,
            None => {
                tracing::warn!(
                    conversation_id = %self.conversation_id,
                    "Processing abandoned by caller"
                );
                self.orchestrator
                    .stats
                    .record_failure(self.started.elapsed(), false);
                ReleaseReason::Abandoned
            }
        };
        self.orchestrator
            .release_generation(&self.conversation_id, Some(self.process_id), reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::error::ProcessorError;
    use crate::orchestrator::processor::processor_fn;

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            max_concurrent_contacts: 2,
            max_queue_size: 3,
            processing_timeout: Duration::from_millis(200),
            deadlock_check_interval: Duration::from_secs(1),
            queue_advance_delay: Duration::from_millis(5),
            ..OrchestratorConfig::default()
        }
    }

    fn echo() -> Arc<dyn MessageProcessor> {
        Arc::new(processor_fn(|message: InboundMessage, _ctx| async move {
            Ok(Reply::text(format!("echo: {}", message.content)))
        }))
    }

    #[tokio::test]
    async fn processes_and_releases() {
        let orch = Orchestrator::new(config());
        let outcome = orch.submit("c1", InboundMessage::new("c1", "hi"), echo()).await;

        match outcome {
            ProcessingOutcome::Processed { reply, .. } => assert_eq!(reply.payload, "echo: hi"),
            other => panic!("expected Processed, got {other:?}"),
        }
        assert!(!orch.is_locked("c1"));
        assert_eq!(orch.stats().total_processed, 1);
    }

    #[tokio::test]
    async fn blank_reply_becomes_fallback() {
        let orch = Orchestrator::new(config());
        let blank: Arc<dyn MessageProcessor> =
            Arc::new(processor_fn(|_m, _ctx| async { Ok(Reply::text("   ")) }));

        let outcome = orch.submit("c1", InboundMessage::new("c1", "hi"), blank).await;
        assert_eq!(outcome.status(), "processed");
        assert!(outcome.is_fallback());
        assert_eq!(outcome.reply().unwrap().payload, orch.config().fallback_reply);
    }

    #[tokio::test]
    async fn processor_error_yields_fallback() {
        let orch = Orchestrator::new(config());
        let failing: Arc<dyn MessageProcessor> = Arc::new(processor_fn(|_m, _ctx| async {
            Err(ProcessorError::Other("boom".into()))
        }));

        let outcome = orch.submit("c1", InboundMessage::new("c1", "hi"), failing).await;
        assert_eq!(outcome.error().unwrap().kind(), "failed");
        assert!(outcome.is_fallback());
        assert!(!orch.is_locked("c1"));
        assert_eq!(orch.stats().total_errors, 1);
    }

    #[tokio::test]
    async fn panicking_processor_is_contained() {
        let orch = Orchestrator::new(config());
        let panicking: Arc<dyn MessageProcessor> = Arc::new(processor_fn(|_m, _ctx| async {
            if true {
                panic!("processor bug");
            }
            Ok(Reply::text("unreachable"))
        }));

        let outcome = orch.submit("c1", InboundMessage::new("c1", "hi"), panicking).await;
        assert_eq!(outcome.error().unwrap().kind(), "panicked");
        assert!(!orch.is_locked("c1"));
    }

    #[tokio::test]
    async fn timeout_releases_and_cancels() {
        let orch = Orchestrator::new(config());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let tx = Arc::new(Mutex::new(Some(tx)));
        let slow: Arc<dyn MessageProcessor> = Arc::new(processor_fn(move |_m, ctx: ProcessingContext| {
            let tx = tx.clone();
            async move {
                if let Some(tx) = tx.lock().take() {
                    let _ = tx.send(ctx.clone());
                }
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(Reply::text("late"))
            }
        }));

        let outcome = orch.submit("c1", InboundMessage::new("c1", "hi"), slow).await;
        assert_eq!(outcome.error().unwrap().kind(), "timeout");
        let ctx = rx.await.unwrap();
        assert!(!ctx.is_current());

        let stats = orch.stats();
        assert_eq!(stats.total_timeouts, 1);
        assert_eq!(stats.total_errors, 1);
        assert_eq!(stats.active_locks, 0);
    }

    #[tokio::test]
    async fn manual_lock_round_trip() {
        let orch = Orchestrator::new(config());
        let ticket = orch.try_acquire("c1", "operator").unwrap();
        assert!(orch.is_locked("c1"));
        assert!(orch.try_acquire("c1", "operator").is_none());

        assert!(orch.release(&ticket));
        assert!(!orch.release(&ticket));
        assert!(!orch.is_locked("c1"));
    }

    #[tokio::test]
    async fn stale_manual_lock_released_lazily() {
        let orch = Orchestrator::new(config());
        orch.try_acquire("c1", "operator").unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        assert!(!orch.is_locked("c1"));
        assert_eq!(orch.stats().total_deadlocks, 1);
    }

    #[tokio::test]
    async fn force_release_counts() {
        let orch = Orchestrator::new(config());
        orch.try_acquire("c1", "operator").unwrap();
        orch.try_acquire("c2", "operator").unwrap();

        assert_eq!(orch.force_release(Some("c1")), 1);
        assert_eq!(orch.force_release(Some("c1")), 0);
        assert_eq!(orch.force_release(None), 1);
        assert_eq!(orch.active_count(), 0);
    }

    #[tokio::test]
    async fn ceiling_returns_overloaded() {
        let orch = Orchestrator::new(config());
        orch.try_acquire("a", "operator").unwrap();
        orch.try_acquire("b", "operator").unwrap();

        let outcome = orch.submit("c", InboundMessage::new("c", "hi"), echo()).await;
        assert_eq!(outcome.status(), "overloaded");
        assert!(outcome.is_fallback());
        assert!(!orch.is_locked("c"));
        assert_eq!(orch.stats().total_overloaded, 1);
    }

    #[tokio::test]
    async fn cleanup_resets_state() {
        let orch = Orchestrator::new(config());
        orch.try_acquire("c1", "operator").unwrap();
        orch.submit("c1", InboundMessage::new("c1", "queued"), echo()).await;
        assert_eq!(orch.queue_len("c1"), 1);

        orch.cleanup();
        assert_eq!(orch.active_count(), 0);
        assert_eq!(orch.queue_len("c1"), 0);
        assert_eq!(orch.stats().total_processed, 0);
    }
}
