//! Conversation lock and queue table.
//!
//! Purely synchronous. Every check-then-act decision (is the conversation
//! locked? is there room? acquire) happens inside one `&mut self` call, so
//! callers holding the table mutex get it atomically.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::inbound::InboundMessage;
use crate::orchestrator::processor::MessageProcessor;

/// Marker that a conversation is being processed.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationLock {
    pub conversation_id: String,
    /// Fresh per acquisition; doubles as the lock generation.
    pub process_id: Uuid,
    pub owner_label: String,
    pub acquired_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) started: Instant,
    /// Fired when this generation is released for any reason.
    #[serde(skip)]
    pub(crate) cancel: CancellationToken,
}

impl ConversationLock {
    fn new(conversation_id: &str, owner_label: &str) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            process_id: Uuid::new_v4(),
            owner_label: owner_label.to_string(),
            acquired_at: Utc::now(),
            started: Instant::now(),
            cancel: CancellationToken::new(),
        }
    }

    /// How long the lock has been held.
    pub fn age(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn ticket(&self) -> LockTicket {
        LockTicket {
            conversation_id: self.conversation_id.clone(),
            process_id: self.process_id,
        }
    }
}

/// Proof of a manual acquisition, required to release it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LockTicket {
    pub conversation_id: String,
    pub process_id: Uuid,
}

/// A message waiting for its conversation to become free.
#[derive(Clone)]
pub struct QueueEntry {
    pub message: InboundMessage,
    pub processor: Arc<dyn MessageProcessor>,
    pub enqueued_at: Instant,
    /// Times this entry was put back because the concurrency ceiling was hit.
    pub attempts: u32,
}

impl QueueEntry {
    pub fn new(message: InboundMessage, processor: Arc<dyn MessageProcessor>) -> Self {
        Self {
            message,
            processor,
            enqueued_at: Instant::now(),
            attempts: 0,
        }
    }
}

impl std::fmt::Debug for QueueEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueEntry")
            .field("message_id", &self.message.id)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Decision taken for a new submission.
#[derive(Debug)]
pub(crate) enum Admit {
    Acquired {
        lock: ConversationLock,
        entry: QueueEntry,
    },
    Queued {
        position: usize,
        evicted: Option<QueueEntry>,
        /// The caller must spawn an advancement task.
        schedule: bool,
    },
    Overloaded {
        active: usize,
        entry: QueueEntry,
    },
}

/// Next step for a queue-advancement task.
#[derive(Debug)]
pub(crate) enum AdvanceStep {
    /// Nothing queued.
    Idle,
    /// Conversation is locked; its release will schedule the next advance.
    Busy,
    /// Ceiling reached, head put back. Try again later.
    Retry { attempts: u32 },
    /// Head gave up after too many attempts. `more` when entries remain.
    Exhausted { entry: QueueEntry, more: bool },
    /// Lock acquired for the head entry.
    Start {
        lock: ConversationLock,
        entry: QueueEntry,
    },
}

/// A lock taken out of the table.
#[derive(Debug)]
pub(crate) struct Released {
    pub(crate) lock: ConversationLock,
    /// Processing task still attached to the generation, if any.
    pub(crate) task: Option<AbortHandle>,
    /// The caller must spawn an advancement task.
    pub(crate) schedule: bool,
}

/// Result of a staleness check on one conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HolderState {
    Free,
    Held,
    Stale(Uuid),
}

/// Lock map, queue map and pending advancements.
#[derive(Default)]
pub(crate) struct ConversationTable {
    locks: HashMap<String, ConversationLock>,
    queues: HashMap<String, VecDeque<QueueEntry>>,
    advancing: HashSet<String>,
    /// Processing tasks running under a lock generation.
    tasks: HashMap<Uuid, AbortHandle>,
}

impl ConversationTable {
    /// Route a new submission: queue it, reject it, or lock for it.
    ///
    /// A message is queued when the conversation is locked, and also when a
    /// queue already exists, so it never overtakes earlier arrivals.
    pub(crate) fn admit(
        &mut self,
        conversation_id: &str,
        entry: QueueEntry,
        max_active: usize,
        max_queue: usize,
        owner_label: &str,
    ) -> Admit {
        let locked = self.locks.contains_key(conversation_id);
        if locked || self.queue_len(conversation_id) > 0 {
            let (position, evicted) = self.enqueue(conversation_id, entry, max_queue);
            let schedule = !locked && self.advancing.insert(conversation_id.to_string());
            return Admit::Queued {
                position,
                evicted,
                schedule,
            };
        }

        if self.locks.len() >= max_active {
            return Admit::Overloaded {
                active: self.locks.len(),
                entry,
            };
        }

        Admit::Acquired {
            lock: self.acquire(conversation_id, owner_label),
            entry,
        }
    }

    /// Manual acquisition. Refused while locked, queued, or at capacity.
    pub(crate) fn try_acquire(
        &mut self,
        conversation_id: &str,
        owner_label: &str,
        max_active: usize,
    ) -> Option<ConversationLock> {
        if self.locks.contains_key(conversation_id)
            || self.queue_len(conversation_id) > 0
            || self.advancing.contains(conversation_id)
            || self.locks.len() >= max_active
        {
            return None;
        }
        Some(self.acquire(conversation_id, owner_label))
    }

    fn acquire(&mut self, conversation_id: &str, owner_label: &str) -> ConversationLock {
        let lock = ConversationLock::new(conversation_id, owner_label);
        self.locks.insert(conversation_id.to_string(), lock.clone());
        lock
    }

    /// Append to the conversation queue, evicting the oldest entry when full.
    /// Returns the 1-based position of the new entry.
    fn enqueue(
        &mut self,
        conversation_id: &str,
        entry: QueueEntry,
        max_queue: usize,
    ) -> (usize, Option<QueueEntry>) {
        let queue = self.queues.entry(conversation_id.to_string()).or_default();
        let evicted = if queue.len() >= max_queue.max(1) {
            queue.pop_front()
        } else {
            None
        };
        queue.push_back(entry);
        (queue.len(), evicted)
    }

    /// Record the processing task running under `process_id`. Ignored if
    /// that generation is no longer held.
    pub(crate) fn attach_task(
        &mut self,
        conversation_id: &str,
        process_id: Uuid,
        task: AbortHandle,
    ) -> bool {
        let held = self
            .locks
            .get(conversation_id)
            .is_some_and(|lock| lock.process_id == process_id);
        if held {
            self.tasks.insert(process_id, task);
        }
        held
    }

    /// Release the lock on `conversation_id`.
    ///
    /// With `process_id`, only that generation is released; a newer holder is
    /// left alone.
    pub(crate) fn release(
        &mut self,
        conversation_id: &str,
        process_id: Option<Uuid>,
    ) -> Option<Released> {
        let current = self.locks.get(conversation_id)?;
        if process_id.is_some_and(|id| id != current.process_id) {
            return None;
        }
        let lock = self.locks.remove(conversation_id)?;
        Some(self.released(lock))
    }

    /// Release every lock.
    pub(crate) fn release_all(&mut self) -> Vec<Released> {
        let locks: Vec<ConversationLock> = self.locks.drain().map(|(_, lock)| lock).collect();
        locks.into_iter().map(|lock| self.released(lock)).collect()
    }

    fn released(&mut self, lock: ConversationLock) -> Released {
        let task = self.tasks.remove(&lock.process_id);
        let schedule = self.mark_advancing(&lock.conversation_id);
        Released {
            lock,
            task,
            schedule,
        }
    }

    /// A lock is stale once older than `timeout`. Locks with an attached
    /// processing task end themselves at `timeout`, so they only count as
    /// stale after an extra `grace`.
    fn is_stale(&self, lock: &ConversationLock, timeout: Duration, grace: Duration) -> bool {
        let limit = if self.tasks.contains_key(&lock.process_id) {
            timeout + grace
        } else {
            timeout
        };
        lock.age() > limit
    }

    pub(crate) fn holder_state(
        &self,
        conversation_id: &str,
        timeout: Duration,
        grace: Duration,
    ) -> HolderState {
        match self.locks.get(conversation_id) {
            None => HolderState::Free,
            Some(lock) if self.is_stale(lock, timeout, grace) => HolderState::Stale(lock.process_id),
            Some(_) => HolderState::Held,
        }
    }

    /// Stale locks, see `holder_state`.
    pub(crate) fn stale_locks(&self, timeout: Duration, grace: Duration) -> Vec<(String, Uuid)> {
        self.locks
            .values()
            .filter(|lock| self.is_stale(lock, timeout, grace))
            .map(|lock| (lock.conversation_id.clone(), lock.process_id))
            .collect()
    }

    /// Take the queue head for processing, if the conversation is free.
    pub(crate) fn advance(
        &mut self,
        conversation_id: &str,
        max_active: usize,
        max_attempts: u32,
    ) -> AdvanceStep {
        self.advancing.remove(conversation_id);

        if self.locks.contains_key(conversation_id) {
            return AdvanceStep::Busy;
        }

        let Some(mut entry) = self.pop_head(conversation_id) else {
            return AdvanceStep::Idle;
        };

        if self.locks.len() >= max_active {
            entry.attempts += 1;
            if entry.attempts >= max_attempts.max(1) {
                let more = self.queue_len(conversation_id) > 0;
                if more {
                    self.advancing.insert(conversation_id.to_string());
                }
                return AdvanceStep::Exhausted { entry, more };
            }
            let attempts = entry.attempts;
            self.queues
                .entry(conversation_id.to_string())
                .or_default()
                .push_front(entry);
            self.advancing.insert(conversation_id.to_string());
            return AdvanceStep::Retry { attempts };
        }

        let lock = self.acquire(conversation_id, "queue");
        AdvanceStep::Start { lock, entry }
    }

    fn pop_head(&mut self, conversation_id: &str) -> Option<QueueEntry> {
        let queue = self.queues.get_mut(conversation_id)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            self.queues.remove(conversation_id);
        }
        entry
    }

    /// Flag an advancement as pending. True when the caller should spawn it.
    fn mark_advancing(&mut self, conversation_id: &str) -> bool {
        self.queue_len(conversation_id) > 0 && self.advancing.insert(conversation_id.to_string())
    }

    /// Clear the pending flag for a conversation whose advancement was never
    /// spawned (shutdown).
    pub(crate) fn unmark_advancing(&mut self, conversation_id: &str) {
        self.advancing.remove(conversation_id);
    }

    pub(crate) fn holder(&self, conversation_id: &str) -> Option<&ConversationLock> {
        self.locks.get(conversation_id)
    }

    pub(crate) fn locks(&self) -> impl Iterator<Item = &ConversationLock> {
        self.locks.values()
    }

    pub(crate) fn active_count(&self) -> usize {
        self.locks.len()
    }

    pub(crate) fn queue_len(&self, conversation_id: &str) -> usize {
        self.queues.get(conversation_id).map_or(0, VecDeque::len)
    }

    pub(crate) fn queue_sizes(&self) -> impl Iterator<Item = (&String, usize)> {
        self.queues.iter().map(|(id, queue)| (id, queue.len()))
    }

    /// Drop everything. Returns the locks that were held, with their tasks.
    pub(crate) fn clear(&mut self) -> Vec<Released> {
        self.queues.clear();
        self.advancing.clear();
        let locks: Vec<ConversationLock> = self.locks.drain().map(|(_, lock)| lock).collect();
        locks
            .into_iter()
            .map(|lock| Released {
                task: self.tasks.remove(&lock.process_id),
                lock,
                schedule: false,
            })
            .collect()
    }
}
