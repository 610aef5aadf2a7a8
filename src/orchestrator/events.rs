//! Lifecycle events, fanned out over a broadcast channel.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::orchestrator::processor::Reply;

/// Default broadcast channel capacity.
const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Why a lock was released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Completed,
    Failed,
    TimedOut,
    /// Held past the processing timeout; released by the staleness check
    /// or the sweeper.
    Stale,
    /// `force_release`.
    Forced,
    /// Manual `release` of a ticket.
    Manual,
    /// The submitting future was dropped mid-processing.
    Abandoned,
}

/// Observable lifecycle of messages and locks.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    Received {
        conversation_id: String,
        message_id: String,
    },
    LockAcquired {
        conversation_id: String,
        process_id: Uuid,
        owner_label: String,
    },
    LockReleased {
        conversation_id: String,
        process_id: Uuid,
        reason: ReleaseReason,
        held_ms: u64,
    },
    Queued {
        conversation_id: String,
        message_id: String,
        position: usize,
        evicted_message_id: Option<String>,
    },
    /// Emitted for every completed attempt, including fallbacks, so hosts can
    /// deliver replies for messages that were queued.
    Processed {
        conversation_id: String,
        message_id: String,
        reply: Reply,
        duration_ms: u64,
    },
    Error {
        conversation_id: String,
        message_id: Option<String>,
        kind: String,
        error: String,
    },
    DeadlocksResolved {
        count: usize,
        conversations: Vec<String>,
    },
}

impl LifecycleEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Received { .. } => "received",
            Self::LockAcquired { .. } => "lock_acquired",
            Self::LockReleased { .. } => "lock_released",
            Self::Queued { .. } => "queued",
            Self::Processed { .. } => "processed",
            Self::Error { .. } => "error",
            Self::DeadlocksResolved { .. } => "deadlocks_resolved",
        }
    }
}

/// In-process publisher. Sending never blocks and never fails the caller.
pub(crate) struct EventBus {
    tx: broadcast::Sender<LifecycleEvent>,
}

impl EventBus {
    pub(crate) fn new() -> Self {
        let (tx, _rx) = broadcast::channel(DEFAULT_EVENT_CAPACITY);
        Self { tx }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<LifecycleEvent> {
        self.tx.subscribe()
    }

    pub(crate) fn emit(&self, event: LifecycleEvent) {
        // Ok if nobody is listening
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_receive_events() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.emit(LifecycleEvent::DeadlocksResolved {
            count: 1,
            conversations: vec!["c1".into()],
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.name(), "deadlocks_resolved");
    }

    #[test]
    fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(LifecycleEvent::Received {
            conversation_id: "c1".into(),
            message_id: "m1".into(),
        });
    }

    #[test]
    fn serializes_with_event_tag() {
        let event = LifecycleEvent::LockReleased {
            conversation_id: "c1".into(),
            process_id: Uuid::nil(),
            reason: ReleaseReason::TimedOut,
            held_ms: 5,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "lock_released");
        assert_eq!(json["reason"], "timed_out");
    }
}
