//! Per-conversation serialization of message processing.
//!
//! - `manager`: the `Orchestrator`: submit, queue advancement, overrides
//! - `lock`: lock and queue table, mutated under one mutex
//! - `processor`: the processor trait and outcome types
//! - `events`: lifecycle events for subscribers
//! - `stats`: counters
//! - `sweeper`: periodic release of abandoned locks

mod lock;
pub mod events;
pub mod manager;
pub mod processor;
pub mod stats;
pub mod sweeper;

pub use events::{LifecycleEvent, ReleaseReason};
pub use lock::{ConversationLock, LockTicket, QueueEntry};
pub use manager::Orchestrator;
pub use processor::{
    FnProcessor, MessageProcessor, ProcessingContext, ProcessingOutcome, Reply, processor_fn,
};
pub use stats::OrchestratorStats;
pub use sweeper::spawn_sweeper;
