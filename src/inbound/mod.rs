//! Inbound event intake: raw event shape and deduplication.

pub mod dedup;
pub mod event;

pub use dedup::{Admission, DedupStats, EventDeduplicator, ProcessedEventRecord, RejectReason};
pub use event::{InboundMessage, RawInboundEvent};
