//! Convo Guard: inbound-event concurrency and resilience core.
//!
//! Deduplicates inbound events, serializes processing per conversation, and
//! circuit-breaks calls to unreliable downstream dependencies.

pub mod config;
pub mod error;
pub mod inbound;
pub mod orchestrator;
pub mod resilience;
pub mod runtime;

pub use config::CoreConfig;
pub use error::{Error, Result};
pub use runtime::{InboundOutcome, InboundRuntime};
