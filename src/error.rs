//! Error types for convo-guard.

use std::time::Duration;

/// Top-level error type for the crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Processing error: {0}")]
    Processing(#[from] ProcessingError),

    #[error("Processor error: {0}")]
    Processor(#[from] ProcessorError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Terminal failures of a processing attempt.
///
/// These never escape `Orchestrator::submit`; they are folded into a
/// fallback outcome so the caller always has something to deliver.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessingError {
    #[error("Maximum concurrent conversations ({max}) reached, {active} active")]
    Overloaded { active: usize, max: usize },

    #[error("Processing of conversation {conversation_id} timed out after {timeout:?}")]
    Timeout {
        conversation_id: String,
        timeout: Duration,
    },

    #[error("Processing of conversation {conversation_id} failed: {reason}")]
    Failed {
        conversation_id: String,
        reason: String,
    },

    #[error("Processor for conversation {conversation_id} panicked")]
    Panicked { conversation_id: String },

    #[error("Invalid reply for conversation {conversation_id}: {reason}")]
    InvalidReply {
        conversation_id: String,
        reason: String,
    },

    #[error("Queued message for conversation {conversation_id} dropped after {attempts} attempts")]
    QueueAttemptsExhausted {
        conversation_id: String,
        attempts: u32,
    },
}

impl ProcessingError {
    /// Short machine-readable kind, used in lifecycle events and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Overloaded { .. } => "overloaded",
            Self::Timeout { .. } => "timeout",
            Self::Failed { .. } => "failed",
            Self::Panicked { .. } => "panicked",
            Self::InvalidReply { .. } => "invalid_reply",
            Self::QueueAttemptsExhausted { .. } => "queue_attempts_exhausted",
        }
    }
}

/// Error returned by a `MessageProcessor` implementation.
#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("Dependency {name} unavailable: {reason}")]
    Dependency { name: String, reason: String },

    #[error("Processing cancelled")]
    Cancelled,

    #[error("{0}")]
    Other(String),
}

impl<E: std::fmt::Display> From<CircuitError<E>> for ProcessorError {
    fn from(err: CircuitError<E>) -> Self {
        match &err {
            CircuitError::Open { name, .. } | CircuitError::Timeout { name, .. } => {
                Self::Dependency {
                    name: name.clone(),
                    reason: err.to_string(),
                }
            }
            CircuitError::Failed(inner) => Self::Other(inner.to_string()),
        }
    }
}

/// Errors surfaced by `CircuitBreaker::execute`.
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    #[error("Circuit {name} is open, retry after {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    #[error("Call through circuit {name} timed out after {timeout:?}")]
    Timeout { name: String, timeout: Duration },

    #[error("{0}")]
    Failed(E),
}

impl<E> CircuitError<E> {
    /// Whether the call was rejected without invoking the wrapped function.
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open { .. })
    }
}

/// Result type alias for the crate.
pub type Result<T> = std::result::Result<T, Error>;
