//! Processor contract: what the orchestrator calls, and what it returns.

use std::future::Future;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{ProcessingError, ProcessorError};
use crate::inbound::InboundMessage;

/// User-presentable result of processing one message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reply {
    pub payload: String,
    /// True when `payload` is the fixed fallback text.
    #[serde(default)]
    pub fallback: bool,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

impl Reply {
    pub fn text(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            fallback: false,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn fallback(payload: impl Into<String>) -> Self {
        Self {
            fallback: true,
            ..Self::text(payload)
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    /// A reply is deliverable when its payload has visible content.
    pub fn is_deliverable(&self) -> bool {
        !self.payload.trim().is_empty()
    }
}

/// Handed to the processor alongside the message.
#[derive(Debug, Clone)]
pub struct ProcessingContext {
    pub conversation_id: String,
    /// Generation of the lock this attempt runs under.
    pub process_id: Uuid,
    /// 1 for a direct submission; higher when a queued message was retried.
    pub attempt: u32,
    pub deadline: Instant,
    cancel: CancellationToken,
}

impl ProcessingContext {
    pub(crate) fn new(
        conversation_id: String,
        process_id: Uuid,
        attempt: u32,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            conversation_id,
            process_id,
            attempt,
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    /// Whether this attempt still owns the conversation.
    ///
    /// Turns false once the lock is released for any reason (timeout, sweep,
    /// forced release). Check it before side effects such as sending.
    pub fn is_current(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Time left before the processing budget runs out.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Resolves when the attempt loses its lock.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// `Err(Cancelled)` when the attempt no longer owns the conversation.
    pub fn ensure_current(&self) -> Result<(), ProcessorError> {
        if self.is_current() {
            Ok(())
        } else {
            Err(ProcessorError::Cancelled)
        }
    }
}

/// Produces a reply for one message. Supplied per submission.
#[async_trait]
pub trait MessageProcessor: Send + Sync {
    async fn process(
        &self,
        message: InboundMessage,
        ctx: ProcessingContext,
    ) -> Result<Reply, ProcessorError>;
}

/// Adapter so plain async closures can be used as processors.
pub struct FnProcessor<F>(F);

/// Wrap an async closure as a `MessageProcessor`.
pub fn processor_fn<F, Fut>(f: F) -> FnProcessor<F>
where
    F: Fn(InboundMessage, ProcessingContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply, ProcessorError>> + Send + 'static,
{
    FnProcessor(f)
}

#[async_trait]
impl<F, Fut> MessageProcessor for FnProcessor<F>
where
    F: Fn(InboundMessage, ProcessingContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Reply, ProcessorError>> + Send + 'static,
{
    async fn process(
        &self,
        message: InboundMessage,
        ctx: ProcessingContext,
    ) -> Result<Reply, ProcessorError> {
        (self.0)(message, ctx).await
    }
}

/// What `Orchestrator::submit` returns.
#[derive(Debug, Clone)]
pub enum ProcessingOutcome {
    /// Processed now. `reply.fallback` is set if the processor's reply was
    /// empty and got replaced.
    Processed { reply: Reply, duration: Duration },
    /// Conversation busy; the message waits at `position` (1-based).
    Queued { position: usize },
    /// Global ceiling reached; nothing was locked.
    Overloaded { reply: Reply },
    /// Processing failed or timed out; `reply` is the fallback.
    Failed { reply: Reply, error: ProcessingError },
}

impl ProcessingOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            Self::Processed { .. } => "processed",
            Self::Queued { .. } => "queued",
            Self::Overloaded { .. } => "overloaded",
            Self::Failed { .. } => "error",
        }
    }

    /// Reply to deliver, if any. Queued outcomes have none yet.
    pub fn reply(&self) -> Option<&Reply> {
        match self {
            Self::Processed { reply, .. }
            | Self::Overloaded { reply }
            | Self::Failed { reply, .. } => Some(reply),
            Self::Queued { .. } => None,
        }
    }

    pub fn is_fallback(&self) -> bool {
        self.reply().is_some_and(|r| r.fallback)
    }

    pub fn error(&self) -> Option<&ProcessingError> {
        match self {
            Self::Failed { error, .. } => Some(error),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_reply_not_deliverable() {
        assert!(!Reply::text("  \n").is_deliverable());
        assert!(Reply::text("hi").is_deliverable());
        assert!(Reply::fallback("sorry").fallback);
    }

    #[test]
    fn reply_deserializes_without_flags() {
        let reply: Reply = serde_json::from_str(r#"{"payload":"hello"}"#).unwrap();
        assert!(!reply.fallback);
        assert_eq!(reply.metadata, serde_json::Value::Null);
    }

    #[test]
    fn context_tracks_cancellation() {
        let token = CancellationToken::new();
        let ctx = ProcessingContext::new(
            "c1".into(),
            Uuid::new_v4(),
            1,
            Duration::from_secs(5),
            token.clone(),
        );
        assert!(ctx.is_current());
        assert!(ctx.remaining() > Duration::from_secs(4));
        token.cancel();
        assert!(!ctx.is_current());
        assert!(matches!(ctx.ensure_current(), Err(ProcessorError::Cancelled)));
    }

    #[test]
    fn metadata_travels_with_reply() {
        let reply = Reply::text("hi").with_metadata(serde_json::json!({"model": "small"}));
        let json = serde_json::to_value(&reply).unwrap();
        assert_eq!(json["metadata"]["model"], "small");
        assert!(!json["fallback"].as_bool().unwrap());
    }

    #[tokio::test]
    async fn cancelled_resolves_on_release() {
        let token = CancellationToken::new();
        let ctx = ProcessingContext::new(
            "c1".into(),
            Uuid::new_v4(),
            1,
            Duration::from_secs(5),
            token.clone(),
        );
        let waiter = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.cancelled().await }
        });

        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancelled() should resolve")
            .unwrap();
    }

    #[test]
    fn outcome_status_strings() {
        let queued = ProcessingOutcome::Queued { position: 2 };
        assert_eq!(queued.status(), "queued");
        assert!(queued.reply().is_none());

        let failed = ProcessingOutcome::Failed {
            reply: Reply::fallback("sorry"),
            error: ProcessingError::Failed {
                conversation_id: "c1".into(),
                reason: "boom".into(),
            },
        };
        assert_eq!(failed.status(), "error");
        assert!(failed.is_fallback());
        assert_eq!(failed.error().unwrap().kind(), "failed");
    }
}
