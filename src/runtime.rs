//! Explicit runtime context: owns the deduplicator, the orchestrator and the
//! breaker registry, and the background tasks that serve them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::config::CoreConfig;
use crate::Result;
use crate::inbound::{Admission, EventDeduplicator, RawInboundEvent, RejectReason};
use crate::orchestrator::{MessageProcessor, Orchestrator, ProcessingOutcome, spawn_sweeper};
use crate::resilience::CircuitBreakerRegistry;

/// What happened to one raw inbound event.
#[derive(Debug, Clone)]
pub enum InboundOutcome {
    /// Dropped by the deduplicator.
    Rejected { reason: RejectReason },
    /// No chat id and no sender, so no conversation to route to.
    Unroutable,
    Submitted {
        event_key: String,
        outcome: ProcessingOutcome,
    },
}

impl InboundOutcome {
    pub fn processing(&self) -> Option<&ProcessingOutcome> {
        match self {
            Self::Submitted { outcome, .. } => Some(outcome),
            _ => None,
        }
    }
}

pub struct InboundRuntime {
    config: CoreConfig,
    dedup: Arc<EventDeduplicator>,
    orchestrator: Arc<Orchestrator>,
    breakers: Arc<CircuitBreakerRegistry>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    started: AtomicBool,
}

impl InboundRuntime {
    /// Build the components. Background tasks start with `init`.
    pub fn new(config: CoreConfig) -> Result<Self> {
        config.orchestrator.validate()?;

        Ok(Self {
            dedup: Arc::new(EventDeduplicator::new(config.dedup.clone())),
            orchestrator: Orchestrator::new(config.orchestrator.clone()),
            breakers: Arc::new(CircuitBreakerRegistry::new(config.breaker.clone())),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            started: AtomicBool::new(false),
            config,
        })
    }

    /// Start the deadlock sweeper and the dedup cleanup task. Idempotent.
    pub fn init(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        spawn_sweeper(&self.orchestrator);
        self.spawn_dedup_cleanup();

        tracing::info!(
            max_concurrent = self.config.orchestrator.max_concurrent_contacts,
            max_queue = self.config.orchestrator.max_queue_size,
            timeout_ms = self.config.orchestrator.processing_timeout.as_millis() as u64,
            "Inbound runtime started"
        );
    }

    fn spawn_dedup_cleanup(&self) {
        let dedup = Arc::clone(&self.dedup);
        let shutdown = self.shutdown.clone();
        let period = self.config.dedup.cleanup_interval;

        self.tasks.spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        let purged = dedup.purge_expired();
                        if purged > 0 {
                            tracing::debug!(purged, "Purged expired dedup records");
                        }
                    }
                }
            }
        });
    }

    /// Deduplicate `event`, route it to its conversation and submit it.
    pub async fn handle_event(
        &self,
        event: RawInboundEvent,
        processor: Arc<dyn MessageProcessor>,
    ) -> InboundOutcome {
        let Some(conversation_id) = event.conversation_id() else {
            tracing::warn!(channel = %event.channel, "Dropping event with no chat id or sender");
            return InboundOutcome::Unroutable;
        };

        let event_key = match self.dedup.admit(&event) {
            Admission::Admitted { event_key } => event_key,
            Admission::Rejected { reason } => return InboundOutcome::Rejected { reason },
        };

        let message = event.into_message(event_key.clone(), conversation_id.clone());
        let outcome = self
            .orchestrator
            .submit(&conversation_id, message, processor)
            .await;

        InboundOutcome::Submitted { event_key, outcome }
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn dedup(&self) -> &Arc<EventDeduplicator> {
        &self.dedup
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn breakers(&self) -> &Arc<CircuitBreakerRegistry> {
        &self.breakers
    }

    /// Stop background tasks and wait for them, including pending queue
    /// advancements. In-flight processing is not interrupted.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        self.orchestrator.shutdown().await;
        tracing::info!("Inbound runtime stopped");
    }
}
