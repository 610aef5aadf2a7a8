use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};

use convo_guard::config::CoreConfig;
use convo_guard::error::ProcessorError;
use convo_guard::inbound::{InboundMessage, RawInboundEvent};
use convo_guard::orchestrator::{
    LifecycleEvent, MessageProcessor, ProcessingContext, Reply, processor_fn,
};
use convo_guard::resilience::CircuitBreaker;
use convo_guard::resilience::registry::REASONING_PROVIDER;
use convo_guard::runtime::{InboundOutcome, InboundRuntime};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = CoreConfig::from_env()?;
    let runtime = Arc::new(InboundRuntime::new(config)?);
    runtime.init();

    eprintln!("🛡  Convo Guard v{}", env!("CARGO_PKG_VERSION"));
    eprintln!(
        "   Max concurrent: {}, queue size: {}, timeout: {:?}",
        runtime.config().orchestrator.max_concurrent_contacts,
        runtime.config().orchestrator.max_queue_size,
        runtime.config().orchestrator.processing_timeout,
    );
    eprintln!("   Type `<sender>: <message>` and press Enter. Ctrl-C to exit.");
    eprintln!("   `/slow` sleeps past the timeout, `/fail` fails the reasoning call.\n");

    // Replies for queued messages arrive as lifecycle events
    let mut events = runtime.orchestrator().subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                LifecycleEvent::Processed {
                    conversation_id,
                    reply,
                    duration_ms,
                    ..
                } => {
                    println!("[{}] {} ({} ms)", conversation_id, reply.payload, duration_ms);
                }
                LifecycleEvent::DeadlocksResolved { conversations, .. } => {
                    eprintln!("   released stale locks: {}", conversations.join(", "));
                }
                other => tracing::debug!(event = other.name(), "Lifecycle event"),
            }
        }
    });

    let processor = demo_processor(&runtime);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                let Some(event) = parse_line(&line) else {
                    continue;
                };
                let runtime = Arc::clone(&runtime);
                let processor = Arc::clone(&processor);
                tokio::spawn(async move {
                    match runtime.handle_event(event, processor).await {
                        InboundOutcome::Rejected { reason } => eprintln!("   rejected: {}", reason),
                        InboundOutcome::Unroutable => eprintln!("   unroutable"),
                        InboundOutcome::Submitted { outcome, .. } => {
                            tracing::debug!(status = outcome.status(), "Submitted");
                        }
                    }
                });
            }
        }
    }

    runtime.shutdown().await;
    Ok(())
}

/// `alice: hello` → event from `alice`.
fn parse_line(line: &str) -> Option<RawInboundEvent> {
    let (sender, body) = line.split_once(':')?;
    let sender = sender.trim();
    if sender.is_empty() {
        return None;
    }
    Some(RawInboundEvent {
        channel: "cli".to_string(),
        sender: Some(sender.to_string()),
        timestamp: Some(chrono::Utc::now().timestamp()),
        body: Some(body.trim().to_string()),
        ..Default::default()
    })
}

/// Echo processor that goes through the reasoning-provider breaker.
fn demo_processor(runtime: &InboundRuntime) -> Arc<dyn MessageProcessor> {
    let breaker = runtime.breakers().get(REASONING_PROVIDER, None);
    Arc::new(processor_fn(move |message: InboundMessage, ctx: ProcessingContext| {
        answer(Arc::clone(&breaker), message, ctx)
    }))
}

async fn answer(
    breaker: Arc<CircuitBreaker>,
    message: InboundMessage,
    ctx: ProcessingContext,
) -> Result<Reply, ProcessorError> {
    let reply = tokio::select! {
        _ = ctx.cancelled() => return Err(ProcessorError::Cancelled),
        reply = breaker.execute(|| compose_reply(message)) => reply?,
    };
    // Don't answer for a conversation we no longer own
    ctx.ensure_current()?;
    Ok(reply.with_metadata(serde_json::json!({
        "breaker": breaker.name(),
        "attempt": ctx.attempt,
    })))
}

async fn compose_reply(message: InboundMessage) -> Result<Reply, ProcessorError> {
    match message.content.as_str() {
        "/slow" => {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Reply::text("finally"))
        }
        "/fail" => Err(ProcessorError::Dependency {
            name: REASONING_PROVIDER.to_string(),
            reason: "simulated outage".to_string(),
        }),
        text => {
            tokio::time::sleep(Duration::from_millis(250)).await;
            Ok(Reply::text(format!("{} said: {}", message.sender, text)))
        }
    }
}
