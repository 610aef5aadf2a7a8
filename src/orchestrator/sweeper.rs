//! Background deadlock sweeper.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::time::MissedTickBehavior;

use crate::orchestrator::manager::Orchestrator;

/// Spawn the sweeper on the orchestrator's task tracker.
///
/// Every `deadlock_check_interval` it releases locks held past the
/// processing timeout. Stops on orchestrator shutdown, or once the
/// orchestrator itself is dropped.
pub fn spawn_sweeper(orchestrator: &Arc<Orchestrator>) -> tokio::task::JoinHandle<()> {
    let period = orchestrator.config().deadlock_check_interval;
    spawn_sweeper_every(orchestrator, period)
}

pub(crate) fn spawn_sweeper_every(
    orchestrator: &Arc<Orchestrator>,
    period: Duration,
) -> tokio::task::JoinHandle<()> {
    let weak: Weak<Orchestrator> = Arc::downgrade(orchestrator);
    let shutdown = orchestrator.shutdown_token();

    orchestrator.tracker().spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // First tick fires immediately; nothing can be stale yet.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let Some(orchestrator) = weak.upgrade() else {
                        break;
                    };
                    let released = orchestrator.sweep_stale_locks();
                    tracing::debug!(released = released.len(), "Deadlock sweep complete");
                }
            }
        }
        tracing::debug!("Deadlock sweeper stopped");
    })
}
