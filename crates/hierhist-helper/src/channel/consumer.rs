//! Pull loop connecting a request channel to the orchestrator

use std::time::Duration;

use tokio::sync::watch;

use super::{Delivery, RequestChannel};
use crate::aggregator::{Aggregator, StepOutcome};
use crate::error::{Result, StepError};
use crate::metrics;

/// Counters for one run of [`consume`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeStats {
    pub received: u64,
    pub completed: u64,
    pub requeued: u64,
    pub failed: u64,
    pub cancelled: u64,
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender also means shut down
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Pause after a failed receive before asking the channel again
const RECEIVE_RETRY_DELAY: Duration = Duration::from_millis(500);

async fn release(channel: &dyn RequestChannel, delivery: &Delivery) {
    if let Err(e) = channel.nack(delivery).await {
        tracing::error!(message = %delivery.id, error = %e, "Failed to release message");
    }
}

async fn reject(channel: &dyn RequestChannel, delivery: &Delivery) {
    if let Err(e) = channel.reject(delivery).await {
        tracing::error!(message = %delivery.id, error = %e, "Failed to reject message");
    }
}

/// Process deliveries one at a time until the channel closes or `shutdown`
/// turns true.
///
/// Success is acknowledged. Every failure is logged; retriable failures are
/// negatively acknowledged so the channel's retry policy decides what
/// happens next, the rest are rejected. A failed receive is logged and
/// retried. A shutdown during a step drops the step (stopping its worker)
/// and releases its message.
pub async fn consume(
    channel: &dyn RequestChannel,
    aggregator: &Aggregator,
    mut shutdown: watch::Receiver<bool>,
) -> Result<ConsumeStats> {
    let mut stats = ConsumeStats::default();

    loop {
        if *shutdown.borrow() {
            break;
        }

        let received = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => break,
            received = channel.receive() => received,
        };
        let delivery = match received {
            Ok(Some(delivery)) => delivery,
            Ok(None) => break,
            Err(e) => {
                tracing::error!(error = %e, "Failed to receive from channel");
                tokio::select! {
                    _ = shutdown_requested(&mut shutdown) => break,
                    _ = tokio::time::sleep(RECEIVE_RETRY_DELAY) => continue,
                }
            }
        };
        stats.received += 1;

        let step = match delivery.step() {
            Ok(step) => step,
            Err(e) => {
                stats.failed += 1;
                tracing::error!(
                    message = %delivery.id,
                    attempt = delivery.attempt,
                    error = %e,
                    "Rejecting undecodable message"
                );
                reject(channel, &delivery).await;
                continue;
            }
        };

        let outcome = tokio::select! {
            _ = shutdown_requested(&mut shutdown) => Err(StepError::Cancelled),
            outcome = aggregator.handle(&step) => outcome,
        };

        match outcome {
            Ok(outcome) => {
                match outcome {
                    StepOutcome::Completed => stats.completed += 1,
                    StepOutcome::Requeued => stats.requeued += 1,
                }
                if let Err(e) = channel.ack(&delivery).await {
                    tracing::error!(message = %delivery.id, error = %e, "Failed to acknowledge message");
                }
            }
            Err(StepError::Cancelled) => {
                stats.cancelled += 1;
                metrics::record_step(metrics::OUTCOME_CANCELLED, std::time::Duration::ZERO);
                tracing::warn!(
                    query_id = %step.query_id,
                    level = step.level,
                    "Step cancelled by shutdown"
                );
                release(channel, &delivery).await;
                break;
            }
            Err(e) => {
                stats.failed += 1;
                tracing::error!(
                    query_id = %step.query_id,
                    level = step.level,
                    message = %delivery.id,
                    attempt = delivery.attempt,
                    retriable = e.is_retriable(),
                    error = %e,
                    "Step failed"
                );
                if e.is_retriable() {
                    release(channel, &delivery).await;
                } else {
                    reject(channel, &delivery).await;
                }
            }
        }
    }

    tracing::info!(
        received = stats.received,
        completed = stats.completed,
        requeued = stats.requeued,
        failed = stats.failed,
        cancelled = stats.cancelled,
        "Consumer stopped"
    );
    Ok(stats)
}
