//! In-process request channel

use std::collections::{HashMap, VecDeque};

use async_trait::async_trait;
use hierhist_core::QueryStep;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::{Delivery, RequestChannel, RetryPolicy};
use crate::error::{Result, StepError};

#[derive(Debug, Clone)]
struct Queued {
    id: String,
    deliveries: u32,
    payload: Vec<u8>,
    not_before: Instant,
}

#[derive(Default)]
struct State {
    pending: VecDeque<Queued>,
    inflight: HashMap<String, Queued>,
    dead: Vec<Queued>,
    acked: usize,
    next_id: u64,
    closed: bool,
}

/// Queue held in memory, with the same redelivery semantics as the
/// durable channel. Used by tests and single-process deployments.
pub struct MemoryChannel {
    state: Mutex<State>,
    notify: Notify,
    policy: RetryPolicy,
}

impl MemoryChannel {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            state: Mutex::new(State::default()),
            notify: Notify::new(),
            policy,
        }
    }

    /// Stop handing out messages once the pending queue drains
    pub async fn close(&self) {
        self.state.lock().await.closed = true;
        self.notify.notify_waiters();
    }

    /// Payloads of messages waiting for delivery
    pub async fn pending_steps(&self) -> Vec<QueryStep> {
        self.state
            .lock()
            .await
            .pending
            .iter()
            .filter_map(|q| QueryStep::from_json(&q.payload).ok())
            .collect()
    }

    pub async fn acked_count(&self) -> usize {
        self.state.lock().await.acked
    }

    pub async fn dead_letter_count(&self) -> usize {
        self.state.lock().await.dead.len()
    }
}

#[async_trait]
impl RequestChannel for MemoryChannel {
    async fn receive(&self) -> Result<Option<Delivery>> {
        loop {
            let notified = self.notify.notified();
            let wake_at = {
                let mut state = self.state.lock().await;
                let now = Instant::now();
                if let Some(pos) = state.pending.iter().position(|q| q.not_before <= now) {
                    if let Some(mut queued) = state.pending.remove(pos) {
                        queued.deliveries += 1;
                        let delivery = Delivery {
                            id: queued.id.clone(),
                            attempt: queued.deliveries,
                            payload: queued.payload.clone(),
                        };
                        state.inflight.insert(queued.id.clone(), queued);
                        return Ok(Some(delivery));
                    }
                }
                if state.closed && state.pending.is_empty() {
                    return Ok(None);
                }
                state.pending.iter().map(|q| q.not_before).min()
            };

            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    async fn publish(&self, step: &QueryStep) -> Result<()> {
        let payload = step
            .to_json()
            .map_err(|e| StepError::Channel(e.to_string()))?;
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(StepError::Channel("channel is closed".into()));
        }
        state.next_id += 1;
        let id = format!("m-{}", state.next_id);
        state.pending.push_back(Queued {
            id,
            deliveries: 0,
            payload,
            not_before: Instant::now(),
        });
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.inflight.remove(&delivery.id).is_none() {
            return Err(StepError::Channel(format!(
                "ack for unknown message {}",
                delivery.id
            )));
        }
        state.acked += 1;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        let mut queued = state.inflight.remove(&delivery.id).ok_or_else(|| {
            StepError::Channel(format!("nack for unknown message {}", delivery.id))
        })?;

        if self.policy.is_exhausted(queued.deliveries) {
            tracing::warn!(
                message = %queued.id,
                attempts = queued.deliveries,
                "Dead-lettering message after exhausting retries"
            );
            crate::metrics::record_dead_letter();
            state.dead.push(queued);
            return Ok(());
        }

        queued.not_before = Instant::now() + self.policy.backoff(queued.deliveries);
        state.pending.push_back(queued);
        drop(state);
        self.notify.notify_waiters();
        Ok(())
    }

    async fn reject(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        let queued = state.inflight.remove(&delivery.id).ok_or_else(|| {
            StepError::Channel(format!("reject for unknown message {}", delivery.id))
        })?;
        tracing::warn!(
            message = %queued.id,
            attempts = queued.deliveries,
            "Dead-lettering message that cannot succeed"
        );
        crate::metrics::record_dead_letter();
        state.dead.push(queued);
        Ok(())
    }
}
