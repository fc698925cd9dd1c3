//! Request channel: durable, at-least-once delivery of query steps
//!
//! The channel owns redelivery. A negatively acknowledged message comes
//! back after an exponential backoff until [`RetryPolicy::max_attempts`]
//! deliveries have failed, after which it is dead-lettered. Failures that
//! no retry can fix are rejected and dead-lettered at once. The
//! orchestrator itself never retries.

mod consumer;
mod memory;
mod spool;

pub use consumer::{consume, ConsumeStats};
pub use memory::MemoryChannel;
pub use spool::SpoolChannel;

use std::time::Duration;

use async_trait::async_trait;
use hierhist_core::QueryStep;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StepError};

/// One delivery of one message
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Channel-specific message identifier
    pub id: String,
    /// 1 for the first delivery, incremented on every redelivery
    pub attempt: u32,
    /// JSON-encoded [`QueryStep`]
    pub payload: Vec<u8>,
}

impl Delivery {
    pub fn step(&self) -> Result<QueryStep> {
        QueryStep::from_json(&self.payload)
            .map_err(|e| StepError::Channel(format!("undecodable message {}: {}", self.id, e)))
    }
}

/// Bounded redelivery policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Deliveries before a message is dead-lettered
    pub max_attempts: u32,
    /// Delay before the first redelivery
    pub initial_backoff_ms: u64,
    /// Upper bound on the delay
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            initial_backoff_ms: 1_000,
            max_backoff_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// Delay before redelivering a message that has failed `attempt` times
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32);
        let delay = self
            .initial_backoff_ms
            .saturating_mul(1u64 << exponent)
            .min(self.max_backoff_ms);
        Duration::from_millis(delay)
    }

    /// True once a message with `attempt` failed deliveries must be dropped
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

#[async_trait]
pub trait RequestChannel: Send + Sync {
    /// Wait for the next deliverable message; `None` once the channel is closed
    async fn receive(&self) -> Result<Option<Delivery>>;

    async fn publish(&self, step: &QueryStep) -> Result<()>;

    /// Processing finished; remove the message
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Processing failed; redeliver per the retry policy
    async fn nack(&self, delivery: &Delivery) -> Result<()>;

    /// Processing can never succeed; dead-letter without further attempts
    async fn reject(&self, delivery: &Delivery) -> Result<()>;
}
