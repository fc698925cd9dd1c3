//! Helper service for two-helper hierarchical histograms
//!
//! A helper consumes [`QueryStep`](hierhist_core::QueryStep) messages from
//! its request channel. For each one it:
//! 1. Checks that the partner finished the previous level ([`DependencyGate`])
//! 2. Derives the heavy prefixes to refine from both helpers' shares
//! 3. Evaluates its key shares at those prefixes ([`EvaluationWorker`])
//! 4. Publishes the partial result and queues the next level
//!
//! ## Usage
//!
//! ```no_run
//! use hierhist_helper::{HelperConfig, HelperService};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let (_stop, shutdown) = tokio::sync::watch::channel(false);
//!     let service = HelperService::new(HelperConfig::default()).await?;
//!     service.run(shutdown).await?;
//!     Ok(())
//! }
//! ```

pub mod aggregator;
pub mod channel;
pub mod config;
pub mod error;
pub mod gate;
pub mod metrics;
pub mod server;
mod service;
pub mod store;
pub mod worker;

pub use aggregator::{Aggregator, StepOutcome, StepState};
pub use channel::{
    consume, ConsumeStats, Delivery, MemoryChannel, RequestChannel, RetryPolicy, SpoolChannel,
};
pub use config::{HelperConfig, WorkerKind};
pub use error::{Result, StepError};
pub use gate::DependencyGate;
pub use server::{create_router, read_helper_shared_info};
pub use service::HelperService;
pub use store::{BlobStore, LocalStore};
pub use worker::{EvaluationJob, EvaluationWorker, ExecutionMode, InProcessWorker, ProcessWorker};
