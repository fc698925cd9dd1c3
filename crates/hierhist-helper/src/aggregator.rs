//! Level orchestrator
//!
//! Advances one query by one level per delivered [`QueryStep`]:
//!
//! ```text
//! AwaitingDependency -> Computing -> Publishing -> Requeued | Completed
//!          \________________\______________\_____> Failed
//! ```
//!
//! The orchestrator never retries and never waits. A step that cannot make
//! progress fails, and the request channel decides whether and when the
//! step is delivered again. Everything a step writes is published
//! atomically and is a pure function of its inputs, so redelivery after a
//! crash recomputes the same bytes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use hierhist_core::{
    layout, select_heavy_prefixes, ExpansionPlan, HelperSharedInfo, LevelPrefixes, PartialResult,
    QueryStep,
};

use crate::channel::RequestChannel;
use crate::error::{Result, StepError};
use crate::gate::DependencyGate;
use crate::metrics;
use crate::store::BlobStore;
use crate::worker::{EvaluationJob, EvaluationWorker, ExecutionMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepState {
    AwaitingDependency,
    Computing,
    Publishing,
    Requeued,
    Completed,
    Failed,
}

impl StepState {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepState::AwaitingDependency => "awaiting_dependency",
            StepState::Computing => "computing",
            StepState::Publishing => "publishing",
            StepState::Requeued => "requeued",
            StepState::Completed => "completed",
            StepState::Failed => "failed",
        }
    }
}

/// How a successful step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The next level was published to the request channel
    Requeued,
    /// The final level's result is in the result directory
    Completed,
}

impl StepOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            StepOutcome::Requeued => metrics::OUTCOME_REQUEUED,
            StepOutcome::Completed => metrics::OUTCOME_COMPLETED,
        }
    }
}

/// Decrements the in-flight gauge even when the step future is dropped
struct InFlight;

impl InFlight {
    fn enter() -> Self {
        metrics::record_step_start();
        InFlight
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        metrics::record_step_end();
    }
}

pub struct Aggregator {
    store: Arc<dyn BlobStore>,
    gate: DependencyGate,
    worker: Arc<dyn EvaluationWorker>,
    channel: Arc<dyn RequestChannel>,
    shared_info: HelperSharedInfo,
    work_dir: PathBuf,
    key_params_uri: Option<String>,
    mode: ExecutionMode,
}

impl Aggregator {
    pub fn new(
        store: Arc<dyn BlobStore>,
        worker: Arc<dyn EvaluationWorker>,
        channel: Arc<dyn RequestChannel>,
        shared_info: HelperSharedInfo,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            gate: DependencyGate::new(store.clone()),
            store,
            worker,
            channel,
            shared_info,
            work_dir: work_dir.into(),
            key_params_uri: None,
            mode: ExecutionMode::Direct,
        }
    }

    pub fn with_key_params_uri(mut self, uri: Option<String>) -> Self {
        self.key_params_uri = uri;
        self
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    /// This helper's identity, as served to the partner
    pub fn shared_info(&self) -> &HelperSharedInfo {
        &self.shared_info
    }

    /// Process one delivered step.
    ///
    /// On `Ok` the caller acknowledges the delivery; on `Err` it negatively
    /// acknowledges it. The next level is published before this returns, so
    /// acknowledging never loses the query.
    pub async fn handle(&self, step: &QueryStep) -> Result<StepOutcome> {
        let started = Instant::now();
        let _in_flight = InFlight::enter();

        let result = self.advance(step).await;
        match &result {
            Ok(outcome) => metrics::record_step(outcome.label(), started.elapsed()),
            Err(e) => {
                self.transition(step, StepState::Failed);
                tracing::debug!(
                    query_id = %step.query_id,
                    level = step.level,
                    reason = e.label(),
                    retriable = e.is_retriable(),
                    "Step failed"
                );
                metrics::record_step(e.label(), started.elapsed());
            }
        }
        result
    }

    async fn advance(&self, step: &QueryStep) -> Result<StepOutcome> {
        step.validate()?;
        let plan = self.load_plan(step).await?;

        if step.level > plan.final_level() {
            return Err(StepError::Config(format!(
                "query {} has no level {}; the plan ends at level {}",
                step.query_id,
                step.level,
                plan.final_level()
            )));
        }

        self.transition(step, StepState::AwaitingDependency);
        if !self.gate.partner_ready(step).await? {
            return Err(StepError::DependencyNotReady {
                origin: step.partner_shared_info.origin.clone(),
                query_id: step.query_id.clone(),
                level: step.level - 1,
            });
        }

        let epsilon = plan.epsilon_for(step.total_epsilon, step.level)?;
        let prefixes_uri = self.resolve_prefixes(step, &plan).await?;
        let is_final = plan.is_final(step.level);
        let output_uri = if is_final {
            layout::partial_result_path(&step.result_dir, &step.query_id, step.level)
        } else {
            layout::partial_result_path(&self.shared_info.shared_dir, &step.query_id, step.level)
        };

        let job = EvaluationJob {
            query_id: step.query_id.clone(),
            level: step.level,
            partial_report_uri: step.partial_report_uri.clone(),
            sum_params_uri: step.sum_params_uri.clone(),
            prefixes_uri,
            output_uri,
            context_dir: layout::context_dir(&self.work_dir, &step.query_id),
            epsilon,
            key_params_uri: self.key_params_uri.clone(),
            mode: self.mode.clone(),
        };

        self.transition(step, StepState::Computing);
        metrics::set_current_level(step.level);
        self.worker.evaluate(&job).await?;

        self.transition(step, StepState::Publishing);
        if is_final {
            self.transition(step, StepState::Completed);
            tracing::info!(
                query_id = %step.query_id,
                level = step.level,
                result = %job.output_uri.display(),
                "Query completed"
            );
            return Ok(StepOutcome::Completed);
        }

        self.channel.publish(&step.next_level()).await?;
        self.transition(step, StepState::Requeued);
        Ok(StepOutcome::Requeued)
    }

    async fn load_plan(&self, step: &QueryStep) -> Result<ExpansionPlan> {
        let bytes = self.store.get(&step.expand_config_uri).await.map_err(|e| {
            StepError::Config(format!(
                "cannot read expansion plan {}: {}",
                step.expand_config_uri.display(),
                e
            ))
        })?;
        ExpansionPlan::from_json(&bytes).map_err(|e| {
            StepError::Config(format!(
                "invalid expansion plan {}: {}",
                step.expand_config_uri.display(),
                e
            ))
        })
    }

    /// Write the prefix file for this level and return its location
    async fn resolve_prefixes(&self, step: &QueryStep, plan: &ExpansionPlan) -> Result<PathBuf> {
        let level = step.level;
        if level == 0 {
            if let Some(uri) = &step.prefixes_uri {
                return Ok(uri.clone());
            }
        }

        let prefixes = if level == 0 {
            LevelPrefixes::root(plan.prefix_bits(0)?)
        } else {
            let own = self
                .read_result(&self.shared_info.shared_dir, &step.query_id, level - 1)
                .await?;
            let partner = self
                .read_result(&step.partner_shared_info.shared_dir, &step.query_id, level - 1)
                .await?;
            let threshold = plan.threshold(level - 1)?;
            let heavy = select_heavy_prefixes(&own, &partner, threshold)?;
            tracing::info!(
                query_id = %step.query_id,
                level,
                candidates = own.entries.len(),
                heavy = heavy.len(),
                threshold,
                "Selected heavy prefixes"
            );
            LevelPrefixes::new(
                level,
                plan.prefix_bits(level - 1)?,
                plan.prefix_bits(level)?,
                heavy,
            )?
        };

        let location = layout::prefixes_path(&self.work_dir, &step.query_id, level);
        self.store.put(&location, &prefixes.to_json()?).await?;
        Ok(location)
    }

    async fn read_result(
        &self,
        base_dir: &std::path::Path,
        query_id: &str,
        level: u32,
    ) -> Result<PartialResult> {
        let location = layout::partial_result_path(base_dir, query_id, level);
        let bytes = self.store.get(&location).await?;
        Ok(PartialResult::from_bytes(&bytes)?)
    }

    fn transition(&self, step: &QueryStep, state: StepState) {
        tracing::debug!(
            query_id = %step.query_id,
            level = step.level,
            state = state.as_str(),
            "Step transition"
        );
        metrics::record_transition(state.as_str());
    }
}
