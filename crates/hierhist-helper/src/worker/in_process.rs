//! Evaluation inside the helper process

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use hierhist_core::batch::BlobBatch;
use hierhist_core::{layout, HistogramEntry, LevelPrefixes, PartialResult};
use hierhist_dpf::{
    create_evaluation_context_from_bytes, evaluate_level_at, EvaluationContext, Parameters,
    MAX_FULL_EXPANSION_BITS,
};

use super::{EvaluationJob, EvaluationWorker};
use crate::error::{Result, StepError};
use crate::store::BlobStore;

/// Raises the flag when the evaluating future is dropped
struct CancelOnDrop(Arc<AtomicBool>);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Share sums for one level plus the advanced contexts
struct LevelSums {
    sums: Vec<u64>,
    contexts: Vec<Vec<u8>>,
}

/// Evaluate `level` for every report and add the shares modulo `mask + 1`.
///
/// `cancelled` is checked before each report.
fn sum_shares(
    contexts: Vec<EvaluationContext>,
    level: usize,
    candidates: &[u64],
    points: usize,
    mask: u64,
    cancelled: &dyn Fn() -> bool,
) -> Result<LevelSums> {
    let mut sums = vec![0u64; points];
    let mut advanced = Vec::with_capacity(contexts.len());
    for context in contexts {
        if cancelled() {
            return Err(StepError::Cancelled);
        }
        let (values, next) = evaluate_level_at(context, level, candidates)?;
        if values.len() != sums.len() {
            return Err(StepError::Computation(format!(
                "expected {} shares, evaluation returned {}",
                sums.len(),
                values.len()
            )));
        }
        for (sum, value) in sums.iter_mut().zip(&values) {
            *sum = sum.wrapping_add(*value) & mask;
        }
        advanced.push(next.to_bytes()?);
    }
    Ok(LevelSums {
        sums,
        contexts: advanced,
    })
}

/// Evaluates every report of a level and sums the shares.
///
/// Contexts are carried between levels through `job.context_dir`: level L
/// reads the contexts written after level L-1 and writes its own, so a
/// redelivered step recomputes from the same inputs and publishes the same
/// bytes. No noise is added; the level's epsilon is recorded in the result.
///
/// The evaluation itself runs on a blocking thread. Dropping the
/// `evaluate` future stops it before the next report and nothing is
/// written.
pub struct InProcessWorker {
    store: Arc<dyn BlobStore>,
}

impl InProcessWorker {
    pub fn new(store: Arc<dyn BlobStore>) -> Self {
        Self { store }
    }

    async fn load_contexts(
        &self,
        job: &EvaluationJob,
        parameters: &Parameters,
    ) -> Result<Vec<EvaluationContext>> {
        if job.level == 0 {
            let reports = self.load_batch(&job.partial_report_uri).await?;
            return reports
                .blobs
                .iter()
                .map(|key| -> Result<EvaluationContext> {
                    Ok(create_evaluation_context_from_bytes(parameters, key)?)
                })
                .collect();
        }

        let previous = layout::contexts_path(&job.context_dir, job.level - 1);
        let batch = self.load_batch(&previous).await?;
        batch
            .blobs
            .iter()
            .map(|bytes| -> Result<EvaluationContext> {
                let context = EvaluationContext::from_bytes(bytes)?;
                if context.parameters() != parameters {
                    return Err(StepError::Config(format!(
                        "contexts in {} were created with different sum parameters",
                        previous.display()
                    )));
                }
                Ok(context)
            })
            .collect()
    }

    async fn load_batch(&self, location: &Path) -> Result<BlobBatch> {
        let bytes = self.store.get(location).await?;
        Ok(BlobBatch::from_bytes(&bytes)?)
    }
}

#[async_trait]
impl EvaluationWorker for InProcessWorker {
    async fn evaluate(&self, job: &EvaluationJob) -> Result<()> {
        job.check()?;
        let started = Instant::now();

        let parameters = Parameters::from_bytes(&self.store.get(&job.sum_params_uri).await?)?;
        let level = job.level as usize;
        let level_params = *parameters.level(level).ok_or_else(|| {
            StepError::Config(format!(
                "level {} is beyond the {} levels of the sum parameters",
                level,
                parameters.num_levels()
            ))
        })?;

        let prefixes = LevelPrefixes::from_json(&self.store.get(&job.prefixes_uri).await?)?;
        if prefixes.level != job.level || prefixes.prefix_bits != level_params.log_domain_size {
            return Err(StepError::Config(format!(
                "prefix file for level {} ({} bits) does not match level {} ({} bits)",
                prefixes.level, prefixes.prefix_bits, job.level, level_params.log_domain_size
            )));
        }
        let candidates = prefixes.expand()?;
        let points: Vec<u64> = if prefixes.is_root() {
            if level_params.log_domain_size > MAX_FULL_EXPANSION_BITS {
                return Err(StepError::Config(format!(
                    "level 0 has {} bits, too wide to expand in full",
                    level_params.log_domain_size
                )));
            }
            (0..1u64 << level_params.log_domain_size).collect()
        } else {
            candidates.clone()
        };

        let contexts = self.load_contexts(job, &parameters).await?;
        let reports = contexts.len();

        let cancel = Arc::new(AtomicBool::new(false));
        let _cancel_on_drop = CancelOnDrop(cancel.clone());
        let mask = level_params.value_mask();
        let expected = points.len();
        let summed = tokio::task::spawn_blocking(move || {
            sum_shares(contexts, level, &candidates, expected, mask, &|| {
                cancel.load(Ordering::Relaxed)
            })
        })
        .await
        .map_err(|e| StepError::Computation(format!("evaluation task failed: {}", e)))??;

        let result = PartialResult {
            query_id: job.query_id.clone(),
            level: job.level,
            prefix_bits: level_params.log_domain_size,
            value_bits: level_params.value_bits,
            epsilon: job.epsilon,
            entries: points
                .into_iter()
                .zip(summed.sums)
                .map(|(prefix, value)| HistogramEntry { prefix, value })
                .collect(),
        };

        let contexts_out = layout::contexts_path(&job.context_dir, job.level);
        self.store
            .put(&contexts_out, &BlobBatch::new(summed.contexts).to_bytes()?)
            .await?;
        self.store.put(&job.output_uri, &result.to_bytes()?).await?;

        tracing::info!(
            query_id = %job.query_id,
            level = job.level,
            reports,
            prefixes = result.entries.len(),
            epsilon = job.epsilon,
            elapsed_ms = started.elapsed().as_millis() as u64,
            output = %job.output_uri.display(),
            "Evaluated level"
        );
        Ok(())
    }
}
