//! Evaluation work for one level of one query
//!
//! The orchestrator hands an [`EvaluationJob`] to an [`EvaluationWorker`].
//! [`InProcessWorker`] evaluates the reports directly; [`ProcessWorker`]
//! delegates to an external binary (normally `aggregate-level`) with the
//! job rendered as `--flag=value` arguments.

mod in_process;
mod process;

pub use in_process::InProcessWorker;
pub use process::ProcessWorker;

use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StepError};

/// Where the evaluation runs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "runner", rename_all = "snake_case")]
pub enum ExecutionMode {
    /// On this machine
    #[default]
    Direct,
    /// On a distributed runner; the arguments are forwarded untouched
    Distributed {
        project: String,
        region: String,
        temp_location: String,
        staging_location: String,
    },
}

impl ExecutionMode {
    pub fn runner(&self) -> &'static str {
        match self {
            ExecutionMode::Direct => "direct",
            ExecutionMode::Distributed { .. } => "distributed",
        }
    }
}

/// Everything the evaluation of one level needs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationJob {
    pub query_id: String,
    pub level: u32,
    /// Bincode batch of this helper's key shares
    pub partial_report_uri: PathBuf,
    /// Bincode share-engine parameters
    pub sum_params_uri: PathBuf,
    /// Prefix file for this level
    pub prefixes_uri: PathBuf,
    /// Where the partial result is published
    pub output_uri: PathBuf,
    /// Private directory holding evaluation contexts between levels
    pub context_dir: PathBuf,
    pub epsilon: f64,
    /// Key-decryption parameters, forwarded to external workers
    pub key_params_uri: Option<String>,
    pub mode: ExecutionMode,
}

impl EvaluationJob {
    /// Command-line rendering understood by `aggregate-level`
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            format!("--partial_report_file={}", self.partial_report_uri.display()),
            format!("--sum_parameters_file={}", self.sum_params_uri.display()),
            format!("--prefixes_file={}", self.prefixes_uri.display()),
            format!("--partial_histogram_file={}", self.output_uri.display()),
            format!("--epsilon={}", self.epsilon),
            format!("--context_dir={}", self.context_dir.display()),
            format!("--query_id={}", self.query_id),
            format!("--level={}", self.level),
            format!("--runner={}", self.mode.runner()),
        ];
        if let Some(uri) = &self.key_params_uri {
            args.push(format!("--private_key_params_uri={}", uri));
        }
        if let ExecutionMode::Distributed {
            project,
            region,
            temp_location,
            staging_location,
        } = &self.mode
        {
            args.push(format!("--project={}", project));
            args.push(format!("--region={}", region));
            args.push(format!("--temp_location={}", temp_location));
            args.push(format!("--staging_location={}", staging_location));
        }
        args
    }

    pub(crate) fn check(&self) -> Result<()> {
        if !self.epsilon.is_finite() || self.epsilon <= 0.0 {
            return Err(StepError::Config(format!(
                "epsilon must be positive, got {}",
                self.epsilon
            )));
        }
        Ok(())
    }
}

#[async_trait]
pub trait EvaluationWorker: Send + Sync {
    /// Evaluate one level and publish its partial result to `job.output_uri`.
    ///
    /// On error nothing is visible at `job.output_uri`. Dropping the
    /// returned future aborts the work.
    async fn evaluate(&self, job: &EvaluationJob) -> Result<()>;
}
