//! External evaluation worker
//!
//! Evaluates one level of one query and publishes the partial result. The
//! helper runs this binary when configured with an external worker; the
//! flags mirror [`EvaluationJob::to_args`].

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use hierhist_helper::{
    EvaluationJob, EvaluationWorker, ExecutionMode, InProcessWorker, LocalStore,
};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Runner {
    Direct,
    Distributed,
}

#[derive(Parser, Debug)]
#[command(name = "aggregate-level")]
#[command(about = "Evaluate one hierarchy level over a batch of key shares")]
struct Args {
    #[arg(long = "partial_report_file")]
    partial_report_file: PathBuf,

    #[arg(long = "sum_parameters_file")]
    sum_parameters_file: PathBuf,

    #[arg(long = "prefixes_file")]
    prefixes_file: PathBuf,

    #[arg(long = "partial_histogram_file")]
    partial_histogram_file: PathBuf,

    #[arg(long)]
    epsilon: f64,

    #[arg(long = "private_key_params_uri")]
    private_key_params_uri: Option<String>,

    /// Directory holding evaluation contexts between levels
    #[arg(long = "context_dir")]
    context_dir: PathBuf,

    #[arg(long = "query_id")]
    query_id: String,

    #[arg(long)]
    level: u32,

    #[arg(long, value_enum, default_value = "direct")]
    runner: Runner,

    #[arg(long)]
    project: Option<String>,

    #[arg(long)]
    region: Option<String>,

    #[arg(long = "temp_location")]
    temp_location: Option<String>,

    #[arg(long = "staging_location")]
    staging_location: Option<String>,
}

impl Args {
    fn into_job(self) -> anyhow::Result<EvaluationJob> {
        let mode = match self.runner {
            Runner::Direct => ExecutionMode::Direct,
            Runner::Distributed => {
                let missing = |flag: &str| anyhow::anyhow!("--runner=distributed requires --{}", flag);
                ExecutionMode::Distributed {
                    project: self.project.ok_or_else(|| missing("project"))?,
                    region: self.region.ok_or_else(|| missing("region"))?,
                    temp_location: self.temp_location.ok_or_else(|| missing("temp_location"))?,
                    staging_location: self
                        .staging_location
                        .ok_or_else(|| missing("staging_location"))?,
                }
            }
        };

        Ok(EvaluationJob {
            query_id: self.query_id,
            level: self.level,
            partial_report_uri: self.partial_report_file,
            sum_params_uri: self.sum_parameters_file,
            prefixes_uri: self.prefixes_file,
            output_uri: self.partial_histogram_file,
            context_dir: self.context_dir,
            epsilon: self.epsilon,
            key_params_uri: self.private_key_params_uri,
            mode,
        })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("hierhist_helper=info".parse()?))
        .with_writer(std::io::stderr)
        .init();

    let job = Args::parse().into_job()?;
    if let ExecutionMode::Distributed { project, region, .. } = &job.mode {
        tracing::warn!(
            project = %project,
            region = %region,
            "No distributed runner is linked in; evaluating on this machine"
        );
    }

    let worker = InProcessWorker::new(Arc::new(LocalStore::new()));
    worker.evaluate(&job).await?;

    println!("[OK] Wrote {}", job.output_uri.display());
    Ok(())
}
