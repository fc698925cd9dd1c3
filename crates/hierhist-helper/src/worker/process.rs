//! Evaluation in an external process

use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

use super::{EvaluationJob, EvaluationWorker};
use crate::error::{Result, StepError};

/// Longest stderr excerpt carried in a computation error
const STDERR_EXCERPT: usize = 4096;

/// Runs `binary` with the job's flags and waits for it to exit.
///
/// The child is killed if the future is dropped, so cancelling a step
/// never leaves an orphaned evaluation behind.
#[derive(Debug, Clone)]
pub struct ProcessWorker {
    binary: PathBuf,
    extra_args: Vec<String>,
}

impl ProcessWorker {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            extra_args: Vec::new(),
        }
    }

    /// Arguments placed before the job flags
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }
}

fn excerpt(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.len() <= STDERR_EXCERPT {
        return text.to_string();
    }
    let mut start = text.len() - STDERR_EXCERPT;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    format!("...{}", &text[start..])
}

#[async_trait]
impl EvaluationWorker for ProcessWorker {
    async fn evaluate(&self, job: &EvaluationJob) -> Result<()> {
        job.check()?;

        let mut command = Command::new(&self.binary);
        command
            .args(&self.extra_args)
            .args(job.to_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        tracing::debug!(
            query_id = %job.query_id,
            level = job.level,
            binary = %self.binary.display(),
            runner = job.mode.runner(),
            "Starting evaluation process"
        );

        let output = command.output().await.map_err(|e| {
            StepError::Computation(format!("failed to run {}: {}", self.binary.display(), e))
        })?;

        if !output.stdout.is_empty() {
            tracing::debug!(
                query_id = %job.query_id,
                level = job.level,
                stdout = %excerpt(&output.stdout),
                "Evaluation process output"
            );
        }

        if !output.status.success() {
            return Err(StepError::Computation(format!(
                "{} exited with {}: {}",
                self.binary.display(),
                output.status,
                excerpt(&output.stderr)
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::tests::job;

    #[tokio::test]
    async fn test_success_on_zero_exit() {
        let worker = ProcessWorker::new("sh").with_args(vec!["-c".into(), "exit 0".into()]);
        worker.evaluate(&job()).await.unwrap();
    }

    #[tokio::test]
    async fn test_nonzero_exit_carries_stderr() {
        let worker = ProcessWorker::new("sh").with_args(vec![
            "-c".into(),
            "echo 'no reports' >&2; exit 3".into(),
        ]);
        match worker.evaluate(&job()).await {
            Err(StepError::Computation(msg)) => assert!(msg.contains("no reports"), "{}", msg),
            other => panic!("expected computation error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_job_flags_reach_the_process() {
        let worker = ProcessWorker::new("sh").with_args(vec![
            "-c".into(),
            r#"for a in "$@"; do [ "$a" = "--level=1" ] && exit 0; done; exit 1"#.into(),
            "worker".into(),
        ]);
        worker.evaluate(&job()).await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let worker = ProcessWorker::new("/nonexistent/aggregate-level");
        assert!(matches!(
            worker.evaluate(&job()).await,
            Err(StepError::Computation(_))
        ));
    }

    #[test]
    fn test_excerpt_keeps_tail() {
        let long = "x".repeat(STDERR_EXCERPT) + "tail";
        let cut = excerpt(long.as_bytes());
        assert!(cut.starts_with("..."));
        assert!(cut.ends_with("tail"));
    }
}
