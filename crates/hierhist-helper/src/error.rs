//! Step error types

use hierhist_dpf::DpfError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StepError {
    #[error("Result from {origin} for query {query_id} level {level} is not ready")]
    DependencyNotReady {
        origin: String,
        query_id: String,
        level: u32,
    },

    #[error("Invalid query configuration: {0}")]
    Config(String),

    #[error("Evaluation failed: {0}")]
    Computation(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Share engine error: {0}")]
    Dpf(#[from] DpfError),

    #[error("Step cancelled")]
    Cancelled,
}

impl StepError {
    /// Whether redelivering the same step can succeed
    pub fn is_retriable(&self) -> bool {
        match self {
            StepError::DependencyNotReady { .. } => true,
            StepError::Config(_) => false,
            StepError::Computation(_) => true,
            StepError::Storage(_) => true,
            StepError::Channel(_) => true,
            StepError::Dpf(e) => !e.is_caller_fault(),
            StepError::Cancelled => true,
        }
    }

    /// Short label for metrics and logs
    pub fn label(&self) -> &'static str {
        match self {
            StepError::DependencyNotReady { .. } => "dependency_not_ready",
            StepError::Config(_) => "config_error",
            StepError::Computation(_) => "computation_error",
            StepError::Storage(_) => "storage_error",
            StepError::Channel(_) => "channel_error",
            StepError::Dpf(_) => "dpf_error",
            StepError::Cancelled => "cancelled",
        }
    }
}

impl From<hierhist_core::Error> for StepError {
    fn from(err: hierhist_core::Error) -> Self {
        match err {
            hierhist_core::Error::Io(e) => StepError::Storage(e.to_string()),
            other => StepError::Config(other.to_string()),
        }
    }
}

impl From<std::io::Error> for StepError {
    fn from(err: std::io::Error) -> Self {
        StepError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StepError>;
