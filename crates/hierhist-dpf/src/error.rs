//! Error types for hierhist-dpf

use thiserror::Error;

/// Broad error category, so callers can decide retriability without
/// inspecting message text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or inconsistent parameters, keys or context blobs
    Parameter,
    /// Malformed prefixes or key-generation inputs
    Input,
    /// Context used out of order or after its final level
    State,
    /// Failure inside the engine itself
    Internal,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DpfError {
    #[error("Invalid parameters: {0}")]
    Parameter(String),

    #[error("Invalid input: {0}")]
    Input(String),

    #[error("Invalid context state: {0}")]
    State(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DpfError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DpfError::Parameter(_) => ErrorKind::Parameter,
            DpfError::Input(_) => ErrorKind::Input,
            DpfError::State(_) => ErrorKind::State,
            DpfError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// True when the failure was caused by what the caller passed in.
    pub fn is_caller_fault(&self) -> bool {
        !matches!(self, DpfError::Internal(_))
    }

    pub(crate) fn decode(what: &str, err: bincode::Error) -> Self {
        DpfError::Parameter(format!("failed to decode {}: {}", what, err))
    }

    pub(crate) fn encode(what: &str, err: bincode::Error) -> Self {
        DpfError::Internal(format!("failed to encode {}: {}", what, err))
    }
}

pub type Result<T> = std::result::Result<T, DpfError>;
