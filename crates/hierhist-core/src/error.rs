//! Error types for hierhist-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Binary encoding error: {0}")]
    Bincode(#[from] bincode::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Invalid partial result: {0}")]
    InvalidResult(String),

    #[error("Level {level} out of range: plan has {levels} levels")]
    LevelOutOfRange { level: u32, levels: usize },
}
