use thiserror::Error;
use tranche::StatusCode;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine error: {0}")]
    Engine(#[from] tranche::EngineError),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Download failed with {status}: {message}")]
    Failed { status: StatusCode, message: String },

    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Interrupted; download paused")]
    Interrupted,
}

pub type Result<T> = std::result::Result<T, AppError>;
