//! Error types for the ENAS search engine

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EnasError {
    /// Configuration or data that fails a structural check
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Child network build/train/evaluate failure
    #[error("Training error: {0}")]
    TrainingError(String),

    /// Resume was requested but the persisted state is missing or corrupt
    #[error("Resume error: {0}")]
    ResumeError(String),

    /// Learning-rate schedule does not cover the requested epoch
    #[error("Schedule error: {0}")]
    ScheduleError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, EnasError>;
