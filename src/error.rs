//! Error types for the financial QA pipeline

use crate::models::{Stage, TaskId};
use thiserror::Error;

/// Result type alias for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {

    // =============================
    // Task / Stage Errors
    // =============================

    #[error("Task not found: {0}")]
    TaskNotFound(TaskId),

    #[error("Missing {stage} result for task {task_id}")]
    MissingStageResult { stage: Stage, task_id: TaskId },

    #[error("Search produced an empty action sequence for task {0}")]
    EmptyActionSequence(TaskId),

    #[error("Model error: {0}")]
    ModelError(String),

    #[error("Model request cancelled")]
    Cancelled,

    #[error("Message bus error: {0}")]
    BusError(String),

    #[error("Report error: {0}")]
    ReportError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    // =============================
    // External Library Conversions
    // =============================

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("UUID parse error: {0}")]
    UuidError(#[from] uuid::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}
