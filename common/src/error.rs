use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Illegal state: {0}")]
    IllegalState(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Reqwest error: {0}")]
    Reqwest(#[from] reqwest::Error),
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Pipeline processing error: {0}")]
    Processing(String),
    #[error("Vector store error: {0}")]
    VectorStore(String),
    #[error("Internal service error: {0}")]
    InternalError(String),
}

impl AppError {
    /// Error type label used in telemetry (`error_type` field of
    /// `job_failed` events).
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Database(_) => "DatabaseError",
            Self::OpenAI(_) => "OpenAIError",
            Self::NotFound(_) => "NotFoundError",
            Self::Validation(_) => "ValidationError",
            Self::IllegalState(_) => "IllegalStateError",
            Self::Join(_) => "JoinError",
            Self::Io(_) => "IoError",
            Self::Reqwest(_) => "RequestError",
            Self::Config(_) => "ConfigError",
            Self::Anyhow(_) => "UnexpectedError",
            Self::Processing(_) => "ProcessingError",
            Self::VectorStore(_) => "VectorStoreError",
            Self::InternalError(_) => "InternalError",
        }
    }
}
