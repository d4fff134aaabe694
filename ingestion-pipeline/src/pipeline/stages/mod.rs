pub mod chunk;
pub mod clean;
pub mod embed;
pub mod fetch;
pub mod store;

pub use chunk::{ChunkStage, ChunkingEngine};
pub use clean::{CleanConfig, CleanStage};
pub use embed::EmbedStage;
pub use fetch::FetchStage;
pub use store::StoreStage;

use common::error::AppError;
use thiserror::Error;

/// Failure of one pipeline stage. Fails the whole job; stages that
/// already ran stay recorded on the job row.
#[derive(Error, Debug, Clone)]
#[error("{stage} stage failed: {message}")]
pub struct StageError {
    pub stage: &'static str,
    pub error_type: String,
    pub message: String,
}

impl StageError {
    pub fn new(
        stage: &'static str,
        error_type: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            stage,
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn from_app(stage: &'static str, err: &AppError) -> Self {
        Self {
            stage,
            error_type: err.error_type().to_string(),
            message: err.to_string(),
        }
    }
}

impl From<StageError> for AppError {
    fn from(err: StageError) -> Self {
        AppError::Processing(err.to_string())
    }
}
