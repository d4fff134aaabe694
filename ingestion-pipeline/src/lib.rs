#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod chunking;
pub mod executor;
pub mod pipeline;
pub mod scheduler;

pub use executor::JobExecutor;
pub use pipeline::PipelineOrchestrator;
