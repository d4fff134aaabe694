use std::time::Instant;

use serde_json::json;
use tracing::{info, instrument};

use common::error::AppError;
use common::storage::types::document::{Chunk, CleanedDocument, JsonMap};
use common::telemetry::TelemetrySink;
use common::utils::config::AppConfig;

use crate::chunking::{
    ChunkingConfig, ChunkingStrategy, SemanticChunker, SentenceEncoder, TokenBudgetChunker,
};

use super::StageError;

const STAGE: &str = "chunk";

/// The engine behind the chunk stage, selected by strategy.
pub enum ChunkingEngine {
    TokenBudget(TokenBudgetChunker),
    Semantic(SemanticChunker),
}

impl ChunkingEngine {
    pub fn token_budget(config: ChunkingConfig) -> Result<Self, AppError> {
        Ok(Self::TokenBudget(TokenBudgetChunker::new(config)?))
    }

    pub fn semantic(
        config: ChunkingConfig,
        encoder: Box<dyn SentenceEncoder>,
    ) -> Result<Self, AppError> {
        Ok(Self::Semantic(SemanticChunker::new(config, encoder)?))
    }

    fn chunk_document(&self, document: &CleanedDocument) -> Result<Vec<Chunk>, AppError> {
        match self {
            Self::TokenBudget(chunker) => chunker.chunk_document(document),
            Self::Semantic(chunker) => chunker.chunk_document(document),
        }
    }
}

/// Stage 3: segment cleaned documents into token-bounded chunks.
pub struct ChunkStage {
    engine: ChunkingEngine,
    telemetry: TelemetrySink,
}

impl ChunkStage {
    pub fn new(engine: ChunkingEngine, telemetry: TelemetrySink) -> Self {
        Self { engine, telemetry }
    }

    /// Engine selection from configuration: the token-budget engine by
    /// default, or the semantic engine (with its local sentence model)
    /// when a semantic strategy is configured.
    pub fn from_config(config: &AppConfig, telemetry: TelemetrySink) -> Result<Self, AppError> {
        let strategy: ChunkingStrategy = config.chunk_strategy.parse()?;
        let chunking = ChunkingConfig {
            chunk_size: config.chunk_size,
            chunk_overlap: config.chunk_overlap,
            strategy,
            ..ChunkingConfig::default()
        };

        let engine = match strategy {
            ChunkingStrategy::TokenBased => ChunkingEngine::token_budget(chunking)?,
            _ => ChunkingEngine::semantic(
                chunking,
                Box::new(crate::chunking::FastEmbedEncoder::new()?),
            )?,
        };

        Ok(Self::new(engine, telemetry))
    }

    #[instrument(skip_all, fields(job_id = %job_id, correlation_id = %correlation_id))]
    pub async fn execute(
        &self,
        documents: &[CleanedDocument],
        job_id: &str,
        correlation_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<Chunk>, StageError> {
        let started = Instant::now();

        let mut all_chunks: Vec<Chunk> = Vec::new();
        for document in documents {
            match self.engine.chunk_document(document) {
                Ok(chunks) => all_chunks.extend(chunks),
                Err(err) => {
                    let stage_err = StageError::from_app(STAGE, &err);
                    self.telemetry
                        .emit_job_failed(
                            job_id,
                            document.source_kind.as_str(),
                            correlation_id,
                            STAGE,
                            &stage_err.error_type,
                            &stage_err.message,
                            0,
                            tenant_id,
                        )
                        .await;
                    return Err(stage_err);
                }
            }
        }

        let total_tokens: usize = all_chunks.iter().map(|c| c.token_count).sum();
        let avg_chunk_size = if all_chunks.is_empty() {
            0.0
        } else {
            ((total_tokens as f64 / all_chunks.len() as f64) * 100.0).round() / 100.0
        };
        let chunks_per_document = if documents.is_empty() {
            0.0
        } else {
            ((all_chunks.len() as f64 / documents.len() as f64) * 100.0).round() / 100.0
        };

        let mut metadata = JsonMap::new();
        metadata.insert("document_count".to_string(), json!(documents.len()));
        metadata.insert("chunk_count".to_string(), json!(all_chunks.len()));
        metadata.insert("total_tokens".to_string(), json!(total_tokens));
        metadata.insert("avg_chunk_size".to_string(), json!(avg_chunk_size));
        metadata.insert("chunks_per_document".to_string(), json!(chunks_per_document));

        self.telemetry
            .emit_phase_completed(
                job_id,
                STAGE,
                3,
                correlation_id,
                started.elapsed().as_secs_f64() * 1000.0,
                all_chunks.len(),
                tenant_id,
                Some(metadata),
            )
            .await;

        info!(
            chunks = all_chunks.len(),
            total_tokens, "chunk stage completed"
        );

        Ok(all_chunks)
    }
}
