use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{debug, info, instrument};

use common::error::AppError;
use common::storage::types::document::{Chunk, Embedding, JsonMap};
use common::telemetry::TelemetrySink;
use common::utils::embedding::{is_transient_openai_error, EmbeddingBackend};
use common::utils::retry::{retry_with_backoff, RetryContext, RetryPolicy};

use super::StageError;

const STAGE: &str = "embed";

/// Whether an embedding failure is worth retrying at the harness level.
fn is_transient(err: &AppError) -> bool {
    match err {
        AppError::OpenAI(inner) => is_transient_openai_error(inner),
        AppError::Reqwest(_) => true,
        _ => false,
    }
}

/// Stage 4: batch chunks and attach provider vectors, preserving input
/// order.
pub struct EmbedStage {
    backend: Arc<dyn EmbeddingBackend>,
    batch_size: usize,
    policy: RetryPolicy,
    telemetry: TelemetrySink,
}

impl EmbedStage {
    pub fn new(
        backend: Arc<dyn EmbeddingBackend>,
        batch_size: usize,
        policy: RetryPolicy,
        telemetry: TelemetrySink,
    ) -> Self {
        Self {
            backend,
            batch_size: batch_size.clamp(1, 2048),
            policy,
            telemetry,
        }
    }

    #[instrument(skip_all, fields(job_id = %job_id, correlation_id = %correlation_id))]
    pub async fn execute(
        &self,
        chunks: &[Chunk],
        source: &str,
        job_id: &str,
        correlation_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<Embedding>, StageError> {
        let started = Instant::now();

        match self.embed_chunks(chunks, job_id, correlation_id, tenant_id).await {
            Ok(embeddings) => {
                let total_tokens: usize = chunks.iter().map(|c| c.token_count).sum();
                let mut metadata = JsonMap::new();
                metadata.insert("chunk_count".to_string(), json!(chunks.len()));
                metadata.insert("embedding_count".to_string(), json!(embeddings.len()));
                metadata.insert("total_tokens".to_string(), json!(total_tokens));
                metadata.insert("model".to_string(), json!(self.backend.model()));
                metadata.insert(
                    "vector_dimension".to_string(),
                    json!(self.backend.dimension()),
                );

                self.telemetry
                    .emit_phase_completed(
                        job_id,
                        STAGE,
                        4,
                        correlation_id,
                        started.elapsed().as_secs_f64() * 1000.0,
                        embeddings.len(),
                        tenant_id,
                        Some(metadata),
                    )
                    .await;

                info!(
                    embeddings = embeddings.len(),
                    model = self.backend.model(),
                    "embed stage completed"
                );

                Ok(embeddings)
            }
            Err(err) => {
                let stage_err = StageError::from_app(STAGE, &err);
                self.telemetry
                    .emit_job_failed(
                        job_id,
                        source,
                        correlation_id,
                        STAGE,
                        &stage_err.error_type,
                        &stage_err.message,
                        if is_transient(&err) {
                            self.policy.max_attempts.saturating_sub(1)
                        } else {
                            0
                        },
                        tenant_id,
                    )
                    .await;
                Err(stage_err)
            }
        }
    }

    async fn embed_chunks(
        &self,
        chunks: &[Chunk],
        job_id: &str,
        correlation_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<Embedding>, AppError> {
        let expected_dimension = self.backend.dimension();
        let ctx = RetryContext::new(job_id, STAGE, correlation_id, tenant_id);

        let mut embeddings: Vec<Embedding> = Vec::with_capacity(chunks.len());

        // Batches are issued sequentially to stay inside the provider's
        // rate limit
        for (batch_index, batch) in chunks.chunks(self.batch_size).enumerate() {
            let inputs: Vec<String> = batch.iter().map(|c| c.content.clone()).collect();

            debug!(
                batch = batch_index + 1,
                batch_size = inputs.len(),
                "requesting embedding batch"
            );

            let vectors = retry_with_backoff(
                self.policy,
                &ctx,
                &self.telemetry,
                is_transient,
                || self.backend.embed_batch(&inputs),
            )
            .await?;

            if vectors.len() != batch.len() {
                return Err(AppError::InternalError(format!(
                    "provider returned {} vectors for a batch of {}",
                    vectors.len(),
                    batch.len()
                )));
            }

            for (chunk, vector) in batch.iter().zip(vectors) {
                if vector.len() != expected_dimension {
                    return Err(AppError::InternalError(format!(
                        "embedding for chunk {} has dimension {} but model {} declares {}",
                        chunk.id,
                        vector.len(),
                        self.backend.model(),
                        expected_dimension
                    )));
                }

                let mut metadata = chunk.metadata.clone();
                metadata.insert("document_id".to_string(), json!(chunk.document_id));
                metadata.insert("chunk_position".to_string(), json!(chunk.position));
                metadata.insert("embedding_dimension".to_string(), json!(vector.len()));

                embeddings.push(Embedding::new(
                    chunk.id.clone(),
                    vector,
                    self.backend.model().to_string(),
                    metadata,
                    chunk.tenant_id.clone(),
                ));
            }
        }

        Ok(embeddings)
    }
}
