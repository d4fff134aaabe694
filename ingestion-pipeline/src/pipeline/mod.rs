pub mod stages;

use std::time::Instant;

use serde_json::json;
use tracing::{info, instrument, warn};

use common::error::AppError;
use common::storage::types::document::JsonMap;
use common::storage::types::job::{JobPatch, JobStatus, JobStore, PipelineJob};
use common::telemetry::TelemetrySink;
use source_adapters::params::SourceParams;

use self::stages::{ChunkStage, CleanStage, EmbedStage, FetchStage, StageError, StoreStage};

/// Result summary of a finished pipeline run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub status: JobStatus,
    pub documents_stored: usize,
    pub chunks_created: usize,
    pub embeddings_generated: usize,
    pub duration_ms: u64,
    pub stages_completed: Vec<String>,
}

/// Drives one job through fetch → clean → chunk → embed → store, writing
/// job status at every boundary.
///
/// Cancellation is cooperative: a running stage always finishes, and the
/// orchestrator observes a `cancelled` status at the next boundary and
/// stops without overwriting it.
pub struct PipelineOrchestrator {
    fetch_stage: FetchStage,
    clean_stage: CleanStage,
    chunk_stage: ChunkStage,
    embed_stage: EmbedStage,
    store_stage: StoreStage,
    job_store: JobStore,
    telemetry: TelemetrySink,
}

impl PipelineOrchestrator {
    pub fn new(
        fetch_stage: FetchStage,
        clean_stage: CleanStage,
        chunk_stage: ChunkStage,
        embed_stage: EmbedStage,
        store_stage: StoreStage,
        job_store: JobStore,
        telemetry: TelemetrySink,
    ) -> Self {
        Self {
            fetch_stage,
            clean_stage,
            chunk_stage,
            embed_stage,
            store_stage,
            job_store,
            telemetry,
        }
    }

    #[instrument(
        skip_all,
        fields(
            job_id = %job.id,
            correlation_id = %job.correlation_id,
            source = %job.source_kind
        )
    )]
    pub async fn run(&self, job: &PipelineJob) -> Result<PipelineOutcome, AppError> {
        let started = Instant::now();
        let params = SourceParams::new(job.source_params.clone());
        let tenant = job.tenant_id.as_deref();
        let scheduled = params.get_bool("scheduled").unwrap_or(false);

        info!("starting pipeline job");
        self.telemetry
            .emit_job_started(
                &job.id,
                job.source_kind.as_str(),
                &job.correlation_id,
                scheduled,
                tenant,
                None,
            )
            .await;

        let mut stages_completed: Vec<String> = Vec::new();

        // Stage 1: fetch
        if self.cancelled(&job.id).await? {
            return Ok(self.cancelled_outcome(started, stages_completed));
        }
        self.job_store
            .update_status(&job.id, JobStatus::Fetching)
            .await?;
        let raw_documents = match self
            .fetch_stage
            .execute(
                job.source_kind,
                &params,
                &job.id,
                &job.correlation_id,
                tenant,
            )
            .await
        {
            Ok(documents) => documents,
            Err(err) => return self.fail(job, &err, started).await,
        };
        self.record_stage(&job.id, "fetch", &mut stages_completed)
            .await?;
        info!(documents = raw_documents.len(), "stage 1/5 complete");

        // Stage 2: clean
        if self.cancelled(&job.id).await? {
            return Ok(self.cancelled_outcome(started, stages_completed));
        }
        self.job_store
            .update_status(&job.id, JobStatus::Cleaning)
            .await?;
        let cleaned_documents = match self
            .clean_stage
            .execute(raw_documents, &job.id, &job.correlation_id, tenant)
            .await
        {
            Ok(documents) => documents,
            Err(err) => return self.fail(job, &err, started).await,
        };
        self.record_stage(&job.id, "clean", &mut stages_completed)
            .await?;
        info!(documents = cleaned_documents.len(), "stage 2/5 complete");

        // Stage 3: chunk
        if self.cancelled(&job.id).await? {
            return Ok(self.cancelled_outcome(started, stages_completed));
        }
        self.job_store
            .update_status(&job.id, JobStatus::Chunking)
            .await?;
        let chunks = match self
            .chunk_stage
            .execute(&cleaned_documents, &job.id, &job.correlation_id, tenant)
            .await
        {
            Ok(chunks) => chunks,
            Err(err) => return self.fail(job, &err, started).await,
        };
        self.record_stage(&job.id, "chunk", &mut stages_completed)
            .await?;
        info!(chunks = chunks.len(), "stage 3/5 complete");

        // Stage 4: embed
        if self.cancelled(&job.id).await? {
            return Ok(self.cancelled_outcome(started, stages_completed));
        }
        self.job_store
            .update_status(&job.id, JobStatus::Embedding)
            .await?;
        let embeddings = match self
            .embed_stage
            .execute(
                &chunks,
                job.source_kind.as_str(),
                &job.id,
                &job.correlation_id,
                tenant,
            )
            .await
        {
            Ok(embeddings) => embeddings,
            Err(err) => return self.fail(job, &err, started).await,
        };
        self.record_stage(&job.id, "embed", &mut stages_completed)
            .await?;
        info!(embeddings = embeddings.len(), "stage 4/5 complete");

        // Stage 5: store
        if self.cancelled(&job.id).await? {
            return Ok(self.cancelled_outcome(started, stages_completed));
        }
        self.job_store
            .update_status(&job.id, JobStatus::Storing)
            .await?;
        let source_url = params.get_str("file_path").or_else(|| params.get_str("url"));
        let stored_documents = match self
            .store_stage
            .execute(
                &embeddings,
                job.source_kind,
                source_url,
                &job.id,
                &job.correlation_id,
                tenant,
            )
            .await
        {
            Ok(documents) => documents,
            Err(err) => return self.fail(job, &err, started).await,
        };
        self.record_stage(&job.id, "store", &mut stages_completed)
            .await?;
        info!(documents = stored_documents.len(), "stage 5/5 complete");

        // Pipeline complete
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        self.job_store
            .update(
                &job.id,
                JobPatch {
                    status: Some(JobStatus::Completed),
                    completed_at: Some(chrono::Utc::now()),
                    duration_ms: Some(duration_ms),
                    documents_stored: Some(stored_documents.len()),
                    chunks_created: Some(chunks.len()),
                    embeddings_generated: Some(embeddings.len()),
                    ..JobPatch::default()
                },
            )
            .await?;

        let mut completion_metadata = JsonMap::new();
        completion_metadata.insert(
            "documents_stored".to_string(),
            json!(stored_documents.len()),
        );
        completion_metadata.insert(
            "stages_completed".to_string(),
            json!(stages_completed.clone()),
        );

        self.telemetry
            .emit_job_completed(
                &job.id,
                job.source_kind.as_str(),
                &job.correlation_id,
                duration_ms as f64,
                chunks.len(),
                embeddings.len(),
                tenant,
                Some(completion_metadata),
            )
            .await;

        info!(duration_ms, "pipeline completed successfully");

        Ok(PipelineOutcome {
            status: JobStatus::Completed,
            documents_stored: stored_documents.len(),
            chunks_created: chunks.len(),
            embeddings_generated: embeddings.len(),
            duration_ms,
            stages_completed,
        })
    }

    async fn cancelled(&self, job_id: &str) -> Result<bool, AppError> {
        let job = self.job_store.get(job_id).await?;
        Ok(job.is_some_and(|j| j.status == JobStatus::Cancelled))
    }

    fn cancelled_outcome(&self, started: Instant, stages_completed: Vec<String>) -> PipelineOutcome {
        info!("job cancelled, stopping at stage boundary");
        PipelineOutcome {
            status: JobStatus::Cancelled,
            documents_stored: 0,
            chunks_created: 0,
            embeddings_generated: 0,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            stages_completed,
        }
    }

    async fn record_stage(
        &self,
        job_id: &str,
        stage: &str,
        stages_completed: &mut Vec<String>,
    ) -> Result<(), AppError> {
        stages_completed.push(stage.to_string());
        self.job_store.append_stage(job_id, stage).await
    }

    /// Stage failure: the stage already emitted its own `job_failed`
    /// event, so only the job row is updated here.
    async fn fail(
        &self,
        job: &PipelineJob,
        err: &StageError,
        started: Instant,
    ) -> Result<PipelineOutcome, AppError> {
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let patch = JobPatch {
            status: Some(JobStatus::Failed),
            completed_at: Some(chrono::Utc::now()),
            duration_ms: Some(duration_ms),
            error_message: Some(err.to_string()),
            ..JobPatch::default()
        };

        if let Err(update_err) = self.job_store.update(&job.id, patch).await {
            // A concurrent cancellation may have made the job terminal
            warn!(
                job_id = %job.id,
                error = %update_err,
                "failed to mark job as failed"
            );
        }

        warn!(
            job_id = %job.id,
            stage = err.stage,
            error = %err,
            "pipeline failed"
        );

        Err(AppError::Processing(err.to_string()))
    }
}

#[cfg(test)]
mod tests;
