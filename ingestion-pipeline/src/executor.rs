use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

use common::error::AppError;
use common::storage::types::job::{JobPatch, JobStatus, JobStore, JobSubmitter, PipelineJob};

use crate::pipeline::PipelineOrchestrator;

/// Runs accepted jobs off the request path, at most `max_workers`
/// concurrently. Durability comes from the job table, not from this
/// process: submissions are fire-and-forget.
pub struct JobExecutor {
    orchestrator: Arc<PipelineOrchestrator>,
    job_store: JobStore,
    permits: Arc<Semaphore>,
}

impl JobExecutor {
    pub fn new(
        orchestrator: Arc<PipelineOrchestrator>,
        job_store: JobStore,
        max_workers: usize,
    ) -> Self {
        Self {
            orchestrator,
            job_store,
            permits: Arc::new(Semaphore::new(max_workers.clamp(1, 32))),
        }
    }

    /// Queue a job the API layer already persisted. Returns immediately;
    /// the pipeline runs on a background task once a worker is free.
    pub fn submit(&self, job: PipelineJob) {
        let orchestrator = Arc::clone(&self.orchestrator);
        let permits = Arc::clone(&self.permits);
        let job_id = job.id.clone();

        tokio::spawn(async move {
            let Ok(_permit) = permits.acquire().await else {
                // Semaphore closed: the process is shutting down
                warn!(%job_id, "executor shut down before job could run");
                return;
            };

            match orchestrator.run(&job).await {
                Ok(outcome) => {
                    info!(
                        %job_id,
                        status = %outcome.status,
                        duration_ms = outcome.duration_ms,
                        "job finished"
                    );
                }
                Err(err) => {
                    error!(%job_id, error = %err, "job failed");
                }
            }
        });
    }

    /// Startup recovery: jobs left in a non-terminal status by a previous
    /// process are marked failed rather than re-run.
    pub async fn recover_interrupted(&self) -> Result<usize, AppError> {
        let active = self.job_store.get_active(None).await?;
        let count = active.len();

        for job in active {
            warn!(
                job_id = %job.id,
                status = %job.status,
                "marking job interrupted by restart as failed"
            );

            let result = self
                .job_store
                .update(
                    &job.id,
                    JobPatch {
                        status: Some(JobStatus::Failed),
                        completed_at: Some(Utc::now()),
                        error_message: Some("interrupted by service restart".to_string()),
                        ..JobPatch::default()
                    },
                )
                .await;

            if let Err(err) = result {
                error!(job_id = %job.id, error = %err, "failed to mark interrupted job");
            }
        }

        if count > 0 {
            info!(recovered = count, "interrupted jobs marked as failed");
        }

        Ok(count)
    }
}

impl JobSubmitter for JobExecutor {
    fn submit(&self, job: PipelineJob) {
        JobExecutor::submit(self, job);
    }
}

// Exercised end-to-end in pipeline::tests alongside the orchestrator.
