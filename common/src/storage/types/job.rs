use std::sync::Arc;

use surrealdb::opt::PatchOp;
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

use super::document::{JsonMap, SourceKind};

/// Job lifecycle. Non-terminal statuses correspond 1:1 to the stage
/// currently running. Terminal statuses never transition again.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Fetching,
    Cleaning,
    Chunking,
    Embedding,
    Storing,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fetching => "fetching",
            Self::Cleaning => "cleaning",
            Self::Chunking => "chunking",
            Self::Embedding => "embedding",
            Self::Storing => "storing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Result<Self, AppError> {
        match s {
            "pending" => Ok(Self::Pending),
            "fetching" => Ok(Self::Fetching),
            "cleaning" => Ok(Self::Cleaning),
            "chunking" => Ok(Self::Chunking),
            "embedding" => Ok(Self::Embedding),
            "storing" => Ok(Self::Storing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(AppError::Validation(format!("unknown job status: {other}"))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

stored_object!(PipelineJob, "job", {
    correlation_id: String,
    source_kind: SourceKind,
    status: JobStatus,
    tenant_id: Option<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    completed_at: Option<DateTime<Utc>>,
    duration_ms: Option<u64>,
    documents_stored: Option<usize>,
    chunks_created: Option<usize>,
    embeddings_generated: Option<usize>,
    error_message: Option<String>,
    stages_completed: Vec<String>,
    source_params: JsonMap
});

impl PipelineJob {
    pub fn new(
        source_kind: SourceKind,
        correlation_id: String,
        tenant_id: Option<String>,
        source_params: JsonMap,
    ) -> Self {
        let now = Utc::now();
        let hex = Uuid::new_v4().simple().to_string();

        Self {
            id: format!("job-{}", &hex[..12]),
            created_at: now,
            updated_at: now,
            correlation_id,
            source_kind,
            status: JobStatus::Pending,
            tenant_id,
            completed_at: None,
            duration_ms: None,
            documents_stored: None,
            chunks_created: None,
            embeddings_generated: None,
            error_message: None,
            stages_completed: Vec::new(),
            source_params,
        }
    }
}

/// Hand-off seam between the HTTP surface and the background executor.
/// The API layer persists a job and forwards it here; execution happens
/// off the request path.
pub trait JobSubmitter: Send + Sync {
    fn submit(&self, job: PipelineJob);
}

/// Partial update applied by [`JobStore::update`]. Unset fields are left
/// untouched.
#[derive(Debug, Default, Clone)]
pub struct JobPatch {
    pub status: Option<JobStatus>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub documents_stored: Option<usize>,
    pub chunks_created: Option<usize>,
    pub embeddings_generated: Option<usize>,
    pub error_message: Option<String>,
    pub stages_completed: Option<Vec<String>>,
}

/// Outcome of a client-initiated cancellation.
#[derive(Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    AlreadyTerminal(JobStatus),
}

/// Persistent job table. Every operation is its own commit; sessions live
/// only for the duration of the call.
#[derive(Clone)]
pub struct JobStore {
    db: Arc<SurrealDbClient>,
}

#[derive(Deserialize)]
struct CountRow {
    total: usize,
}

impl JobStore {
    pub fn new(db: Arc<SurrealDbClient>) -> Self {
        Self { db }
    }

    pub async fn create(&self, job: PipelineJob) -> Result<PipelineJob, AppError> {
        let stored = self.db.store_item(job).await?;
        stored.ok_or_else(|| {
            AppError::InternalError("job row was not returned on create".to_string())
        })
    }

    pub async fn get(&self, job_id: &str) -> Result<Option<PipelineJob>, AppError> {
        Ok(self.db.get_item::<PipelineJob>(job_id).await?)
    }

    /// Apply a partial update. Returns the updated row, or `None` when the
    /// job does not exist. Transitions out of a terminal status are
    /// rejected.
    pub async fn update(
        &self,
        job_id: &str,
        patch: JobPatch,
    ) -> Result<Option<PipelineJob>, AppError> {
        let Some(current) = self.get(job_id).await? else {
            return Ok(None);
        };

        if let Some(next) = patch.status {
            if current.status.is_terminal() && next != current.status {
                return Err(AppError::IllegalState(format!(
                    "job {job_id} is {} and cannot transition to {next}",
                    current.status
                )));
            }
        }

        let mut update = self
            .db
            .update((PipelineJob::table_name(), job_id))
            .patch(PatchOp::replace(
                "/updated_at",
                surrealdb::sql::Datetime::default(),
            ));

        if let Some(status) = patch.status {
            update = update.patch(PatchOp::replace("/status", status));
        }
        if let Some(completed_at) = patch.completed_at {
            update = update.patch(PatchOp::replace(
                "/completed_at",
                surrealdb::sql::Datetime::from(completed_at),
            ));
        }
        if let Some(duration_ms) = patch.duration_ms {
            update = update.patch(PatchOp::replace("/duration_ms", duration_ms));
        }
        if let Some(documents_stored) = patch.documents_stored {
            update = update.patch(PatchOp::replace("/documents_stored", documents_stored));
        }
        if let Some(chunks_created) = patch.chunks_created {
            update = update.patch(PatchOp::replace("/chunks_created", chunks_created));
        }
        if let Some(embeddings_generated) = patch.embeddings_generated {
            update = update.patch(PatchOp::replace(
                "/embeddings_generated",
                embeddings_generated,
            ));
        }
        if let Some(error_message) = patch.error_message {
            update = update.patch(PatchOp::replace("/error_message", error_message));
        }
        if let Some(stages_completed) = patch.stages_completed {
            update = update.patch(PatchOp::replace("/stages_completed", stages_completed));
        }

        let updated: Option<PipelineJob> = update.await?;
        Ok(updated)
    }

    /// Move the job into the status of the stage about to run.
    pub async fn update_status(
        &self,
        job_id: &str,
        status: JobStatus,
    ) -> Result<Option<PipelineJob>, AppError> {
        self.update(
            job_id,
            JobPatch {
                status: Some(status),
                ..JobPatch::default()
            },
        )
        .await
    }

    /// Append a stage name after the stage finished. Read-modify-write is
    /// fine here: a job is only ever advanced by its single orchestrator
    /// task.
    pub async fn append_stage(&self, job_id: &str, stage: &str) -> Result<(), AppError> {
        let Some(current) = self.get(job_id).await? else {
            return Err(AppError::NotFound(format!("job {job_id}")));
        };

        let mut stages = current.stages_completed;
        stages.push(stage.to_string());

        self.update(
            job_id,
            JobPatch {
                stages_completed: Some(stages),
                ..JobPatch::default()
            },
        )
        .await?;

        Ok(())
    }

    /// Paginated listing ordered by `created_at DESC`, returning the rows
    /// plus the total count matching the filters.
    pub async fn list(
        &self,
        tenant_id: Option<&str>,
        status: Option<JobStatus>,
        page: usize,
        page_size: usize,
    ) -> Result<(Vec<PipelineJob>, usize), AppError> {
        if page == 0 {
            return Err(AppError::Validation("page must be >= 1".to_string()));
        }
        if !(1..=100).contains(&page_size) {
            return Err(AppError::Validation(
                "page_size must be in 1..=100".to_string(),
            ));
        }

        let mut conditions: Vec<&str> = Vec::new();
        if tenant_id.is_some() {
            conditions.push("tenant_id = $tenant_id");
        }
        if status.is_some() {
            conditions.push("status = $status");
        }
        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", conditions.join(" AND "))
        };

        let select = format!(
            "SELECT * FROM {table}{where_clause} ORDER BY created_at DESC LIMIT $limit START $start",
            table = PipelineJob::table_name(),
        );
        let count = format!(
            "SELECT count() AS total FROM {table}{where_clause} GROUP ALL",
            table = PipelineJob::table_name(),
        );

        let start = page
            .saturating_sub(1)
            .saturating_mul(page_size);

        let mut query = self
            .db
            .query(select)
            .query(count)
            .bind(("limit", page_size as i64))
            .bind(("start", start as i64));
        if let Some(tenant) = tenant_id {
            query = query.bind(("tenant_id", tenant.to_string()));
        }
        if let Some(status) = status {
            query = query.bind(("status", status));
        }

        let mut response = query.await?;
        let jobs: Vec<PipelineJob> = response.take(0)?;
        let counts: Vec<CountRow> = response.take(1)?;
        let total = counts.first().map_or(0, |row| row.total);

        Ok((jobs, total))
    }

    pub async fn delete(&self, job_id: &str) -> Result<bool, AppError> {
        let deleted = self.db.delete_item::<PipelineJob>(job_id).await?;
        Ok(deleted.is_some())
    }

    /// Jobs that are neither completed, failed nor cancelled.
    pub async fn get_active(
        &self,
        tenant_id: Option<&str>,
    ) -> Result<Vec<PipelineJob>, AppError> {
        let tenant_clause = if tenant_id.is_some() {
            " AND tenant_id = $tenant_id"
        } else {
            ""
        };
        let sql = format!(
            "SELECT * FROM {table} WHERE status NOT IN ['completed', 'failed', 'cancelled']{tenant_clause} ORDER BY created_at ASC",
            table = PipelineJob::table_name(),
        );

        let mut query = self.db.query(sql);
        if let Some(tenant) = tenant_id {
            query = query.bind(("tenant_id", tenant.to_string()));
        }

        let jobs: Vec<PipelineJob> = query.await?.take(0)?;
        Ok(jobs)
    }

    /// Client-initiated cancellation. Permitted from any non-terminal
    /// status; the running stage is not interrupted — the orchestrator
    /// observes the status at the next stage boundary.
    pub async fn cancel(&self, job_id: &str) -> Result<CancelOutcome, AppError> {
        let Some(current) = self.get(job_id).await? else {
            return Ok(CancelOutcome::NotFound);
        };

        match current.status {
            JobStatus::Completed | JobStatus::Failed => {
                Ok(CancelOutcome::AlreadyTerminal(current.status))
            }
            JobStatus::Cancelled => Ok(CancelOutcome::Cancelled),
            _ => {
                self.update(
                    job_id,
                    JobPatch {
                        status: Some(JobStatus::Cancelled),
                        completed_at: Some(Utc::now()),
                        ..JobPatch::default()
                    },
                )
                .await?;
                Ok(CancelOutcome::Cancelled)
            }
        }
    }

    pub async fn health_check(&self) -> bool {
        self.db.health_check().await
    }
}
