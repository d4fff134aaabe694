use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Extension, Json,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use common::storage::types::document::{JsonMap, SourceKind};
use common::storage::types::job::{CancelOutcome, JobStatus, PipelineJob};

use crate::api_state::ApiState;
use crate::error::ApiError;
use crate::middleware_correlation::CorrelationId;

#[derive(Deserialize)]
pub struct SubmitJobRequest {
    pub source: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Everything else in the body travels to the adapter untouched
    /// (file_path, url, connection_string, ...).
    #[serde(flatten)]
    pub params: JsonMap,
}

#[derive(Serialize)]
pub struct JobResponse {
    pub job_id: String,
    pub correlation_id: String,
    pub source: String,
    pub status: JobStatus,
    pub tenant_id: Option<String>,
    pub created_at: String,
    pub completed_at: Option<String>,
    pub duration_ms: Option<u64>,
    pub documents_stored: Option<usize>,
    pub chunks_created: Option<usize>,
    pub embeddings_generated: Option<usize>,
    pub error_message: Option<String>,
    pub stages_completed: Vec<String>,
}

impl From<PipelineJob> for JobResponse {
    fn from(job: PipelineJob) -> Self {
        Self {
            job_id: job.id,
            correlation_id: job.correlation_id,
            source: job.source_kind.to_string(),
            status: job.status,
            tenant_id: job.tenant_id,
            created_at: job.created_at.to_rfc3339(),
            completed_at: job.completed_at.map(|t| t.to_rfc3339()),
            duration_ms: job.duration_ms,
            documents_stored: job.documents_stored,
            chunks_created: job.chunks_created,
            embeddings_generated: job.embeddings_generated,
            error_message: job.error_message,
            stages_completed: job.stages_completed,
        }
    }
}

#[derive(Serialize)]
pub struct JobListResponse {
    pub jobs: Vec<JobResponse>,
    pub total: usize,
    pub page: usize,
    pub page_size: usize,
}

#[derive(Deserialize)]
pub struct ListJobsQuery {
    pub tenant_id: Option<String>,
    pub status: Option<String>,
    #[serde(default = "default_page")]
    pub page: usize,
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

fn default_page() -> usize {
    1
}

fn default_page_size() -> usize {
    20
}

/// Submission gate: the per-source parameters the pipeline cannot start
/// without. Everything finer-grained is validated at stage entry.
fn validate_submission(source_kind: SourceKind, params: &JsonMap) -> Result<(), String> {
    let has_str = |key: &str| {
        params
            .get(key)
            .and_then(|v| v.as_str())
            .is_some_and(|v| !v.is_empty())
    };

    match source_kind {
        SourceKind::FileUpload if !has_str("file_path") => {
            Err("'file_path' is required for file_upload jobs".to_string())
        }
        SourceKind::UrlScrape if !has_str("url") && !has_str("sitemap_url") => {
            Err("'url' is required for url_scrape jobs".to_string())
        }
        _ => Ok(()),
    }
}

pub async fn submit_job(
    State(state): State<ApiState>,
    Extension(correlation): Extension<CorrelationId>,
    Json(body): Json<SubmitJobRequest>,
) -> Result<(StatusCode, Json<JobResponse>), ApiError> {
    let source_kind: SourceKind = body
        .source
        .parse()
        .map_err(|_| ApiError::validation(format!("unknown source: {}", body.source), &correlation.0))?;

    validate_submission(source_kind, &body.params)
        .map_err(|message| ApiError::validation(message, &correlation.0))?;

    let job = PipelineJob::new(
        source_kind,
        correlation.0.clone(),
        body.tenant_id,
        body.params,
    );

    let job = state
        .job_store
        .create(job)
        .await
        .map_err(|e| ApiError::from_app(e, &correlation.0, state.config.environment))?;

    info!(
        job_id = %job.id,
        correlation_id = %correlation.0,
        source = %job.source_kind,
        "job accepted"
    );

    state.submitter.submit(job.clone());

    Ok((StatusCode::ACCEPTED, Json(JobResponse::from(job))))
}

pub async fn get_job(
    State(state): State<ApiState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(job_id): Path<String>,
) -> Result<Json<JobResponse>, ApiError> {
    let job = state
        .job_store
        .get(&job_id)
        .await
        .map_err(|e| ApiError::from_app(e, &correlation.0, state.config.environment))?
        .ok_or_else(|| ApiError::not_found(format!("job {job_id} not found"), &correlation.0))?;

    Ok(Json(JobResponse::from(job)))
}

pub async fn list_jobs(
    State(state): State<ApiState>,
    Extension(correlation): Extension<CorrelationId>,
    Query(query): Query<ListJobsQuery>,
) -> Result<Json<JobListResponse>, ApiError> {
    let status = query
        .status
        .as_deref()
        .map(JobStatus::parse)
        .transpose()
        .map_err(|e| ApiError::from_app(e, &correlation.0, state.config.environment))?;

    let (jobs, total) = state
        .job_store
        .list(
            query.tenant_id.as_deref(),
            status,
            query.page,
            query.page_size,
        )
        .await
        .map_err(|e| ApiError::from_app(e, &correlation.0, state.config.environment))?;

    Ok(Json(JobListResponse {
        jobs: jobs.into_iter().map(JobResponse::from).collect(),
        total,
        page: query.page,
        page_size: query.page_size,
    }))
}

/// DELETE /jobs/{id} cancels the job. Cancellation is cooperative: a
/// running stage finishes before the orchestrator notices.
pub async fn cancel_job(
    State(state): State<ApiState>,
    Extension(correlation): Extension<CorrelationId>,
    Path(job_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    let outcome = state
        .job_store
        .cancel(&job_id)
        .await
        .map_err(|e| ApiError::from_app(e, &correlation.0, state.config.environment))?;

    match outcome {
        CancelOutcome::Cancelled => {
            info!(job_id = %job_id, correlation_id = %correlation.0, "job cancelled");
            Ok(StatusCode::NO_CONTENT)
        }
        CancelOutcome::NotFound => Err(ApiError::not_found(
            format!("job {job_id} not found"),
            &correlation.0,
        )),
        CancelOutcome::AlreadyTerminal(status) => Err(ApiError::conflict(
            format!("job {job_id} is already {status} and cannot be cancelled"),
            &correlation.0,
        )),
    }
}
