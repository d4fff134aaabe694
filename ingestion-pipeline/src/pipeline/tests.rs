use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use uuid::Uuid;

use common::error::AppError;
use common::storage::db::SurrealDbClient;
use common::storage::types::document::{Embedding, JsonMap, SourceKind, StoredDocument};
use common::storage::types::job::{JobStatus, JobStore, PipelineJob};
use common::storage::vector_store::VectorStore;
use common::telemetry::{EventType, TelemetryEvent, TelemetrySink};
use common::utils::config::{AppConfig, RuntimeEnvironment};
use common::utils::embedding::EmbeddingBackend;
use common::utils::retry::RetryPolicy;
use source_adapters::AdapterRegistry;

use crate::chunking::{ChunkingConfig, ChunkingStrategy};
use crate::pipeline::stages::{
    ChunkStage, ChunkingEngine, CleanConfig, CleanStage, EmbedStage, FetchStage, StoreStage,
};
use crate::pipeline::PipelineOrchestrator;

fn test_config() -> AppConfig {
    AppConfig {
        environment: RuntimeEnvironment::Development,
        rake_port: 8002,
        surrealdb_address: "mem://".to_string(),
        surrealdb_username: "root".to_string(),
        surrealdb_password: "root".to_string(),
        surrealdb_namespace: "rake".to_string(),
        surrealdb_database: "rake".to_string(),
        openai_api_key: String::new(),
        openai_base_url: "https://api.openai.com/v1".to_string(),
        openai_embedding_model: "text-embedding-3-small".to_string(),
        openai_batch_size: 100,
        vector_store_base_url: "http://localhost:8001".to_string(),
        vector_store_timeout_secs: 30,
        max_workers: 4,
        retry_attempts: 3,
        retry_delay: 1.0,
        retry_backoff: 2.0,
        chunk_size: 500,
        chunk_overlap: 50,
        chunk_strategy: "token_based".to_string(),
        sec_edgar_user_agent: None,
        sec_edgar_rate_limit: 0.1,
        url_scrape_rate_limit: 1.0,
        url_scrape_respect_robots: true,
        db_query_read_only: true,
        scheduler_enabled: false,
    }
}

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(1),
        multiplier: 2.0,
        max_delay: Duration::from_millis(5),
    }
}

/// Embedding backend that fails a configurable number of calls with a
/// rate-limit error before succeeding.
struct FlakyEmbedder {
    dimension: usize,
    failures_remaining: AtomicUsize,
}

impl FlakyEmbedder {
    fn reliable(dimension: usize) -> Self {
        Self {
            dimension,
            failures_remaining: AtomicUsize::new(0),
        }
    }

    fn failing_once(dimension: usize) -> Self {
        Self {
            dimension,
            failures_remaining: AtomicUsize::new(1),
        }
    }
}

#[async_trait]
impl EmbeddingBackend for FlakyEmbedder {
    fn model(&self) -> &str {
        "test-embedding"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        if self
            .failures_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(AppError::OpenAI(async_openai::error::OpenAIError::ApiError(
                async_openai::error::ApiError {
                    message: "Rate limit exceeded, retry later".to_string(),
                    r#type: None,
                    param: None,
                    code: None,
                },
            )));
        }

        Ok(inputs.iter().map(|_| vec![0.25; self.dimension]).collect())
    }
}

#[derive(Default)]
struct RecordingStore {
    embeddings: Mutex<Vec<Embedding>>,
    documents: Mutex<Vec<StoredDocument>>,
}

#[async_trait]
impl VectorStore for RecordingStore {
    async fn store_embeddings(
        &self,
        embeddings: &[Embedding],
        _correlation_id: &str,
    ) -> Result<serde_json::Value, AppError> {
        self.embeddings.lock().unwrap().extend_from_slice(embeddings);
        Ok(json!({"accepted": embeddings.len()}))
    }

    async fn store_document(
        &self,
        document: &StoredDocument,
        _correlation_id: &str,
    ) -> Result<(), AppError> {
        self.documents.lock().unwrap().push(document.clone());
        Ok(())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

struct Harness {
    orchestrator: PipelineOrchestrator,
    job_store: JobStore,
    db: Arc<SurrealDbClient>,
    vector_store: Arc<RecordingStore>,
}

async fn harness(embedder: FlakyEmbedder) -> Harness {
    let db = Arc::new(
        SurrealDbClient::memory("pipeline_test", &Uuid::new_v4().to_string())
            .await
            .expect("memory db"),
    );
    db.ensure_initialized().await.expect("indexes");

    let telemetry = TelemetrySink::new(Arc::clone(&db), true);
    let job_store = JobStore::new(Arc::clone(&db));
    let registry = Arc::new(AdapterRegistry::from_config(&test_config()).expect("registry"));
    let vector_store = Arc::new(RecordingStore::default());

    let chunking = ChunkingConfig {
        chunk_size: 100,
        chunk_overlap: 10,
        strategy: ChunkingStrategy::TokenBased,
        min_chunk_size: 1,
        ..ChunkingConfig::default()
    };

    let orchestrator = PipelineOrchestrator::new(
        FetchStage::new(registry, fast_policy(), telemetry.clone()),
        CleanStage::new(CleanConfig::default(), telemetry.clone()).expect("clean stage"),
        ChunkStage::new(
            ChunkingEngine::token_budget(chunking).expect("chunking engine"),
            telemetry.clone(),
        ),
        EmbedStage::new(
            Arc::new(embedder),
            100,
            fast_policy(),
            telemetry.clone(),
        ),
        StoreStage::new(
            Arc::clone(&vector_store) as Arc<dyn VectorStore>,
            telemetry.clone(),
        ),
        job_store.clone(),
        telemetry,
    );

    Harness {
        orchestrator,
        job_store,
        db,
        vector_store,
    }
}

fn file_job(path: &str) -> PipelineJob {
    let mut params = JsonMap::new();
    params.insert("file_path".to_string(), json!(path));
    PipelineJob::new(
        SourceKind::FileUpload,
        Uuid::new_v4().to_string(),
        Some("t1".to_string()),
        params,
    )
}

fn temp_text_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(".txt")
        .tempfile()
        .expect("temp file");
    file.write_all(contents.as_bytes()).expect("write");
    file
}

async fn events_of_type(db: &SurrealDbClient, event_type: EventType) -> Vec<TelemetryEvent> {
    let events: Vec<TelemetryEvent> = db.client.select("events").await.expect("select events");
    events
        .into_iter()
        .filter(|e| e.event_type == event_type)
        .collect()
}

#[tokio::test]
async fn happy_path_file_upload_completes_all_stages() {
    let harness = harness(FlakyEmbedder::reliable(8)).await;
    let file = temp_text_file("Hello world. This is a test document with enough words to chunk.");

    let job = file_job(file.path().to_str().unwrap());
    let job_id = job.id.clone();
    harness.job_store.create(job.clone()).await.expect("create job");

    let outcome = harness.orchestrator.run(&job).await.expect("pipeline run");

    assert_eq!(outcome.status, JobStatus::Completed);
    assert!(outcome.chunks_created >= 1);
    assert_eq!(outcome.embeddings_generated, outcome.chunks_created);
    assert_eq!(
        outcome.stages_completed,
        vec!["fetch", "clean", "chunk", "embed", "store"]
    );

    let stored_job = harness.job_store.get(&job_id).await.unwrap().unwrap();
    assert_eq!(stored_job.status, JobStatus::Completed);
    assert!(stored_job.completed_at.is_some());
    assert_eq!(
        stored_job.stages_completed,
        vec!["fetch", "clean", "chunk", "embed", "store"]
    );
    assert_eq!(stored_job.chunks_created, Some(outcome.chunks_created));
    assert_eq!(stored_job.documents_stored, Some(1));

    // All five phases plus start and completion were observed
    assert_eq!(
        events_of_type(&harness.db, EventType::PhaseCompleted).await.len(),
        5
    );
    assert_eq!(
        events_of_type(&harness.db, EventType::JobStarted).await.len(),
        1
    );
    assert_eq!(
        events_of_type(&harness.db, EventType::IngestionComplete)
            .await
            .len(),
        1
    );

    // Embeddings reached the vector store
    assert_eq!(
        harness.vector_store.embeddings.lock().unwrap().len(),
        outcome.embeddings_generated
    );
    assert_eq!(harness.vector_store.documents.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn transient_embed_failure_is_retried_and_job_completes() {
    let harness = harness(FlakyEmbedder::failing_once(8)).await;
    let file = temp_text_file("Retry path document. It should survive one rate limit response.");

    let job = file_job(file.path().to_str().unwrap());
    harness.job_store.create(job.clone()).await.expect("create job");

    let outcome = harness.orchestrator.run(&job).await.expect("pipeline run");
    assert_eq!(outcome.status, JobStatus::Completed);

    let retries = events_of_type(&harness.db, EventType::RetryAttempt).await;
    assert_eq!(retries.len(), 1);
    let retry = &retries[0];
    assert_eq!(retry.metrics.get("attempt_number"), Some(&1.0));
    assert_eq!(retry.metrics.get("max_attempts"), Some(&3.0));
    assert_eq!(
        retry.metadata.get("stage").and_then(|v| v.as_str()),
        Some("embed")
    );
}

#[tokio::test]
async fn fetch_failure_fails_job_with_empty_stages() {
    let harness = harness(FlakyEmbedder::reliable(8)).await;

    let job = file_job("/nonexistent/path/missing.txt");
    let job_id = job.id.clone();
    harness.job_store.create(job.clone()).await.expect("create job");

    let result = harness.orchestrator.run(&job).await;
    assert!(result.is_err());

    let stored_job = harness.job_store.get(&job_id).await.unwrap().unwrap();
    assert_eq!(stored_job.status, JobStatus::Failed);
    assert!(stored_job
        .error_message
        .as_deref()
        .is_some_and(|m| !m.is_empty()));
    assert!(stored_job.stages_completed.is_empty());
    assert!(stored_job.completed_at.is_some());

    let failures = events_of_type(&harness.db, EventType::JobFailed).await;
    assert_eq!(failures.len(), 1);
    assert_eq!(
        failures[0].metadata.get("failed_stage").and_then(|v| v.as_str()),
        Some("fetch")
    );
}

#[tokio::test]
async fn executor_runs_submitted_job_to_completion() {
    let harness = harness(FlakyEmbedder::reliable(8)).await;
    let file = temp_text_file("Executor path document. Submitted jobs run in the background.");

    let job = file_job(file.path().to_str().unwrap());
    let job_id = job.id.clone();
    harness.job_store.create(job.clone()).await.expect("create job");

    let executor = crate::executor::JobExecutor::new(
        Arc::new(harness.orchestrator),
        harness.job_store.clone(),
        2,
    );
    executor.submit(job);

    // Poll until the background task reaches a terminal status
    let mut status = JobStatus::Pending;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        status = harness
            .job_store
            .get(&job_id)
            .await
            .expect("get")
            .expect("job exists")
            .status;
        if status.is_terminal() {
            break;
        }
    }

    assert_eq!(status, JobStatus::Completed);
}

#[tokio::test]
async fn executor_recovery_marks_interrupted_jobs_failed() {
    let harness = harness(FlakyEmbedder::reliable(8)).await;

    let mut interrupted = file_job("/tmp/whatever.txt");
    interrupted.status = JobStatus::Embedding;
    let interrupted_id = interrupted.id.clone();
    harness
        .job_store
        .create(interrupted)
        .await
        .expect("create interrupted");

    let executor = crate::executor::JobExecutor::new(
        Arc::new(harness.orchestrator),
        harness.job_store.clone(),
        2,
    );

    let recovered = executor.recover_interrupted().await.expect("recover");
    assert_eq!(recovered, 1);

    let job = harness
        .job_store
        .get(&interrupted_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(
        job.error_message.as_deref(),
        Some("interrupted by service restart")
    );
    assert!(job.completed_at.is_some());
}

#[tokio::test]
async fn scheduler_entry_bookkeeping() {
    use crate::scheduler::{JobScheduler, ScheduleSpec, ScheduledJobSpec};

    let harness = harness(FlakyEmbedder::reliable(8)).await;
    let executor = Arc::new(crate::executor::JobExecutor::new(
        Arc::new(harness.orchestrator),
        harness.job_store.clone(),
        1,
    ));
    let scheduler = JobScheduler::new(executor, harness.job_store.clone());

    // A one-hour interval never fires during the test
    let spec = ScheduledJobSpec {
        name: "nightly-report".to_string(),
        source_kind: SourceKind::UrlScrape,
        tenant_id: Some("t1".to_string()),
        source_params: JsonMap::new(),
        schedule: ScheduleSpec::Interval(Duration::from_secs(3600)),
    };

    let id = scheduler.add_job(spec).await.expect("add");
    let listed = scheduler.list_jobs().await;
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].name, "nightly-report");
    assert!(!listed[0].paused);

    assert!(scheduler.pause_job(&id).await);
    assert!(scheduler.list_jobs().await[0].paused);
    assert!(scheduler.resume_job(&id).await);
    assert!(!scheduler.list_jobs().await[0].paused);

    assert!(scheduler.remove_job(&id).await);
    assert!(scheduler.list_jobs().await.is_empty());
    assert!(!scheduler.remove_job(&id).await);

    // Sub-minute intervals are rejected
    let too_fast = ScheduledJobSpec {
        name: "too-fast".to_string(),
        source_kind: SourceKind::UrlScrape,
        tenant_id: None,
        source_params: JsonMap::new(),
        schedule: ScheduleSpec::Interval(Duration::from_secs(5)),
    };
    assert!(scheduler.add_job(too_fast).await.is_err());
}

#[tokio::test]
async fn cancelled_job_stops_at_stage_boundary() {
    let harness = harness(FlakyEmbedder::reliable(8)).await;
    let file = temp_text_file("Cancellation target document with plenty of content to process.");

    let job = file_job(file.path().to_str().unwrap());
    let job_id = job.id.clone();
    harness.job_store.create(job.clone()).await.expect("create job");

    // Client cancels before the orchestrator picks the job up
    harness.job_store.cancel(&job_id).await.expect("cancel");

    let outcome = harness.orchestrator.run(&job).await.expect("run");
    assert_eq!(outcome.status, JobStatus::Cancelled);
    assert!(outcome.stages_completed.is_empty());

    // The cancelled status was not overwritten
    let stored_job = harness.job_store.get(&job_id).await.unwrap().unwrap();
    assert_eq!(stored_job.status, JobStatus::Cancelled);
    assert!(stored_job.completed_at.is_some());

    // Nothing reached the vector store
    assert!(harness.vector_store.embeddings.lock().unwrap().is_empty());
}
