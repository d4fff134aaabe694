use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::storage::db::SurrealDbClient;
use crate::storage::types::document::JsonMap;

/// How long an emit may wait on the store before the event is dropped.
/// Telemetry must never become the slow path.
const EMIT_TIMEOUT: Duration = Duration::from_secs(5);

const SERVICE_NAME: &str = "rake";
const EVENTS_TABLE: &str = "events";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    JobStarted,
    PhaseCompleted,
    JobCompleted,
    IngestionComplete,
    JobFailed,
    RetryAttempt,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

/// One append-only telemetry row. Domain fields (job id, phase, error
/// details) travel inside `metadata`/`metrics`; the row itself carries only
/// the fixed envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    pub event_type: EventType,
    pub severity: Severity,
    pub correlation_id: String,
    pub metadata: JsonMap,
    pub metrics: BTreeMap<String, f64>,
}

impl TelemetryEvent {
    pub fn new(event_type: EventType, severity: Severity, correlation_id: &str) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            service: SERVICE_NAME.to_string(),
            event_type,
            severity,
            correlation_id: correlation_id.to_string(),
            metadata: JsonMap::new(),
            metrics: BTreeMap::new(),
        }
    }

    pub fn meta(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn meta_str(self, key: &str, value: &str) -> Self {
        self.meta(key, serde_json::Value::String(value.to_string()))
    }

    pub fn meta_opt_str(self, key: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.meta_str(key, value),
            None => self,
        }
    }

    pub fn metric(mut self, key: &str, value: f64) -> Self {
        self.metrics.insert(key.to_string(), value);
        self
    }
}

/// Fire-and-forget sink over the local `events` table.
///
/// Emission failures are logged and swallowed: a telemetry outage or a
/// contended store must not stall the pipeline.
#[derive(Clone)]
pub struct TelemetrySink {
    db: Option<Arc<SurrealDbClient>>,
    enabled: bool,
}

impl TelemetrySink {
    pub fn new(db: Arc<SurrealDbClient>, enabled: bool) -> Self {
        Self {
            db: Some(db),
            enabled,
        }
    }

    /// A sink that drops everything. Used in tests and when the process
    /// runs without a telemetry store.
    pub fn disabled() -> Self {
        Self {
            db: None,
            enabled: false,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub async fn emit(&self, event: TelemetryEvent) {
        if !self.enabled {
            debug!(
                event_type = ?event.event_type,
                correlation_id = %event.correlation_id,
                "telemetry disabled, skipping event emission"
            );
            return;
        }
        let Some(db) = &self.db else {
            return;
        };

        let event_type = event.event_type;
        let correlation_id = event.correlation_id.clone();
        let event_id = event.event_id.clone();

        match tokio::time::timeout(EMIT_TIMEOUT, Self::insert(db, event)).await {
            Ok(Ok(())) => {
                debug!(
                    %event_id,
                    %correlation_id,
                    event_type = ?event_type,
                    "telemetry event written"
                );
            }
            Ok(Err(err)) => {
                warn!(
                    %correlation_id,
                    event_type = ?event_type,
                    error = %err,
                    "telemetry store rejected event, dropped"
                );
            }
            Err(_) => {
                warn!(
                    %correlation_id,
                    event_type = ?event_type,
                    "telemetry write timed out, event dropped"
                );
            }
        }
    }

    async fn insert(db: &SurrealDbClient, event: TelemetryEvent) -> Result<(), surrealdb::Error> {
        let _created: Option<TelemetryEvent> = db
            .client
            .create((EVENTS_TABLE, event.event_id.clone()))
            .content(event)
            .await?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn emit_job_started(
        &self,
        job_id: &str,
        source: &str,
        correlation_id: &str,
        scheduled: bool,
        tenant_id: Option<&str>,
        metadata: Option<JsonMap>,
    ) {
        let mut event = TelemetryEvent::new(EventType::JobStarted, Severity::Info, correlation_id)
            .meta_str("job_id", job_id)
            .meta_str("source", source)
            .meta("scheduled", serde_json::Value::Bool(scheduled))
            .meta_opt_str("tenant_id", tenant_id);
        if let Some(extra) = metadata {
            event.metadata.extend(extra);
        }

        self.emit(event).await;
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn emit_phase_completed(
        &self,
        job_id: &str,
        phase: &str,
        phase_number: u8,
        correlation_id: &str,
        duration_ms: f64,
        items_processed: usize,
        tenant_id: Option<&str>,
        metadata: Option<JsonMap>,
    ) {
        let mut event =
            TelemetryEvent::new(EventType::PhaseCompleted, Severity::Info, correlation_id)
                .meta_str("job_id", job_id)
                .meta_str("phase", phase)
                .meta("phase_number", serde_json::json!(phase_number))
                .meta_opt_str("tenant_id", tenant_id)
                .metric("duration_ms", duration_ms)
                .metric("items_processed", items_processed as f64);
        if let Some(extra) = metadata {
            event.metadata.extend(extra);
        }

        self.emit(event).await;
    }

    /// Successful end of a job. Tagged `ingestion_complete` so the sibling
    /// dashboard can filter pipeline completions apart from generic job
    /// completions.
    #[allow(clippy::too_many_arguments)]
    pub async fn emit_job_completed(
        &self,
        job_id: &str,
        source: &str,
        correlation_id: &str,
        total_duration_ms: f64,
        chunks_created: usize,
        embeddings_generated: usize,
        tenant_id: Option<&str>,
        metadata: Option<JsonMap>,
    ) {
        let pipeline_id: String = job_id.chars().take(8).collect();
        let mut event = TelemetryEvent::new(
            EventType::IngestionComplete,
            Severity::Info,
            correlation_id,
        )
        .meta_str("job_id", job_id)
        .meta_str("source", source)
        .meta_opt_str("tenant_id", tenant_id)
        .metric("total_duration_ms", total_duration_ms)
        .metric("chunks_created", chunks_created as f64)
        .metric("embeddings_generated", embeddings_generated as f64);

        if let Some(extra) = metadata {
            event.metadata.extend(extra);
        }
        if !event.metadata.contains_key("pipeline_id") {
            event
                .metadata
                .insert("pipeline_id".to_string(), serde_json::json!(pipeline_id));
        }
        if !event.metadata.contains_key("pipeline_name") {
            event.metadata.insert(
                "pipeline_name".to_string(),
                serde_json::json!(format!("Pipeline {pipeline_id}")),
            );
        }

        self.emit(event).await;
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn emit_job_failed(
        &self,
        job_id: &str,
        source: &str,
        correlation_id: &str,
        failed_stage: &str,
        error_type: &str,
        error_message: &str,
        retry_count: u32,
        tenant_id: Option<&str>,
    ) {
        let event = TelemetryEvent::new(EventType::JobFailed, Severity::Error, correlation_id)
            .meta_str("job_id", job_id)
            .meta_str("source", source)
            .meta_str("failed_stage", failed_stage)
            .meta_str("error_type", error_type)
            .meta_str("error_message", error_message)
            .meta_opt_str("tenant_id", tenant_id)
            .metric("retry_count", f64::from(retry_count));

        self.emit(event).await;
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn emit_retry_attempt(
        &self,
        job_id: &str,
        stage: &str,
        correlation_id: &str,
        attempt_number: u32,
        max_attempts: u32,
        error_message: &str,
        backoff_seconds: f64,
        tenant_id: Option<&str>,
    ) {
        let event = TelemetryEvent::new(EventType::RetryAttempt, Severity::Warning, correlation_id)
            .meta_str("job_id", job_id)
            .meta_str("stage", stage)
            .meta_str("error_message", error_message)
            .meta_opt_str("tenant_id", tenant_id)
            .metric("attempt_number", f64::from(attempt_number))
            .metric("max_attempts", f64::from(max_attempts))
            .metric("backoff_seconds", backoff_seconds);

        self.emit(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn memory_sink() -> (TelemetrySink, Arc<SurrealDbClient>) {
        let db = Arc::new(
            SurrealDbClient::memory("telemetry_ns", &Uuid::new_v4().to_string())
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        (TelemetrySink::new(Arc::clone(&db), true), db)
    }

    async fn stored_events(db: &SurrealDbClient) -> Vec<TelemetryEvent> {
        db.client
            .select(EVENTS_TABLE)
            .await
            .expect("select events")
    }

    #[tokio::test]
    async fn test_emit_phase_completed_writes_envelope() {
        let (sink, db) = memory_sink().await;

        sink.emit_phase_completed(
            "job-abc",
            "chunk",
            3,
            "trace-1",
            1500.0,
            10,
            Some("tenant-1"),
            None,
        )
        .await;

        let events = stored_events(&db).await;
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert_eq!(event.service, "rake");
        assert_eq!(event.event_type, EventType::PhaseCompleted);
        assert_eq!(event.severity, Severity::Info);
        assert_eq!(event.correlation_id, "trace-1");
        assert_eq!(
            event.metadata.get("phase").and_then(|v| v.as_str()),
            Some("chunk")
        );
        assert_eq!(event.metrics.get("items_processed"), Some(&10.0));
        assert_eq!(event.metrics.get("duration_ms"), Some(&1500.0));
    }

    #[tokio::test]
    async fn test_job_completed_is_tagged_ingestion_complete() {
        let (sink, db) = memory_sink().await;

        sink.emit_job_completed(
            "job-abcdef123456",
            "file_upload",
            "trace-2",
            5000.0,
            10,
            10,
            None,
            None,
        )
        .await;

        let events = stored_events(&db).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, EventType::IngestionComplete);
        assert_eq!(
            events[0].metadata.get("pipeline_id").and_then(|v| v.as_str()),
            Some("job-abcd")
        );
    }

    #[tokio::test]
    async fn test_job_failed_severity_and_fields() {
        let (sink, db) = memory_sink().await;

        sink.emit_job_failed(
            "job-1",
            "url_scrape",
            "trace-3",
            "fetch",
            "RequestError",
            "connection reset",
            2,
            None,
        )
        .await;

        let events = stored_events(&db).await;
        assert_eq!(events[0].severity, Severity::Error);
        assert_eq!(
            events[0]
                .metadata
                .get("failed_stage")
                .and_then(|v| v.as_str()),
            Some("fetch")
        );
        assert_eq!(events[0].metrics.get("retry_count"), Some(&2.0));
    }

    #[tokio::test]
    async fn test_disabled_sink_drops_silently() {
        let sink = TelemetrySink::disabled();
        // Must not panic or block
        sink.emit_job_started("job-1", "file_upload", "trace-4", false, None, None)
            .await;
    }

    #[tokio::test]
    async fn test_disabled_flag_skips_write() {
        let db = Arc::new(
            SurrealDbClient::memory("telemetry_ns", &Uuid::new_v4().to_string())
                .await
                .expect("memory db"),
        );
        let sink = TelemetrySink::new(Arc::clone(&db), false);

        sink.emit_job_started("job-1", "file_upload", "trace-5", false, None, None)
            .await;

        assert!(stored_events(&db).await.is_empty());
    }
}
