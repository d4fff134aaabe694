use std::sync::Arc;
use std::time::Instant;

use serde_json::json;
use tracing::{info, instrument};

use common::storage::types::document::{JsonMap, RawDocument, SourceKind};
use common::telemetry::TelemetrySink;
use common::utils::retry::{RetryContext, RetryPolicy};
use source_adapters::error::SourceErrorKind;
use source_adapters::params::SourceParams;
use source_adapters::{fetch_with_retry, AdapterRegistry};

use super::StageError;

const STAGE: &str = "fetch";

/// Stage 1: resolve the adapter for the job's source kind and fetch raw
/// documents under the retry harness.
pub struct FetchStage {
    registry: Arc<AdapterRegistry>,
    policy: RetryPolicy,
    telemetry: TelemetrySink,
}

impl FetchStage {
    pub fn new(registry: Arc<AdapterRegistry>, policy: RetryPolicy, telemetry: TelemetrySink) -> Self {
        Self {
            registry,
            policy,
            telemetry,
        }
    }

    #[instrument(skip_all, fields(job_id = %job_id, correlation_id = %correlation_id, source = %source_kind))]
    pub async fn execute(
        &self,
        source_kind: SourceKind,
        params: &SourceParams,
        job_id: &str,
        correlation_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<RawDocument>, StageError> {
        let started = Instant::now();

        match self
            .fetch_documents(source_kind, params, job_id, correlation_id, tenant_id)
            .await
        {
            Ok(documents) => {
                let total_content_length: usize =
                    documents.iter().map(|d| d.content.chars().count()).sum();
                let mut metadata = JsonMap::new();
                metadata.insert("source".to_string(), json!(source_kind.as_str()));
                metadata.insert(
                    "total_content_length".to_string(),
                    json!(total_content_length),
                );

                self.telemetry
                    .emit_phase_completed(
                        job_id,
                        STAGE,
                        1,
                        correlation_id,
                        started.elapsed().as_secs_f64() * 1000.0,
                        documents.len(),
                        tenant_id,
                        Some(metadata),
                    )
                    .await;

                info!(
                    documents = documents.len(),
                    total_content_length, "fetch stage completed"
                );

                Ok(documents)
            }
            Err(err) => {
                self.telemetry
                    .emit_job_failed(
                        job_id,
                        source_kind.as_str(),
                        correlation_id,
                        STAGE,
                        &err.error_type,
                        &err.message,
                        err.retry_count,
                        tenant_id,
                    )
                    .await;

                Err(StageError::new(STAGE, err.error_type, err.message))
            }
        }
    }

    async fn fetch_documents(
        &self,
        source_kind: SourceKind,
        params: &SourceParams,
        job_id: &str,
        correlation_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<RawDocument>, FetchFailure> {
        let Some(adapter) = self.registry.resolve(source_kind) else {
            return Err(FetchFailure {
                error_type: "ValidationError".to_string(),
                message: format!(
                    "no adapter available for source '{source_kind}' (is it configured?)"
                ),
                retry_count: 0,
            });
        };

        let ctx = RetryContext::new(job_id, STAGE, correlation_id, tenant_id);
        let mut documents =
            fetch_with_retry(adapter.as_ref(), params, self.policy, &ctx, &self.telemetry)
                .await
                .map_err(|err| FetchFailure {
                    error_type: err.error_type().to_string(),
                    message: err.to_string(),
                    retry_count: if err.kind == SourceErrorKind::Transient {
                        self.policy.max_attempts.saturating_sub(1)
                    } else {
                        0
                    },
                })?;

        // The job's tenant owns every document it fetched
        for document in &mut documents {
            document.tenant_id = tenant_id.map(ToString::to_string);
        }

        Ok(documents)
    }
}

struct FetchFailure {
    error_type: String,
    message: String,
    retry_count: u32,
}
