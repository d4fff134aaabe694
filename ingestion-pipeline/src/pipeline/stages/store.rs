use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde_json::json;
use tracing::{info, instrument};

use common::error::AppError;
use common::storage::types::document::{Embedding, JsonMap, SourceKind, StoredDocument};
use common::storage::vector_store::VectorStore;
use common::telemetry::TelemetrySink;

use super::StageError;

const STAGE: &str = "store";

/// Stage 5: push the whole embedding batch to the vector store, then one
/// summary record per distinct document.
pub struct StoreStage {
    store: Arc<dyn VectorStore>,
    telemetry: TelemetrySink,
}

impl StoreStage {
    pub fn new(store: Arc<dyn VectorStore>, telemetry: TelemetrySink) -> Self {
        Self { store, telemetry }
    }

    #[instrument(skip_all, fields(job_id = %job_id, correlation_id = %correlation_id))]
    #[allow(clippy::too_many_arguments)]
    pub async fn execute(
        &self,
        embeddings: &[Embedding],
        source_kind: SourceKind,
        url: Option<&str>,
        job_id: &str,
        correlation_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<StoredDocument>, StageError> {
        let started = Instant::now();

        match self
            .store_all(embeddings, source_kind, url, correlation_id)
            .await
        {
            Ok((stored_documents, ack)) => {
                let mut metadata = JsonMap::new();
                metadata.insert("document_count".to_string(), json!(stored_documents.len()));
                metadata.insert(
                    "total_chunks".to_string(),
                    json!(stored_documents.iter().map(|d| d.chunk_count).sum::<usize>()),
                );
                metadata.insert("total_embeddings".to_string(), json!(embeddings.len()));
                metadata.insert("store_ack".to_string(), ack);

                self.telemetry
                    .emit_phase_completed(
                        job_id,
                        STAGE,
                        5,
                        correlation_id,
                        started.elapsed().as_secs_f64() * 1000.0,
                        stored_documents.len(),
                        tenant_id,
                        Some(metadata),
                    )
                    .await;

                info!(
                    documents = stored_documents.len(),
                    embeddings = embeddings.len(),
                    "store stage completed"
                );

                Ok(stored_documents)
            }
            Err(err) => {
                let stage_err = StageError::from_app(STAGE, &err);
                self.telemetry
                    .emit_job_failed(
                        job_id,
                        source_kind.as_str(),
                        correlation_id,
                        STAGE,
                        &stage_err.error_type,
                        &stage_err.message,
                        0,
                        tenant_id,
                    )
                    .await;
                Err(stage_err)
            }
        }
    }

    async fn store_all(
        &self,
        embeddings: &[Embedding],
        source_kind: SourceKind,
        url: Option<&str>,
        correlation_id: &str,
    ) -> Result<(Vec<StoredDocument>, serde_json::Value), AppError> {
        // One upstream call for the whole batch
        let ack = self.store.store_embeddings(embeddings, correlation_id).await?;

        // Group by originating document, keeping first-seen order
        let mut order: Vec<String> = Vec::new();
        let mut groups: HashMap<String, Vec<&Embedding>> = HashMap::new();
        for embedding in embeddings {
            let document_id = embedding
                .metadata
                .get("document_id")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
                .to_string();
            if !groups.contains_key(&document_id) {
                order.push(document_id.clone());
            }
            groups.entry(document_id).or_default().push(embedding);
        }

        let mut stored_documents = Vec::with_capacity(order.len());
        for document_id in order {
            let Some(group) = groups.get(&document_id) else {
                continue;
            };

            let distinct_chunks: HashSet<&str> =
                group.iter().map(|e| e.chunk_id.as_str()).collect();

            let document = StoredDocument {
                id: document_id,
                source_kind,
                url: url.map(ToString::to_string),
                chunk_count: distinct_chunks.len(),
                embedding_count: group.len(),
                status: "completed".to_string(),
                tenant_id: group.first().and_then(|e| e.tenant_id.clone()),
                stored_at: Utc::now(),
            };

            self.store.store_document(&document, correlation_id).await?;
            stored_documents.push(document);
        }

        Ok((stored_documents, ack))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingStore {
        embeddings_batches: Mutex<Vec<usize>>,
        documents: Mutex<Vec<StoredDocument>>,
        reject_writes: bool,
    }

    #[async_trait]
    impl VectorStore for RecordingStore {
        async fn store_embeddings(
            &self,
            embeddings: &[Embedding],
            _correlation_id: &str,
        ) -> Result<serde_json::Value, AppError> {
            if self.reject_writes {
                return Err(AppError::VectorStore("rejected".to_string()));
            }
            self.embeddings_batches
                .lock()
                .unwrap()
                .push(embeddings.len());
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

    fn embedding(document_id: &str, chunk_id: &str) -> Embedding {
        let mut metadata = JsonMap::new();
        metadata.insert("document_id".to_string(), json!(document_id));
        Embedding::new(
            chunk_id.to_string(),
            vec![0.1, 0.2],
            "test-embedding".to_string(),
            metadata,
            Some("t1".to_string()),
        )
    }

    #[tokio::test]
    async fn groups_by_document_and_submits_batch_once() {
        let store = Arc::new(RecordingStore::default());
        let stage = StoreStage::new(
            Arc::clone(&store) as Arc<dyn VectorStore>,
            TelemetrySink::disabled(),
        );

        let embeddings = vec![
            embedding("doc-a", "chunk-1"),
            embedding("doc-a", "chunk-2"),
            embedding("doc-b", "chunk-3"),
        ];

        let stored = stage
            .execute(
                &embeddings,
                SourceKind::FileUpload,
                Some("/tmp/file.txt"),
                "job-1",
                "trace-1",
                Some("t1"),
            )
            .await
            .expect("store");

        // One batch call carrying all three embeddings
        assert_eq!(*store.embeddings_batches.lock().unwrap(), vec![3]);

        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].id, "doc-a");
        assert_eq!(stored[0].chunk_count, 2);
        assert_eq!(stored[0].embedding_count, 2);
        assert_eq!(stored[0].status, "completed");
        assert_eq!(stored[0].tenant_id.as_deref(), Some("t1"));
        assert_eq!(stored[1].id, "doc-b");
        assert_eq!(stored[1].chunk_count, 1);

        assert_eq!(store.documents.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rejected_write_fails_the_stage() {
        let store = Arc::new(RecordingStore {
            reject_writes: true,
            ..RecordingStore::default()
        });
        let stage = StoreStage::new(store, TelemetrySink::disabled());

        let err = stage
            .execute(
                &[embedding("doc-a", "chunk-1")],
                SourceKind::UrlScrape,
                None,
                "job-1",
                "trace-1",
                None,
            )
            .await
            .unwrap_err();
        assert_eq!(err.stage, "store");
    }
}
