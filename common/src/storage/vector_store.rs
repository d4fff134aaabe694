use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::error::AppError;
use crate::storage::types::document::{Embedding, StoredDocument};

/// Seam over the downstream vector store. The store stage talks to this
/// trait; production wires [`HttpVectorStore`], tests wire a recorder.
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Submit a whole batch of embeddings in one call. Returns the
    /// upstream acknowledgment payload.
    async fn store_embeddings(
        &self,
        embeddings: &[Embedding],
        correlation_id: &str,
    ) -> Result<serde_json::Value, AppError>;

    /// Submit one per-document summary record.
    async fn store_document(
        &self,
        document: &StoredDocument,
        correlation_id: &str,
    ) -> Result<(), AppError>;

    async fn health_check(&self) -> bool;
}

/// HTTP client for the external vector store service.
pub struct HttpVectorStore {
    client: reqwest::Client,
    base_url: String,
}

impl HttpVectorStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, AppError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl VectorStore for HttpVectorStore {
    async fn store_embeddings(
        &self,
        embeddings: &[Embedding],
        correlation_id: &str,
    ) -> Result<serde_json::Value, AppError> {
        let url = format!("{}/api/v1/embeddings/batch", self.base_url);

        debug!(
            %correlation_id,
            count = embeddings.len(),
            "submitting embedding batch to vector store"
        );

        let response = self
            .client
            .post(&url)
            .header("X-Correlation-ID", correlation_id)
            .json(&json!({ "embeddings": embeddings }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::VectorStore(format!(
                "embedding batch rejected with status {status}: {body}"
            )));
        }

        let ack: serde_json::Value = response.json().await.unwrap_or(serde_json::Value::Null);

        info!(
            %correlation_id,
            count = embeddings.len(),
            "embedding batch accepted by vector store"
        );

        Ok(ack)
    }

    async fn store_document(
        &self,
        document: &StoredDocument,
        correlation_id: &str,
    ) -> Result<(), AppError> {
        let url = format!("{}/api/v1/documents", self.base_url);

        let response = self
            .client
            .post(&url)
            .header("X-Correlation-ID", correlation_id)
            .json(document)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::VectorStore(format!(
                "document record rejected with status {status}: {body}"
            )));
        }

        Ok(())
    }

    async fn health_check(&self) -> bool {
        let url = format!("{}/health", self.base_url);
        match self.client.get(&url).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
