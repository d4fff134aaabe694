use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::types::CreateEmbeddingRequestArgs;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

use crate::{error::AppError, storage::types::document::embedding_dimension};

/// Seam over the embedding provider so stages can be exercised with a
/// deterministic backend in tests.
#[async_trait]
pub trait EmbeddingBackend: Send + Sync {
    fn model(&self) -> &str;
    fn dimension(&self) -> usize;

    /// Embed a batch of inputs. The returned vectors are positionally
    /// aligned with `inputs`.
    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AppError>;
}

/// OpenAI-backed embedder used in production.
pub struct OpenAiEmbedder {
    client: Arc<async_openai::Client<OpenAIConfig>>,
    model: String,
    dimension: usize,
}

impl OpenAiEmbedder {
    pub fn new(client: Arc<async_openai::Client<OpenAIConfig>>, model: &str) -> Self {
        Self {
            client,
            model: model.to_string(),
            dimension: embedding_dimension(model),
        }
    }
}

#[async_trait]
impl EmbeddingBackend for OpenAiEmbedder {
    fn model(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed_batch(&self, inputs: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let request = CreateEmbeddingRequestArgs::default()
            .model(&self.model)
            .dimensions(self.dimension as u32)
            .input(inputs.to_vec())
            .build()?;

        let response = self.client.embeddings().create(request).await?;

        if response.data.len() != inputs.len() {
            return Err(AppError::InternalError(format!(
                "embedding provider returned {} vectors for {} inputs",
                response.data.len(),
                inputs.len()
            )));
        }

        // The API reports an index per vector; order by it rather than
        // trusting response ordering.
        let mut data = response.data;
        data.sort_by_key(|entry| entry.index);

        debug!(
            batch = inputs.len(),
            model = %self.model,
            "embedding batch generated"
        );

        Ok(data.into_iter().map(|entry| entry.embedding).collect())
    }
}

/// Whether an OpenAI failure is worth retrying: rate limits, transport
/// failures and provider-side 5xx conditions.
pub fn is_transient_openai_error(err: &OpenAIError) -> bool {
    match err {
        OpenAIError::Reqwest(inner) => {
            inner.is_timeout() || inner.is_connect() || inner.is_request()
        }
        OpenAIError::ApiError(api) => {
            let message = api.message.to_lowercase();
            message.contains("rate limit")
                || message.contains("overloaded")
                || message.contains("server error")
                || message.contains("timeout")
                || message.contains("429")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_openai::error::ApiError;

    #[test]
    fn rate_limit_api_error_is_transient() {
        let err = OpenAIError::ApiError(ApiError {
            message: "Rate limit reached for requests".to_string(),
            r#type: Some("requests".to_string()),
            param: None,
            code: None,
        });
        assert!(is_transient_openai_error(&err));
    }

    #[test]
    fn invalid_argument_is_not_transient() {
        let err = OpenAIError::InvalidArgument("bad input".to_string());
        assert!(!is_transient_openai_error(&err));
    }
}
