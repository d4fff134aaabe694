use std::sync::Mutex;

use common::error::AppError;
use common::storage::types::document::{Chunk, CleanedDocument, JsonMap};
use fastembed::{EmbeddingModel, TextEmbedding, TextInitOptions};
use serde_json::json;
use tracing::{debug, info};

use super::{split_sentences_abbreviation_aware, BpeCounter, ChunkingConfig, ChunkingStrategy};

/// Sentence-embedding seam for boundary detection. Production uses a
/// small local model, distinct from the pipeline's main embedding model;
/// tests plug in a deterministic encoder.
pub trait SentenceEncoder: Send + Sync {
    fn encode(&self, sentences: &[String]) -> Result<Vec<Vec<f32>>, AppError>;
}

/// Local MiniLM sentence encoder.
pub struct FastEmbedEncoder {
    model: Mutex<TextEmbedding>,
}

impl FastEmbedEncoder {
    pub fn new() -> Result<Self, AppError> {
        let options = TextInitOptions::new(EmbeddingModel::AllMiniLML6V2)
            .with_show_download_progress(false);
        let model = TextEmbedding::try_new(options)
            .map_err(|e| AppError::InternalError(format!("failed to load sentence model: {e}")))?;

        Ok(Self {
            model: Mutex::new(model),
        })
    }
}

impl SentenceEncoder for FastEmbedEncoder {
    fn encode(&self, sentences: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        let mut model = self
            .model
            .lock()
            .map_err(|_| AppError::InternalError("sentence model lock poisoned".to_string()))?;
        model
            .embed(sentences.to_vec(), None)
            .map_err(|e| AppError::InternalError(format!("sentence embedding failed: {e}")))
    }
}

/// A scored gap between one sentence and its successor.
#[derive(Debug, Clone, Copy)]
struct SemanticBoundary {
    similarity: f32,
    is_boundary: bool,
}

/// Why a chunk was closed where it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SplitReason {
    TokenLimit,
    SemanticBoundary,
}

impl SplitReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::TokenLimit => "token_limit",
            Self::SemanticBoundary => "semantic_boundary",
        }
    }
}

/// Semantic-boundary chunker: splits where adjacent sentences diverge in
/// meaning, with token limits as a safety bound (pure semantic) or as the
/// primary constraint (hybrid).
pub struct SemanticChunker {
    config: ChunkingConfig,
    encoder: Box<dyn SentenceEncoder>,
    counter: BpeCounter,
}

impl SemanticChunker {
    pub fn new(config: ChunkingConfig, encoder: Box<dyn SentenceEncoder>) -> Result<Self, AppError> {
        config.validate()?;
        if config.strategy == ChunkingStrategy::TokenBased {
            return Err(AppError::Validation(
                "semantic chunker requires the semantic or hybrid strategy".to_string(),
            ));
        }

        info!(
            strategy = config.strategy.as_str(),
            chunk_size = config.chunk_size,
            overlap = config.chunk_overlap,
            similarity_threshold = config.similarity_threshold,
            "semantic chunker initialized"
        );

        Ok(Self {
            config,
            encoder,
            counter: BpeCounter::new()?,
        })
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.counter.count(text)
    }

    fn detect_boundaries(&self, sentences: &[String]) -> Result<Vec<SemanticBoundary>, AppError> {
        if sentences.len() < 2 {
            return Ok(Vec::new());
        }

        let embeddings = self.encoder.encode(sentences)?;
        if embeddings.len() != sentences.len() {
            return Err(AppError::InternalError(format!(
                "sentence encoder returned {} vectors for {} sentences",
                embeddings.len(),
                sentences.len()
            )));
        }

        let boundaries = embeddings
            .windows(2)
            .map(|pair| {
                let similarity = cosine_similarity(&pair[0], &pair[1]);
                SemanticBoundary {
                    similarity,
                    is_boundary: similarity < self.config.similarity_threshold,
                }
            })
            .collect();

        Ok(boundaries)
    }

    pub fn chunk_document(&self, document: &CleanedDocument) -> Result<Vec<Chunk>, AppError> {
        let sentences = split_sentences_abbreviation_aware(&document.content);
        if sentences.is_empty() {
            return Ok(Vec::new());
        }

        let boundaries = self.detect_boundaries(&sentences)?;

        let chunks = match self.config.strategy {
            ChunkingStrategy::Semantic => self.chunk_semantic(document, &sentences, &boundaries)?,
            _ => self.chunk_hybrid(document, &sentences, &boundaries)?,
        };

        debug!(
            document_id = %document.id,
            sentences = sentences.len(),
            chunks = chunks.len(),
            strategy = self.config.strategy.as_str(),
            "document chunked"
        );

        Ok(chunks)
    }

    /// Split at every boundary; token pressure only kicks in at 1.5x the
    /// target size.
    fn chunk_semantic(
        &self,
        document: &CleanedDocument,
        sentences: &[String],
        boundaries: &[SemanticBoundary],
    ) -> Result<Vec<Chunk>, AppError> {
        let mut chunks = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_tokens = 0usize;
        let mut position = 0usize;

        for (i, sentence) in sentences.iter().enumerate() {
            current_tokens += self.count_tokens(sentence);
            current.push(sentence.as_str());

            let at_boundary = boundaries.get(i).is_some_and(|b| b.is_boundary);
            let over_safety_bound = current_tokens as f32 > self.config.chunk_size as f32 * 1.5;

            if (at_boundary || over_safety_bound) && !current.is_empty() {
                let text = current.join(" ");
                let boundary_similarity = boundaries
                    .get(i)
                    .filter(|b| b.is_boundary)
                    .map(|b| b.similarity);
                chunks.push(self.build_chunk(
                    document,
                    &text,
                    position,
                    current_tokens,
                    boundary_similarity,
                    None,
                )?);
                position += 1;
                current.clear();
                current_tokens = 0;
            }
        }

        if !current.is_empty() {
            let text = current.join(" ");
            let tokens = self.count_tokens(&text);
            chunks.push(self.build_chunk(document, &text, position, tokens, None, None)?);
        }

        Ok(chunks)
    }

    /// Hybrid priority: hard token limit first (with overlap), then
    /// semantic boundaries once the chunk passes 70% of the target.
    fn chunk_hybrid(
        &self,
        document: &CleanedDocument,
        sentences: &[String],
        boundaries: &[SemanticBoundary],
    ) -> Result<Vec<Chunk>, AppError> {
        let soft_floor = self.config.chunk_size as f32 * 0.7;

        let mut chunks = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_tokens = 0usize;
        let mut position = 0usize;

        for (i, sentence) in sentences.iter().enumerate() {
            current_tokens += self.count_tokens(sentence);
            current.push(sentence.clone());

            let mut split_reason = None;
            if current_tokens > self.config.chunk_size {
                split_reason = Some(SplitReason::TokenLimit);
            } else if boundaries.get(i).is_some_and(|b| b.is_boundary)
                && current_tokens as f32 >= soft_floor
            {
                split_reason = Some(SplitReason::SemanticBoundary);
            }

            let Some(reason) = split_reason else {
                continue;
            };

            let text = current.join(" ");
            let boundary_similarity = boundaries.get(i).map(|b| b.similarity);
            chunks.push(self.build_chunk(
                document,
                &text,
                position,
                current_tokens,
                boundary_similarity,
                Some(reason),
            )?);
            position += 1;

            // Overlap only after a hard split; a semantic split is already
            // topic-aligned
            if reason == SplitReason::TokenLimit && self.config.chunk_overlap > 0 {
                let keep = (current.len() / 4).max(1).min(current.len());
                current = current[current.len() - keep..].to_vec();
                current_tokens = current.iter().map(|s| self.count_tokens(s)).sum();
            } else {
                current.clear();
                current_tokens = 0;
            }
        }

        if !current.is_empty() {
            let text = current.join(" ");
            let tokens = self.count_tokens(&text);
            chunks.push(self.build_chunk(document, &text, position, tokens, None, None)?);
        }

        Ok(chunks)
    }

    #[allow(clippy::too_many_arguments)]
    fn build_chunk(
        &self,
        document: &CleanedDocument,
        content: &str,
        position: usize,
        token_count: usize,
        boundary_similarity: Option<f32>,
        split_reason: Option<SplitReason>,
    ) -> Result<Chunk, AppError> {
        let mut metadata: JsonMap = document.metadata.clone();
        metadata.insert(
            "chunk_strategy".to_string(),
            json!(self.config.strategy.as_str()),
        );
        metadata.insert("chunk_size_tokens".to_string(), json!(self.config.chunk_size));
        metadata.insert("overlap_tokens".to_string(), json!(self.config.chunk_overlap));
        metadata.insert("actual_tokens".to_string(), json!(token_count));

        if let Some(similarity) = boundary_similarity {
            metadata.insert(
                "boundary_similarity".to_string(),
                json!((f64::from(similarity) * 1000.0).round() / 1000.0),
            );
        }
        if let Some(reason) = split_reason {
            metadata.insert("split_reason".to_string(), json!(reason.as_str()));
        }

        // Offsets need the whole document to compute exactly; the span of
        // the chunk's own text is recorded instead
        Chunk::new(
            document.id.clone(),
            content.to_string(),
            metadata,
            position,
            token_count.max(1),
            0,
            content.chars().count().max(1),
            document.tenant_id.clone(),
        )
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a * norm_b)
}
