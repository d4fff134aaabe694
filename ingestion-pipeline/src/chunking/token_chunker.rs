use common::error::AppError;
use common::storage::types::document::{Chunk, CleanedDocument, JsonMap};
use serde_json::json;
use tracing::debug;

use super::{estimate_tokens, split_paragraphs, split_sentences, ChunkingConfig};

/// Paragraph/sentence token-budget chunker.
///
/// Segments the document into paragraphs (or sentences, or one blob),
/// then greedily packs segments into chunks up to `chunk_size` estimated
/// tokens, carrying a tail of the previous chunk forward as overlap.
/// Character offsets are best-effort: they drift when oversized segments
/// are hard-split or when overlap is applied.
pub struct TokenBudgetChunker {
    config: ChunkingConfig,
}

impl TokenBudgetChunker {
    pub fn new(config: ChunkingConfig) -> Result<Self, AppError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn chunk_document(&self, document: &CleanedDocument) -> Result<Vec<Chunk>, AppError> {
        let config = &self.config;
        let content = &document.content;

        let segments: Vec<String> = if config.respect_paragraphs {
            split_paragraphs(content)
        } else if config.respect_sentences {
            split_sentences(content)
        } else {
            let trimmed = content.trim();
            if trimmed.is_empty() {
                Vec::new()
            } else {
                vec![trimmed.to_string()]
            }
        };

        let joiner = if config.respect_sentences { " " } else { "\n\n" };

        let mut chunks: Vec<Chunk> = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_tokens = 0usize;
        let mut position = 0usize;
        let mut char_offset = 0usize;

        for segment in &segments {
            let segment_tokens = estimate_tokens(segment);

            // A single segment above the budget is split further
            if segment_tokens > config.chunk_size {
                if !current.is_empty() {
                    let text = current.join(joiner);
                    let start = char_offset.saturating_sub(text.chars().count());
                    chunks.push(self.build_chunk(document, &text, position, start, char_offset)?);
                    position += 1;
                    current.clear();
                    current_tokens = 0;
                }

                if config.respect_sentences {
                    // Greedily refill from the segment's sentences, seeding
                    // each new chunk with a slice of the previous one
                    for sentence in split_sentences(segment) {
                        let sentence_tokens = estimate_tokens(&sentence);
                        if current_tokens + sentence_tokens > config.chunk_size
                            && !current.is_empty()
                        {
                            let text = current.join(" ");
                            let start = char_offset.saturating_sub(text.chars().count());
                            chunks.push(self.build_chunk(
                                document,
                                &text,
                                position,
                                start,
                                char_offset,
                            )?);
                            position += 1;

                            if config.chunk_overlap > 0 {
                                let keep = (config.chunk_overlap / 4).max(1).min(current.len());
                                let overlap_text =
                                    current[current.len() - keep..].join(" ");
                                current_tokens =
                                    estimate_tokens(&overlap_text) + sentence_tokens;
                                current = vec![overlap_text, sentence];
                            } else {
                                current_tokens = sentence_tokens;
                                current = vec![sentence];
                            }
                        } else {
                            current_tokens += sentence_tokens;
                            current.push(sentence);
                        }
                    }
                } else {
                    // Fixed character stride when sentences are off limits
                    let stride = config.chunk_size * 4;
                    let segment_chars: Vec<char> = segment.chars().collect();
                    let mut i = 0;
                    while i < segment_chars.len() {
                        let end = (i + stride).min(segment_chars.len());
                        let text: String = segment_chars[i..end].iter().collect();
                        chunks.push(self.build_chunk(
                            document,
                            &text,
                            position,
                            char_offset + i,
                            char_offset + end,
                        )?);
                        position += 1;
                        i = end;
                    }
                }

                char_offset += segment.chars().count() + 2;
                continue;
            }

            if current_tokens + segment_tokens <= config.chunk_size {
                current.push(segment.clone());
                current_tokens += segment_tokens;
            } else {
                if !current.is_empty() {
                    let text = current.join(joiner);
                    let start = char_offset.saturating_sub(text.chars().count());
                    chunks.push(self.build_chunk(document, &text, position, start, char_offset)?);
                    position += 1;
                }

                if config.chunk_overlap > 0 && !current.is_empty() {
                    let keep = (current.len() / 4).max(1);
                    let mut next: Vec<String> = current[current.len() - keep..].to_vec();
                    next.push(segment.clone());
                    current_tokens = next.iter().map(|s| estimate_tokens(s)).sum();
                    current = next;
                } else {
                    current_tokens = segment_tokens;
                    current = vec![segment.clone()];
                }
            }

            char_offset += segment.chars().count() + 2;
        }

        // Trailing chunk, kept only if it reaches the minimum size
        if !current.is_empty() {
            let text = current.join(joiner);
            if estimate_tokens(&text) >= self.config.min_chunk_size {
                let start = char_offset.saturating_sub(text.chars().count());
                chunks.push(self.build_chunk(document, &text, position, start, char_offset)?);
            }
        }

        debug!(
            document_id = %document.id,
            segments = segments.len(),
            chunks = chunks.len(),
            "document chunked"
        );

        Ok(chunks)
    }

    fn build_chunk(
        &self,
        document: &CleanedDocument,
        content: &str,
        position: usize,
        start_char: usize,
        end_char: usize,
    ) -> Result<Chunk, AppError> {
        let mut metadata: JsonMap = document.metadata.clone();
        metadata.insert("chunk_strategy".to_string(), json!("token_based"));
        metadata.insert("chunk_size_tokens".to_string(), json!(self.config.chunk_size));
        metadata.insert("overlap_tokens".to_string(), json!(self.config.chunk_overlap));

        let end_char = end_char.max(start_char + 1);

        Chunk::new(
            document.id.clone(),
            content.to_string(),
            metadata,
            position,
            estimate_tokens(content),
            start_char,
            end_char,
            document.tenant_id.clone(),
        )
    }
}
