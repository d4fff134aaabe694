pub mod semantic;
pub mod token_chunker;

use common::error::AppError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub use semantic::{FastEmbedEncoder, SemanticChunker, SentenceEncoder};
pub use token_chunker::TokenBudgetChunker;

/// How documents are segmented into chunks.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChunkingStrategy {
    TokenBased,
    Semantic,
    Hybrid,
}

impl ChunkingStrategy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TokenBased => "token_based",
            Self::Semantic => "semantic",
            Self::Hybrid => "hybrid",
        }
    }
}

impl FromStr for ChunkingStrategy {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "token_based" => Ok(Self::TokenBased),
            "semantic" => Ok(Self::Semantic),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(AppError::Validation(format!(
                "unknown chunking strategy: {other}"
            ))),
        }
    }
}

/// Tunables shared by both chunking engines.
#[derive(Debug, Clone)]
pub struct ChunkingConfig {
    /// Target upper bound, in tokens.
    pub chunk_size: usize,
    /// Tokens carried from the end of one chunk into the next.
    pub chunk_overlap: usize,
    pub strategy: ChunkingStrategy,
    pub respect_sentences: bool,
    pub respect_paragraphs: bool,
    /// A trailing chunk smaller than this is dropped.
    pub min_chunk_size: usize,
    /// Boundary threshold for the semantic strategies.
    pub similarity_threshold: f32,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 50,
            strategy: ChunkingStrategy::TokenBased,
            respect_sentences: true,
            respect_paragraphs: true,
            min_chunk_size: 50,
            similarity_threshold: 0.5,
        }
    }
}

impl ChunkingConfig {
    pub fn validate(&self) -> Result<(), AppError> {
        if self.chunk_overlap >= self.chunk_size {
            return Err(AppError::Validation(format!(
                "overlap ({}) must be less than chunk_size ({})",
                self.chunk_overlap, self.chunk_size
            )));
        }
        if !(0.0..=1.0).contains(&self.similarity_threshold) {
            return Err(AppError::Validation(format!(
                "similarity_threshold must be in 0..=1, got {}",
                self.similarity_threshold
            )));
        }
        Ok(())
    }
}

/// Token estimate at roughly four characters per token. Used by the
/// paragraph engine; the semantic engine counts with a real tokenizer.
pub fn estimate_tokens(text: &str) -> usize {
    (text.chars().count() / 4).max(1)
}

/// Split on blank lines.
pub fn split_paragraphs(text: &str) -> Vec<String> {
    text.split("\n\n")
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(ToString::to_string)
        .collect()
}

/// Split after `.`, `!` or `?` followed by whitespace.
pub fn split_sentences(text: &str) -> Vec<String> {
    split_sentences_inner(text, false)
}

/// Sentence splitting that keeps common abbreviations ("e.g.", "U.S.",
/// "Dr.") attached to their sentence.
pub fn split_sentences_abbreviation_aware(text: &str) -> Vec<String> {
    split_sentences_inner(text, true)
}

fn split_sentences_inner(text: &str, skip_abbreviations: bool) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut sentences = Vec::new();
    let mut start = 0;

    for i in 0..chars.len() {
        let c = chars[i];
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let followed_by_space = chars.get(i + 1).is_some_and(|next| next.is_whitespace());
        if !followed_by_space {
            continue;
        }
        if skip_abbreviations && c == '.' && is_abbreviation_ending(&chars, i) {
            continue;
        }

        let sentence: String = chars[start..=i].iter().collect();
        let sentence = sentence.trim();
        if !sentence.is_empty() {
            sentences.push(sentence.to_string());
        }
        start = i + 1;
    }

    if start < chars.len() {
        let tail: String = chars[start..].iter().collect();
        let tail = tail.trim();
        if !tail.is_empty() {
            sentences.push(tail.to_string());
        }
    }

    sentences
}

/// Heuristics for a period that ends an abbreviation rather than a
/// sentence: a letter-dot-letter run ("e.g.", "U.S.") or a capitalized
/// two-letter honorific ("Dr.", "Mr.").
fn is_abbreviation_ending(chars: &[char], period: usize) -> bool {
    // letter '.' letter '.' — the second period of "e.g." / "U.S."
    if period >= 3
        && chars[period - 1].is_alphabetic()
        && chars[period - 2] == '.'
        && chars[period - 3].is_alphabetic()
    {
        return true;
    }

    // "Dr." / "Mr." — uppercase, lowercase, period
    if period >= 2 && chars[period - 1].is_lowercase() && chars[period - 2].is_uppercase() {
        let word_start = period < 3 || !chars[period - 3].is_alphabetic();
        if word_start {
            return true;
        }
    }

    false
}

/// cl100k_base tokenizer used by the semantic engine; its dimensioning
/// matches the embedding model's own. The paragraph engine sticks to
/// [`estimate_tokens`] — one counting method per run, never mixed.
pub struct BpeCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl BpeCounter {
    pub fn new() -> Result<Self, AppError> {
        let bpe = tiktoken_rs::cl100k_base()
            .map_err(|e| AppError::InternalError(format!("failed to load tokenizer: {e}")))?;
        Ok(Self { bpe })
    }

    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}
