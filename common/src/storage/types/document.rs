use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::AppError;

/// Opaque metadata travelling with a document through the pipeline.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;

/// Which adapter produced a document.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    FileUpload,
    SecEdgar,
    UrlScrape,
    ApiFetch,
    DatabaseQuery,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::FileUpload => "file_upload",
            Self::SecEdgar => "sec_edgar",
            Self::UrlScrape => "url_scrape",
            Self::ApiFetch => "api_fetch",
            Self::DatabaseQuery => "database_query",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file_upload" => Ok(Self::FileUpload),
            "sec_edgar" => Ok(Self::SecEdgar),
            "url_scrape" => Ok(Self::UrlScrape),
            "api_fetch" => Ok(Self::ApiFetch),
            "database_query" => Ok(Self::DatabaseQuery),
            other => Err(AppError::Validation(format!(
                "unknown source kind: {other}"
            ))),
        }
    }
}

fn short_id(prefix: &str) -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("{prefix}-{}", &hex[..12])
}

/// A document exactly as an adapter fetched it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawDocument {
    pub id: String,
    pub source_kind: SourceKind,
    pub url: Option<String>,
    pub content: String,
    pub metadata: JsonMap,
    pub fetched_at: DateTime<Utc>,
    pub tenant_id: Option<String>,
}

impl RawDocument {
    pub fn new(
        source_kind: SourceKind,
        content: String,
        url: Option<String>,
        metadata: JsonMap,
        tenant_id: Option<String>,
    ) -> Result<Self, AppError> {
        if content.trim().is_empty() {
            return Err(AppError::Validation(
                "document content must not be empty".to_string(),
            ));
        }

        Ok(Self {
            id: short_id("doc"),
            source_kind,
            url,
            content,
            metadata,
            fetched_at: Utc::now(),
            tenant_id,
        })
    }
}

/// Output of the clean stage. Same identity as the raw document.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CleanedDocument {
    pub id: String,
    pub source_kind: SourceKind,
    pub content: String,
    pub metadata: JsonMap,
    pub word_count: usize,
    pub char_count: usize,
    pub cleaned_at: DateTime<Utc>,
    pub tenant_id: Option<String>,
}

/// A token-bounded segment of a cleaned document.
///
/// `start_char`/`end_char` describe the chunk's span within the cleaned
/// content. They are best-effort and drift when large segments are
/// hard-split or overlap is applied.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub content: String,
    pub metadata: JsonMap,
    pub position: usize,
    pub token_count: usize,
    pub start_char: usize,
    pub end_char: usize,
    pub created_at: DateTime<Utc>,
    pub tenant_id: Option<String>,
}

impl Chunk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        document_id: String,
        content: String,
        metadata: JsonMap,
        position: usize,
        token_count: usize,
        start_char: usize,
        end_char: usize,
        tenant_id: Option<String>,
    ) -> Result<Self, AppError> {
        if content.is_empty() {
            return Err(AppError::Validation(
                "chunk content must not be empty".to_string(),
            ));
        }
        if token_count == 0 {
            return Err(AppError::Validation(
                "chunk token_count must be at least 1".to_string(),
            ));
        }
        if end_char <= start_char {
            return Err(AppError::Validation(format!(
                "chunk end_char ({end_char}) must be greater than start_char ({start_char})"
            )));
        }

        Ok(Self {
            id: short_id("chunk"),
            document_id,
            content,
            metadata,
            position,
            token_count,
            start_char,
            end_char,
            created_at: Utc::now(),
            tenant_id,
        })
    }
}

/// A fixed-length vector representing one chunk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Embedding {
    pub id: String,
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub model: String,
    pub metadata: JsonMap,
    pub created_at: DateTime<Utc>,
    pub tenant_id: Option<String>,
}

impl Embedding {
    pub fn new(
        chunk_id: String,
        vector: Vec<f32>,
        model: String,
        metadata: JsonMap,
        tenant_id: Option<String>,
    ) -> Self {
        Self {
            id: short_id("emb"),
            chunk_id,
            vector,
            model,
            metadata,
            created_at: Utc::now(),
            tenant_id,
        }
    }
}

/// Per-document summary produced by the store stage, one per distinct
/// `document_id` in the embedding batch.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StoredDocument {
    pub id: String,
    pub source_kind: SourceKind,
    pub url: Option<String>,
    pub chunk_count: usize,
    pub embedding_count: usize,
    pub status: String,
    pub tenant_id: Option<String>,
    pub stored_at: DateTime<Utc>,
}

/// Declared vector dimension per embedding model.
pub fn embedding_dimension(model: &str) -> usize {
    match model {
        "text-embedding-3-large" => 3072,
        // text-embedding-3-small and text-embedding-ada-002
        _ => 1536,
    }
}
