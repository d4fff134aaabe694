use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info, warn};

use common::storage::types::document::{JsonMap, RawDocument, SourceKind};

use crate::error::{SourceError, SourceErrorKind};
use crate::params::SourceParams;
use crate::SourceAdapter;

const KIND: SourceKind = SourceKind::FileUpload;

const SUPPORTED_EXTENSIONS: [&str; 5] = ["pdf", "txt", "md", "docx", "pptx"];

/// Extraction seam for binary document formats. PDF is handled in-process;
/// DOCX/PPTX extraction is an external capability and the default
/// extractor reports them unsupported.
#[async_trait]
pub trait BinaryExtractor: Send + Sync {
    async fn extract(&self, path: &Path, extension: &str) -> Result<(String, JsonMap), SourceError>;
}

pub struct PdfTextExtractor;

#[async_trait]
impl BinaryExtractor for PdfTextExtractor {
    async fn extract(
        &self,
        path: &Path,
        extension: &str,
    ) -> Result<(String, JsonMap), SourceError> {
        if extension != "pdf" {
            return Err(SourceError::permanent(
                KIND,
                format!("no extractor available for .{extension} documents"),
            ));
        }

        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| SourceError::permanent(KIND, format!("failed to read file: {e}")))?;

        let extraction = tokio::task::spawn_blocking(move || {
            let page_count = lopdf::Document::load_mem(&bytes)
                .map(|doc| doc.get_pages().len())
                .ok();
            let text = pdf_extract::extract_text_from_mem(&bytes)
                .map(|s| s.trim().to_string())
                .map_err(|e| format!("PDF text extraction failed: {e}"));
            (text, page_count)
        })
        .await
        .map_err(|e| SourceError::permanent(KIND, format!("extraction task failed: {e}")))?;

        let (text, page_count) = extraction;
        let text = text.map_err(|e| SourceError::permanent(KIND, e))?;

        let mut metadata = JsonMap::new();
        if let Some(pages) = page_count {
            metadata.insert("page_count".to_string(), json!(pages));
        }

        Ok((text, metadata))
    }
}

/// Reads local files and produces one raw document per file.
pub struct FileUploadAdapter {
    max_file_size: u64,
    extractor: Arc<dyn BinaryExtractor>,
}

impl FileUploadAdapter {
    /// 50 MiB
    pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 * 1024 * 1024;

    pub fn new(max_file_size: u64) -> Self {
        Self {
            max_file_size,
            extractor: Arc::new(PdfTextExtractor),
        }
    }

    pub fn with_extractor(max_file_size: u64, extractor: Arc<dyn BinaryExtractor>) -> Self {
        Self {
            max_file_size,
            extractor,
        }
    }

    fn extension_of(path: &str) -> Option<String> {
        Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_lowercase)
    }

    /// Decode raw bytes trying UTF-8, then CP1252, then Latin-1. The last
    /// step cannot fail; CP1252 is preferred over Latin-1 because it maps
    /// the 0x80..0x9F range to printable characters.
    fn decode_text(bytes: &[u8]) -> (String, &'static str) {
        if let Ok(text) = std::str::from_utf8(bytes) {
            return (text.to_string(), "utf-8");
        }

        let (decoded, _, had_errors) = encoding_rs::WINDOWS_1252.decode(bytes);
        if !had_errors {
            return (decoded.into_owned(), "cp1252");
        }

        (
            encoding_rs::mem::decode_latin1(bytes).into_owned(),
            "latin-1",
        )
    }
}

#[async_trait]
impl SourceAdapter for FileUploadAdapter {
    fn kind(&self) -> SourceKind {
        KIND
    }

    async fn validate(&self, params: &SourceParams) -> Result<(), SourceError> {
        let file_path = params.require_str("file_path", KIND)?;

        let Some(extension) = Self::extension_of(file_path) else {
            return Err(SourceError::validation(
                KIND,
                format!("file has no extension: {file_path}"),
            ));
        };
        if !SUPPORTED_EXTENSIONS.contains(&extension.as_str()) {
            return Err(SourceError::validation(
                KIND,
                format!(
                    "unsupported file format .{extension}; supported: {}",
                    SUPPORTED_EXTENSIONS.join(", ")
                ),
            ));
        }

        let metadata = tokio::fs::metadata(file_path).await.map_err(|e| {
            SourceError::validation(KIND, format!("file not accessible: {file_path}: {e}"))
        })?;
        if !metadata.is_file() {
            return Err(SourceError::validation(
                KIND,
                format!("not a regular file: {file_path}"),
            ));
        }
        if metadata.len() > self.max_file_size {
            return Err(SourceError::validation(
                KIND,
                format!(
                    "file too large: {} bytes (max: {})",
                    metadata.len(),
                    self.max_file_size
                ),
            ));
        }

        Ok(())
    }

    async fn fetch(&self, params: &SourceParams) -> Result<Vec<RawDocument>, SourceError> {
        self.validate(params).await?;

        let file_path = params.require_str("file_path", KIND)?;
        let path = Path::new(file_path);
        let extension = Self::extension_of(file_path).unwrap_or_default();
        let file_size = tokio::fs::metadata(path)
            .await
            .map_err(|e| SourceError::permanent(KIND, format!("stat failed: {e}")))?
            .len();

        debug!(%file_path, %extension, file_size, "reading file");

        let mut metadata = JsonMap::new();
        metadata.insert(
            "filename".to_string(),
            json!(path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or(file_path)),
        );
        metadata.insert("file_extension".to_string(), json!(extension));
        metadata.insert("file_size_bytes".to_string(), json!(file_size));
        metadata.insert(
            "content_type".to_string(),
            json!(mime_guess::from_path(path).first_or_octet_stream().to_string()),
        );

        let content = match extension.as_str() {
            "txt" | "md" => {
                let bytes = tokio::fs::read(path).await.map_err(|e| {
                    SourceError::permanent(KIND, format!("failed to read file: {e}"))
                })?;
                let (text, encoding) = Self::decode_text(&bytes);
                metadata.insert("encoding".to_string(), json!(encoding));
                text
            }
            _ => {
                let (text, extractor_meta) = self.extractor.extract(path, &extension).await?;
                metadata.extend(extractor_meta);
                text
            }
        };

        if content.trim().is_empty() {
            warn!(%file_path, "file produced no text content");
            return Err(SourceError::permanent(
                KIND,
                format!("no text content extracted from {file_path}"),
            ));
        }

        let document = RawDocument::new(KIND, content, Some(file_path.to_string()), metadata, None)
            .map_err(|e| SourceError {
                kind: SourceErrorKind::Permanent,
                source_kind: KIND,
                message: e.to_string(),
            })?;

        info!(
            %file_path,
            document_id = %document.id,
            chars = document.content.len(),
            "file ingested"
        );

        Ok(vec![document])
    }

    async fn health_check(&self) -> bool {
        true
    }
}
