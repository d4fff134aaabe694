use std::time::Instant;

use regex::Regex;
use serde_json::json;
use tracing::{info, instrument, warn};
use unicode_normalization::UnicodeNormalization;

use common::error::AppError;
use common::storage::types::document::{CleanedDocument, JsonMap, RawDocument};
use common::telemetry::TelemetrySink;

use super::StageError;

const STAGE: &str = "clean";

/// Text-normalization switches.
#[derive(Debug, Clone)]
pub struct CleanConfig {
    pub remove_urls: bool,
    pub remove_emails: bool,
    pub normalize_whitespace: bool,
    pub normalize_unicode: bool,
    /// Documents shorter than this after cleaning are logged but kept.
    pub min_content_length: usize,
}

impl Default for CleanConfig {
    fn default() -> Self {
        Self {
            remove_urls: false,
            remove_emails: false,
            normalize_whitespace: true,
            normalize_unicode: true,
            min_content_length: 10,
        }
    }
}

/// Stage 2: normalize raw text and compute per-document statistics.
pub struct CleanStage {
    config: CleanConfig,
    telemetry: TelemetrySink,
    url_pattern: Regex,
    email_pattern: Regex,
    excess_newlines: Regex,
    repeated_spaces: Regex,
}

impl CleanStage {
    pub fn new(config: CleanConfig, telemetry: TelemetrySink) -> Result<Self, AppError> {
        let compile = |pattern: &str| {
            Regex::new(pattern)
                .map_err(|e| AppError::InternalError(format!("invalid clean pattern: {e}")))
        };

        Ok(Self {
            config,
            telemetry,
            url_pattern: compile(r"https?://\S+")?,
            email_pattern: compile(r"\b[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}\b")?,
            excess_newlines: compile(r"\n{3,}")?,
            repeated_spaces: compile(r" {2,}")?,
        })
    }

    /// Normalization steps, in order: NFKC, optional URL/email removal,
    /// newline normalization, whitespace collapse, outer trim. Applying
    /// the result a second time is a no-op.
    pub fn clean_text(&self, text: &str) -> String {
        let mut text: String = if self.config.normalize_unicode {
            text.nfkc().collect()
        } else {
            text.to_string()
        };

        if self.config.remove_urls {
            text = self.url_pattern.replace_all(&text, "").into_owned();
        }
        if self.config.remove_emails {
            text = self.email_pattern.replace_all(&text, "").into_owned();
        }

        text = text.replace("\r\n", "\n").replace('\r', "\n");
        text = self.excess_newlines.replace_all(&text, "\n\n").into_owned();

        if self.config.normalize_whitespace {
            text = self.repeated_spaces.replace_all(&text, " ").into_owned();
            text = text
                .lines()
                .map(str::trim)
                .collect::<Vec<_>>()
                .join("\n");
            // Line trimming can merge blank lines into longer runs
            text = self.excess_newlines.replace_all(&text, "\n\n").into_owned();
        }

        text.trim().to_string()
    }

    #[instrument(skip_all, fields(job_id = %job_id, correlation_id = %correlation_id))]
    pub async fn execute(
        &self,
        documents: Vec<RawDocument>,
        job_id: &str,
        correlation_id: &str,
        tenant_id: Option<&str>,
    ) -> Result<Vec<CleanedDocument>, StageError> {
        let started = Instant::now();
        let document_count = documents.len();

        let mut cleaned_documents = Vec::with_capacity(document_count);
        let mut total_original = 0usize;

        for document in documents {
            let original_length = document.content.chars().count();
            total_original += original_length;

            let content = self.clean_text(&document.content);
            let char_count = content.chars().count();
            let word_count = content.split_whitespace().count();

            if char_count < self.config.min_content_length {
                warn!(
                    document_id = %document.id,
                    content_length = char_count,
                    min_length = self.config.min_content_length,
                    "document content too short after cleaning"
                );
                // Kept anyway: downstream stages tolerate short documents
            }

            let reduction_percent = if original_length > 0 {
                ((1.0 - char_count as f64 / original_length as f64) * 10000.0).round() / 100.0
            } else {
                0.0
            };

            let mut metadata = document.metadata;
            metadata.insert("original_length".to_string(), json!(original_length));
            metadata.insert("cleaned_length".to_string(), json!(char_count));
            metadata.insert("reduction_percent".to_string(), json!(reduction_percent));

            cleaned_documents.push(CleanedDocument {
                id: document.id,
                source_kind: document.source_kind,
                content,
                metadata,
                word_count,
                char_count,
                cleaned_at: chrono::Utc::now(),
                tenant_id: document.tenant_id,
            });
        }

        let total_cleaned: usize = cleaned_documents.iter().map(|d| d.char_count).sum();
        let total_words: usize = cleaned_documents.iter().map(|d| d.word_count).sum();
        let avg_reduction = if total_original > 0 {
            ((1.0 - total_cleaned as f64 / total_original as f64) * 10000.0).round() / 100.0
        } else {
            0.0
        };

        let mut metadata = JsonMap::new();
        metadata.insert("document_count".to_string(), json!(cleaned_documents.len()));
        metadata.insert("total_original_chars".to_string(), json!(total_original));
        metadata.insert("total_cleaned_chars".to_string(), json!(total_cleaned));
        metadata.insert("total_words".to_string(), json!(total_words));
        metadata.insert("avg_reduction_percent".to_string(), json!(avg_reduction));

        self.telemetry
            .emit_phase_completed(
                job_id,
                STAGE,
                2,
                correlation_id,
                started.elapsed().as_secs_f64() * 1000.0,
                cleaned_documents.len(),
                tenant_id,
                Some(metadata),
            )
            .await;

        info!(
            documents = cleaned_documents.len(),
            total_words, "clean stage completed"
        );

        Ok(cleaned_documents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::document::SourceKind;

    fn stage(config: CleanConfig) -> CleanStage {
        CleanStage::new(config, TelemetrySink::disabled()).expect("stage")
    }

    fn raw(content: &str) -> RawDocument {
        RawDocument::new(
            SourceKind::FileUpload,
            content.to_string(),
            None,
            JsonMap::new(),
            Some("t1".to_string()),
        )
        .expect("raw document")
    }

    #[test]
    fn collapses_whitespace_and_newlines() {
        let stage = stage(CleanConfig::default());
        let cleaned = stage.clean_text("Hello    World\r\n\r\n\r\n\r\nNext  line\r\ndone  ");
        assert_eq!(cleaned, "Hello World\n\nNext line\ndone");
    }

    #[test]
    fn removes_urls_and_emails_when_enabled() {
        let stage = stage(CleanConfig {
            remove_urls: true,
            remove_emails: true,
            ..CleanConfig::default()
        });

        let cleaned =
            stage.clean_text("Visit https://example.com/page and mail test@example.com today.");
        assert!(!cleaned.contains("https://"));
        assert!(!cleaned.contains("test@example.com"));
        assert!(cleaned.contains("Visit"));
    }

    #[test]
    fn keeps_urls_by_default() {
        let stage = stage(CleanConfig::default());
        let cleaned = stage.clean_text("See https://example.com for details.");
        assert!(cleaned.contains("https://example.com"));
    }

    #[test]
    fn clean_is_idempotent() {
        let stage = stage(CleanConfig {
            remove_urls: true,
            remove_emails: true,
            ..CleanConfig::default()
        });

        let messy = "  Une  idée\u{2019}s   test\r\n\r\n\r\nwith https://example.com  \n  and text ";
        let once = stage.clean_text(messy);
        let twice = stage.clean_text(&once);
        assert_eq!(once, twice);
    }

    #[test]
    fn unicode_nfkc_applied() {
        let stage = stage(CleanConfig::default());
        // U+FB01 is the "fi" ligature; NFKC expands it
        let cleaned = stage.clean_text("ﬁle");
        assert_eq!(cleaned, "file");
    }

    #[tokio::test]
    async fn execute_enriches_metadata_and_counts() {
        let stage = stage(CleanConfig::default());
        let documents = vec![raw("Some   padded    content\n\n\n\nwith breaks")];

        let cleaned = stage
            .execute(documents, "job-1", "trace-1", Some("t1"))
            .await
            .expect("clean");

        assert_eq!(cleaned.len(), 1);
        let doc = &cleaned[0];
        assert_eq!(doc.content, "Some padded content\n\nwith breaks");
        assert_eq!(doc.word_count, 5);
        assert_eq!(doc.char_count, doc.content.chars().count());
        assert!(doc.metadata.contains_key("original_length"));
        assert!(doc.metadata.contains_key("cleaned_length"));
        assert!(doc.metadata.contains_key("reduction_percent"));
        assert_eq!(doc.tenant_id.as_deref(), Some("t1"));
    }

    #[tokio::test]
    async fn short_documents_are_kept_with_warning() {
        let stage = stage(CleanConfig::default());
        let cleaned = stage
            .execute(vec![raw("tiny")], "job-1", "trace-1", None)
            .await
            .expect("clean");

        // Logged as a warning but not dropped
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].content, "tiny");
    }
}
