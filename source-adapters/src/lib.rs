#![allow(clippy::missing_docs_in_private_items, clippy::result_large_err)]

pub mod api_fetch;
pub mod database_query;
pub mod error;
pub mod file_upload;
pub mod params;
pub mod robots;
pub mod sec_edgar;
pub mod sitemap;
pub mod url_scrape;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use common::storage::types::document::{RawDocument, SourceKind};
use common::telemetry::TelemetrySink;
use common::utils::config::AppConfig;
use common::utils::retry::{retry_with_backoff, RetryContext, RetryPolicy};

use crate::api_fetch::ApiFetchAdapter;
use crate::database_query::DatabaseQueryAdapter;
use crate::error::SourceError;
use crate::file_upload::FileUploadAdapter;
use crate::params::SourceParams;
use crate::sec_edgar::SecEdgarAdapter;
use crate::url_scrape::UrlScrapeAdapter;

/// Capability set every source implements.
///
/// `validate` runs synchronously before any work begins; `fetch` may
/// suspend on network or disk I/O and returns at least one document on
/// success; `health_check` is a cheap liveness probe; `close` releases
/// held resources (HTTP clients, connection pools).
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn kind(&self) -> SourceKind;

    async fn validate(&self, params: &SourceParams) -> Result<(), SourceError>;

    async fn fetch(&self, params: &SourceParams) -> Result<Vec<RawDocument>, SourceError>;

    async fn health_check(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

/// Validate once, then fetch under the retry harness. Only transient
/// failures are retried; validation and permanent failures surface
/// immediately.
pub async fn fetch_with_retry(
    adapter: &dyn SourceAdapter,
    params: &SourceParams,
    policy: RetryPolicy,
    ctx: &RetryContext,
    telemetry: &TelemetrySink,
) -> Result<Vec<RawDocument>, SourceError> {
    adapter.validate(params).await?;

    retry_with_backoff(
        policy,
        ctx,
        telemetry,
        SourceError::is_retriable,
        || adapter.fetch(params),
    )
    .await
}

/// Maps a source kind to its constructed adapter. Built once at startup;
/// each worker shares the same instances.
pub struct AdapterRegistry {
    adapters: HashMap<SourceKind, Arc<dyn SourceAdapter>>,
}

impl AdapterRegistry {
    pub fn from_config(config: &AppConfig) -> Result<Self, SourceError> {
        let mut adapters: HashMap<SourceKind, Arc<dyn SourceAdapter>> = HashMap::new();

        adapters.insert(
            SourceKind::FileUpload,
            Arc::new(FileUploadAdapter::new(FileUploadAdapter::DEFAULT_MAX_FILE_SIZE)),
        );
        adapters.insert(
            SourceKind::UrlScrape,
            Arc::new(UrlScrapeAdapter::new(
                config.url_scrape_rate_limit,
                config.url_scrape_respect_robots,
            )?),
        );
        adapters.insert(SourceKind::ApiFetch, Arc::new(ApiFetchAdapter::new()?));
        adapters.insert(
            SourceKind::DatabaseQuery,
            Arc::new(DatabaseQueryAdapter::new(config.db_query_read_only)),
        );

        // SEC EDGAR is only registered when a compliant User-Agent is
        // configured; the constructor enforces the contact requirement.
        if let Some(user_agent) = &config.sec_edgar_user_agent {
            adapters.insert(
                SourceKind::SecEdgar,
                Arc::new(SecEdgarAdapter::new(user_agent, config.sec_edgar_rate_limit)?),
            );
        }

        info!(
            sources = ?adapters.keys().map(|k| k.as_str()).collect::<Vec<_>>(),
            "source adapters registered"
        );

        Ok(Self { adapters })
    }

    pub fn resolve(&self, kind: SourceKind) -> Option<Arc<dyn SourceAdapter>> {
        self.adapters.get(&kind).map(Arc::clone)
    }

    pub fn available(&self) -> Vec<SourceKind> {
        self.adapters.keys().copied().collect()
    }

    pub async fn close_all(&self) {
        for adapter in self.adapters.values() {
            adapter.close().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::types::document::JsonMap;

    struct FlakyAdapter {
        failures_before_success: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl SourceAdapter for FlakyAdapter {
        fn kind(&self) -> SourceKind {
            SourceKind::ApiFetch
        }

        async fn validate(&self, _params: &SourceParams) -> Result<(), SourceError> {
            Ok(())
        }

        async fn fetch(&self, _params: &SourceParams) -> Result<Vec<RawDocument>, SourceError> {
            use std::sync::atomic::Ordering;
            if self.failures_before_success.load(Ordering::SeqCst) > 0 {
                self.failures_before_success.fetch_sub(1, Ordering::SeqCst);
                return Err(SourceError::transient(self.kind(), "connection reset"));
            }
            Ok(vec![RawDocument::new(
                self.kind(),
                "payload".to_string(),
                None,
                JsonMap::new(),
                None,
            )
            .map_err(|e| SourceError::permanent(self.kind(), e.to_string()))?])
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: std::time::Duration::from_millis(1),
            multiplier: 2.0,
            max_delay: std::time::Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn fetch_with_retry_recovers_from_transient() {
        let adapter = FlakyAdapter {
            failures_before_success: std::sync::atomic::AtomicU32::new(2),
        };
        let ctx = RetryContext::new("job-1", "fetch", "trace-1", None);

        let docs = fetch_with_retry(
            &adapter,
            &SourceParams::default(),
            fast_policy(),
            &ctx,
            &TelemetrySink::disabled(),
        )
        .await
        .expect("fetch should succeed after retries");

        assert_eq!(docs.len(), 1);
    }

    #[tokio::test]
    async fn fetch_with_retry_exhausts_attempts() {
        let adapter = FlakyAdapter {
            failures_before_success: std::sync::atomic::AtomicU32::new(10),
        };
        let ctx = RetryContext::new("job-1", "fetch", "trace-1", None);

        let result = fetch_with_retry(
            &adapter,
            &SourceParams::default(),
            fast_policy(),
            &ctx,
            &TelemetrySink::disabled(),
        )
        .await;

        assert!(result.is_err());
    }
}
