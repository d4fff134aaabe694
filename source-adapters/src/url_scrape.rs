use std::collections::{HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use url::Url;

use common::storage::types::document::{JsonMap, RawDocument, SourceKind};

use crate::error::{classify_request_error, classify_status, SourceError};
use crate::params::SourceParams;
use crate::robots::RobotsPolicy;
use crate::sitemap::{parse_sitemap, SitemapDocument};
use crate::SourceAdapter;

const KIND: SourceKind = SourceKind::UrlScrape;

const DEFAULT_USER_AGENT: &str = "rake-ingest/1.0";
/// 10 MiB cap applied before parsing.
const DEFAULT_MAX_CONTENT_SIZE: usize = 10 * 1024 * 1024;
const DEFAULT_MAX_PAGES: u64 = 10;

/// Containers likely to hold the main content, in preference order.
const CONTENT_SELECTORS: [&str; 8] = [
    "article",
    "main",
    r#"[role="main"]"#,
    ".content",
    "#content",
    ".post-content",
    ".article-content",
    ".entry-content",
];

/// Elements whose text never belongs in extracted content.
const EXCLUDED_TAGS: [&str; 8] = [
    "script", "style", "nav", "header", "footer", "aside", "iframe", "noscript",
];

fn static_selector(selector: &str) -> Selector {
    #[allow(clippy::expect_used)]
    Selector::parse(selector).expect("static selector must parse")
}

/// Web page scraper with per-host rate limiting and robots.txt compliance.
pub struct UrlScrapeAdapter {
    client: reqwest::Client,
    user_agent: String,
    rate_limit_delay: Duration,
    max_content_size: usize,
    respect_robots: bool,
    last_request_by_host: Mutex<HashMap<String, Instant>>,
}

impl UrlScrapeAdapter {
    pub fn new(rate_limit_delay_secs: f64, respect_robots: bool) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .user_agent(DEFAULT_USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SourceError::permanent(KIND, format!("failed to build client: {e}")))?;

        Ok(Self {
            client,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            rate_limit_delay: Duration::from_secs_f64(rate_limit_delay_secs),
            max_content_size: DEFAULT_MAX_CONTENT_SIZE,
            respect_robots,
            last_request_by_host: Mutex::new(HashMap::new()),
        })
    }

    fn parse_url(raw: &str) -> Result<Url, SourceError> {
        let parsed = Url::parse(raw)
            .map_err(|e| SourceError::validation(KIND, format!("invalid URL '{raw}': {e}")))?;
        if parsed.scheme() != "http" && parsed.scheme() != "https" {
            return Err(SourceError::validation(
                KIND,
                format!("URL must use http or https: {raw}"),
            ));
        }
        Ok(parsed)
    }

    /// Enforce `rate_limit_delay` between requests to the same host.
    async fn rate_limit(&self, url: &Url) {
        let host = url.host_str().unwrap_or_default().to_string();
        let mut by_host = self.last_request_by_host.lock().await;

        if let Some(previous) = by_host.get(&host) {
            let elapsed = previous.elapsed();
            if elapsed < self.rate_limit_delay {
                tokio::time::sleep(self.rate_limit_delay - elapsed).await;
            }
        }
        by_host.insert(host, Instant::now());
    }

    /// Whether robots.txt allows fetching `url`. Unreachable or missing
    /// robots.txt is treated permissively.
    async fn robots_allows(&self, url: &Url) -> bool {
        if !self.respect_robots {
            return true;
        }

        let Some(host) = url.host_str() else {
            return true;
        };
        let robots_url = format!("{}://{host}/robots.txt", url.scheme());

        let policy = match Url::parse(&robots_url) {
            Ok(robots) => {
                self.rate_limit(&robots).await;
                match self.client.get(robots.clone()).send().await {
                    Ok(response) if response.status().is_success() => match response.text().await {
                        Ok(body) => RobotsPolicy::parse(&body, &self.user_agent),
                        Err(_) => RobotsPolicy::allow_all(),
                    },
                    Ok(_) => RobotsPolicy::allow_all(),
                    Err(e) => {
                        warn!(url = %robots_url, error = %e, "failed to check robots.txt, allowing");
                        RobotsPolicy::allow_all()
                    }
                }
            }
            Err(_) => RobotsPolicy::allow_all(),
        };

        let allowed = policy.is_allowed(url.path());
        if !allowed {
            warn!(url = %url, "URL disallowed by robots.txt");
        }
        allowed
    }

    /// Fetch one page and extract its text and metadata.
    async fn fetch_page(&self, url: &Url) -> Result<(String, JsonMap), SourceError> {
        self.rate_limit(url).await;

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| classify_request_error(KIND, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(KIND, status, url.as_str()));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let body = response
            .text()
            .await
            .map_err(|e| classify_request_error(KIND, &e))?;

        if body.len() > self.max_content_size {
            return Err(SourceError::permanent(
                KIND,
                format!(
                    "page body of {} bytes exceeds limit of {} bytes: {url}",
                    body.len(),
                    self.max_content_size
                ),
            ));
        }

        let mut metadata = extract_metadata(&body);
        metadata.insert("url".to_string(), json!(url.as_str()));
        metadata.insert("status_code".to_string(), json!(status.as_u16()));
        metadata.insert("content_type".to_string(), json!(content_type));
        metadata.insert("content_length".to_string(), json!(body.len()));

        let content = extract_main_content(&body);

        debug!(
            %url,
            content_chars = content.len(),
            title = metadata.get("title").and_then(|v| v.as_str()).unwrap_or(""),
            "page scraped"
        );

        Ok((content, metadata))
    }

    /// Resolve the sitemap into a page list, following one level of
    /// sitemap-index indirection.
    async fn sitemap_pages(&self, sitemap_url: &Url, max_pages: usize) -> Result<Vec<String>, SourceError> {
        let body = self.fetch_sitemap_body(sitemap_url).await?;

        match parse_sitemap(&body, max_pages)
            .map_err(|e| SourceError::permanent(KIND, format!("failed to parse sitemap: {e}")))?
        {
            SitemapDocument::UrlSet(urls) => Ok(urls),
            SitemapDocument::Index(children) => {
                let mut pages = Vec::new();
                for child in children {
                    if pages.len() >= max_pages {
                        break;
                    }
                    let Ok(child_url) = Url::parse(&child) else {
                        continue;
                    };
                    match self.fetch_sitemap_body(&child_url).await {
                        Ok(child_body) => {
                            if let Ok(SitemapDocument::UrlSet(urls)) =
                                parse_sitemap(&child_body, max_pages - pages.len())
                            {
                                pages.extend(urls);
                            }
                        }
                        Err(e) => {
                            warn!(url = %child, error = %e, "failed to fetch child sitemap, skipping");
                        }
                    }
                }
                Ok(pages)
            }
        }
    }

    async fn fetch_sitemap_body(&self, url: &Url) -> Result<String, SourceError> {
        self.rate_limit(url).await;

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| classify_request_error(KIND, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(KIND, status, url.as_str()));
        }

        response
            .text()
            .await
            .map_err(|e| classify_request_error(KIND, &e))
    }
}

#[async_trait]
impl SourceAdapter for UrlScrapeAdapter {
    fn kind(&self) -> SourceKind {
        KIND
    }

    async fn validate(&self, params: &SourceParams) -> Result<(), SourceError> {
        let url = params.get_str("url");
        let sitemap_url = params.get_str("sitemap_url");

        if url.is_none() && sitemap_url.is_none() {
            return Err(SourceError::validation(
                KIND,
                "either 'url' or 'sitemap_url' parameter is required",
            ));
        }

        if let Some(url) = url {
            Self::parse_url(url)?;
        }
        if let Some(sitemap_url) = sitemap_url {
            Self::parse_url(sitemap_url)?;
        }

        Ok(())
    }

    async fn fetch(&self, params: &SourceParams) -> Result<Vec<RawDocument>, SourceError> {
        self.validate(params).await?;

        // Prevents duplicate fetches within one job
        let mut visited: HashSet<String> = HashSet::new();
        let mut documents = Vec::new();

        if let Some(sitemap_url) = params.get_str("sitemap_url") {
            let sitemap_url = Self::parse_url(sitemap_url)?;
            let max_pages = params.get_u64("max_pages").unwrap_or(DEFAULT_MAX_PAGES) as usize;

            let pages = self.sitemap_pages(&sitemap_url, max_pages).await?;
            info!(sitemap = %sitemap_url, pages = pages.len(), "sitemap resolved");

            for page in pages {
                let Ok(page_url) = Url::parse(&page) else {
                    warn!(url = %page, "invalid URL in sitemap, skipping");
                    continue;
                };

                // Blocked pages are skipped in sitemap mode
                if !self.robots_allows(&page_url).await {
                    continue;
                }
                if !visited.insert(page_url.to_string()) {
                    continue;
                }

                match self.fetch_page(&page_url).await {
                    Ok((content, mut metadata)) if !content.trim().is_empty() => {
                        metadata.insert("from_sitemap".to_string(), json!(true));
                        metadata.insert("sitemap_url".to_string(), json!(sitemap_url.as_str()));

                        match RawDocument::new(
                            KIND,
                            content,
                            Some(page_url.to_string()),
                            metadata,
                            None,
                        ) {
                            Ok(doc) => documents.push(doc),
                            Err(e) => warn!(url = %page_url, error = %e, "discarding page"),
                        }
                    }
                    Ok(_) => warn!(url = %page_url, "page produced no text, skipping"),
                    Err(e) => {
                        warn!(url = %page_url, error = %e, "failed to fetch page from sitemap")
                    }
                }
            }
        } else if let Some(url) = params.get_str("url") {
            let url = Self::parse_url(url)?;

            // A blocked single URL is an error, not a skip
            if !self.robots_allows(&url).await {
                return Err(SourceError::permanent(
                    KIND,
                    format!("URL disallowed by robots.txt: {url}"),
                ));
            }

            visited.insert(url.to_string());
            let (content, metadata) = self.fetch_page(&url).await?;
            let doc = RawDocument::new(KIND, content, Some(url.to_string()), metadata, None)
                .map_err(|e| SourceError::permanent(KIND, e.to_string()))?;
            documents.push(doc);
        }

        if documents.is_empty() {
            return Err(SourceError::permanent(
                KIND,
                "no documents were successfully fetched",
            ));
        }

        info!(documents = documents.len(), "URL scrape complete");
        Ok(documents)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Title, meta description/author/keywords, Open Graph fields, canonical
/// link and document language.
fn extract_metadata(html: &str) -> JsonMap {
    let document = Html::parse_document(html);
    let mut metadata = JsonMap::new();

    if let Some(title) = document.select(&static_selector("title")).next() {
        let text = title.text().collect::<String>().trim().to_string();
        if !text.is_empty() {
            metadata.insert("title".to_string(), json!(text));
        }
    }

    for meta in document.select(&static_selector("meta")) {
        let name = meta.value().attr("name").unwrap_or_default().to_lowercase();
        let property = meta
            .value()
            .attr("property")
            .unwrap_or_default()
            .to_lowercase();
        let Some(content) = meta.value().attr("content") else {
            continue;
        };

        if name == "description" || property == "og:description" {
            metadata.insert("description".to_string(), json!(content));
        } else if name == "author" {
            metadata.insert("author".to_string(), json!(content));
        } else if name == "keywords" {
            metadata.insert("keywords".to_string(), json!(content));
        } else if property == "og:title" {
            metadata
                .entry("title".to_string())
                .or_insert_with(|| json!(content));
        } else if property == "og:type" {
            metadata.insert("type".to_string(), json!(content));
        } else if name.contains("published_time") || property.contains("published_time") {
            metadata.insert("published_date".to_string(), json!(content));
        }
    }

    if let Some(canonical) = document
        .select(&static_selector(r#"link[rel="canonical"]"#))
        .next()
        .and_then(|link| link.value().attr("href"))
    {
        metadata.insert("canonical_url".to_string(), json!(canonical));
    }

    if let Some(lang) = document
        .select(&static_selector("html"))
        .next()
        .and_then(|html| html.value().attr("lang"))
    {
        metadata.insert("language".to_string(), json!(lang));
    }

    metadata
}

/// Main-content selection: try the preferred containers in order, fall
/// back to `<body>`, then to the whole document.
fn extract_main_content(html: &str) -> String {
    let document = Html::parse_document(html);

    for selector in CONTENT_SELECTORS {
        if let Some(element) = document.select(&static_selector(selector)).next() {
            return visible_text(element);
        }
    }

    if let Some(body) = document.select(&static_selector("body")).next() {
        return visible_text(body);
    }

    visible_text(document.root_element())
}

/// Visible text of a full HTML document with boilerplate elements
/// stripped. Shared with the SEC adapter for filing bodies.
pub(crate) fn visible_text_of_document(html: &str) -> String {
    let document = Html::parse_document(html);
    if let Some(body) = document.select(&static_selector("body")).next() {
        visible_text(body)
    } else {
        visible_text(document.root_element())
    }
}

/// Text of `element` with excluded subtrees removed, one line per text
/// node, blank lines dropped.
fn visible_text(element: ElementRef<'_>) -> String {
    let mut lines: Vec<String> = Vec::new();
    collect_visible(element, &mut lines);
    lines.join("\n")
}

fn collect_visible(element: ElementRef<'_>, out: &mut Vec<String>) {
    if EXCLUDED_TAGS.contains(&element.value().name()) {
        return;
    }

    for child in element.children() {
        if let Some(child_element) = ElementRef::wrap(child) {
            collect_visible(child_element, out);
        } else if let Some(text) = child.value().as_text() {
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                out.push(trimmed.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head>
  <title>Example Article</title>
  <meta name="description" content="A page about things">
  <meta name="author" content="Jane Writer">
  <meta name="keywords" content="things, stuff">
  <meta property="og:type" content="article">
  <meta property="article:published_time" content="2025-01-15T10:00:00Z">
  <link rel="canonical" href="https://example.com/article">
  <script>var tracked = true;</script>
</head>
<body>
  <nav>Home | About</nav>
  <header>Site header</header>
  <article>
    <h1>The Actual Headline</h1>
    <p>First paragraph of the article.</p>
    <script>console.log("inline");</script>
    <p>Second paragraph.</p>
  </article>
  <aside>Related links</aside>
  <footer>Copyright</footer>
</body>
</html>"#;

    #[test]
    fn extracts_metadata_fields() {
        let metadata = extract_metadata(PAGE);

        assert_eq!(
            metadata.get("title").and_then(|v| v.as_str()),
            Some("Example Article")
        );
        assert_eq!(
            metadata.get("description").and_then(|v| v.as_str()),
            Some("A page about things")
        );
        assert_eq!(
            metadata.get("author").and_then(|v| v.as_str()),
            Some("Jane Writer")
        );
        assert_eq!(
            metadata.get("type").and_then(|v| v.as_str()),
            Some("article")
        );
        assert_eq!(
            metadata.get("published_date").and_then(|v| v.as_str()),
            Some("2025-01-15T10:00:00Z")
        );
        assert_eq!(
            metadata.get("canonical_url").and_then(|v| v.as_str()),
            Some("https://example.com/article")
        );
        assert_eq!(
            metadata.get("language").and_then(|v| v.as_str()),
            Some("en")
        );
    }

    #[test]
    fn og_title_fills_in_missing_title() {
        let html = r#"<html><head><meta property="og:title" content="OG Title"></head><body></body></html>"#;
        let metadata = extract_metadata(html);
        assert_eq!(
            metadata.get("title").and_then(|v| v.as_str()),
            Some("OG Title")
        );
    }

    #[test]
    fn prefers_article_over_body() {
        let content = extract_main_content(PAGE);

        assert!(content.contains("The Actual Headline"));
        assert!(content.contains("First paragraph of the article."));
        assert!(content.contains("Second paragraph."));
        // Chrome outside <article> is gone
        assert!(!content.contains("Home | About"));
        assert!(!content.contains("Copyright"));
        // Script bodies never leak into content
        assert!(!content.contains("console.log"));
    }

    #[test]
    fn falls_back_to_body_without_content_container() {
        let html = r#"<html><body><nav>menu</nav><p>Plain body text.</p><script>x()</script></body></html>"#;
        let content = extract_main_content(html);
        assert_eq!(content, "Plain body text.");
    }

    #[test]
    fn class_selector_cascade_is_honored() {
        let html = r#"<html><body>
            <div class="content"><p>Div content here.</p></div>
            <p>Stray text.</p>
        </body></html>"#;
        let content = extract_main_content(html);
        assert_eq!(content, "Div content here.");
    }

    #[tokio::test]
    async fn validate_requires_url_or_sitemap() {
        let adapter = UrlScrapeAdapter::new(0.1, true).unwrap();
        assert!(adapter.validate(&SourceParams::default()).await.is_err());

        let mut params = SourceParams::default();
        params.set("url", json!("ftp://example.com/file"));
        assert!(adapter.validate(&params).await.is_err());

        params.set("url", json!("https://example.com/page"));
        assert!(adapter.validate(&params).await.is_ok());

        let mut params = SourceParams::default();
        params.set("sitemap_url", json!("https://example.com/sitemap.xml"));
        assert!(adapter.validate(&params).await.is_ok());
    }

    #[tokio::test]
    async fn per_host_rate_limit_spaces_same_host_only() {
        let adapter = UrlScrapeAdapter::new(0.2, false).unwrap();
        let a = Url::parse("https://example.com/a").unwrap();
        let b = Url::parse("https://other.example.org/b").unwrap();

        let started = std::time::Instant::now();
        adapter.rate_limit(&a).await;
        adapter.rate_limit(&b).await;
        // Different hosts do not wait on each other
        assert!(started.elapsed() < Duration::from_millis(150));

        let started = std::time::Instant::now();
        adapter.rate_limit(&a).await;
        assert!(started.elapsed() >= Duration::from_millis(150));
    }
}
