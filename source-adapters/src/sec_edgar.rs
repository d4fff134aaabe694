use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::Event;
use quick_xml::Reader;
use regex::Regex;
use serde_json::json;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use common::storage::types::document::{JsonMap, RawDocument, SourceKind};

use crate::error::{classify_request_error, classify_status, SourceError};
use crate::params::SourceParams;
use crate::url_scrape::visible_text_of_document;
use crate::SourceAdapter;

const KIND: SourceKind = SourceKind::SecEdgar;

const EDGAR_BASE_URL: &str = "https://www.sec.gov";
const EDGAR_BROWSE_URL: &str = "https://www.sec.gov/cgi-bin/browse-edgar";

const DEFAULT_FILING_COUNT: u64 = 10;
/// 10 MiB cap on a single filing document body.
const DEFAULT_MAX_FILING_SIZE: usize = 10 * 1024 * 1024;

/// Filing entry from the EDGAR company index.
#[derive(Debug, Default, Clone)]
struct FilingMeta {
    form_type: Option<String>,
    filing_date: Option<String>,
    accession_number: Option<String>,
    file_number: Option<String>,
    filing_href: Option<String>,
}

/// SEC EDGAR filings adapter.
///
/// EDGAR requires a User-Agent carrying contact information and fair
/// access pacing (at most 10 requests per second); the constructor
/// enforces the former and `rate_limit` the latter.
pub struct SecEdgarAdapter {
    client: reqwest::Client,
    user_agent: String,
    rate_limit_delay: Duration,
    max_filing_size: usize,
    last_request: Mutex<Option<Instant>>,
}

impl SecEdgarAdapter {
    pub fn new(user_agent: &str, rate_limit_delay_secs: f64) -> Result<Self, SourceError> {
        if !Self::user_agent_has_contact(user_agent) {
            return Err(SourceError::validation(
                KIND,
                format!(
                    "SEC EDGAR User-Agent must include an email address or website URL, got: '{user_agent}'"
                ),
            ));
        }

        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SourceError::permanent(KIND, format!("failed to build client: {e}")))?;

        Ok(Self {
            client,
            user_agent: user_agent.to_string(),
            rate_limit_delay: Duration::from_secs_f64(rate_limit_delay_secs),
            max_filing_size: DEFAULT_MAX_FILING_SIZE,
            last_request: Mutex::new(None),
        })
    }

    fn user_agent_has_contact(user_agent: &str) -> bool {
        #[allow(clippy::unwrap_used)]
        let email = Regex::new(r"[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}").unwrap();
        #[allow(clippy::unwrap_used)]
        let website = Regex::new(r"https?://\S+").unwrap();

        email.is_match(user_agent) || website.is_match(user_agent)
    }

    /// Space requests at least `rate_limit_delay` apart.
    async fn rate_limit(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.rate_limit_delay {
                tokio::time::sleep(self.rate_limit_delay - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    async fn get_text(&self, url: &str, query: &[(&str, String)]) -> Result<String, SourceError> {
        self.rate_limit().await;

        let response = self
            .client
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| classify_request_error(KIND, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(KIND, status, url));
        }

        response
            .text()
            .await
            .map_err(|e| classify_request_error(KIND, &e))
    }

    async fn cik_from_ticker(&self, ticker: &str) -> Result<String, SourceError> {
        info!(%ticker, "looking up CIK for ticker");

        let xml = self
            .get_text(
                EDGAR_BROWSE_URL,
                &[
                    ("action", "getcompany".to_string()),
                    ("ticker", ticker.to_string()),
                    ("output", "xml".to_string()),
                ],
            )
            .await?;

        parse_first_tag_text(&xml, "CIK").ok_or_else(|| {
            SourceError::permanent(KIND, format!("ticker '{ticker}' not found in SEC EDGAR"))
        })
    }

    async fn company_filings(
        &self,
        cik: &str,
        form_type: Option<&str>,
        count: u64,
    ) -> Result<(String, Vec<FilingMeta>), SourceError> {
        info!(%cik, form_type = form_type.unwrap_or(""), count, "fetching filings index");

        let xml = self
            .get_text(
                EDGAR_BROWSE_URL,
                &[
                    ("action", "getcompany".to_string()),
                    ("CIK", cik.to_string()),
                    ("type", form_type.unwrap_or("").to_string()),
                    ("dateb", String::new()),
                    ("owner", "exclude".to_string()),
                    ("count", count.to_string()),
                    ("output", "xml".to_string()),
                ],
            )
            .await?;

        let company_name =
            parse_first_tag_text(&xml, "companyName").unwrap_or_else(|| "Unknown".to_string());
        let filings = parse_filings(&xml);

        debug!(%cik, filings = filings.len(), "filings index parsed");

        Ok((company_name, filings))
    }

    /// Download one filing document and extract its visible text.
    async fn filing_content(&self, filing_url: &str) -> Result<String, SourceError> {
        let body = self.get_text(filing_url, &[]).await?;

        if body.len() > self.max_filing_size {
            return Err(SourceError::permanent(
                KIND,
                format!(
                    "filing body of {} bytes exceeds limit of {} bytes: {filing_url}",
                    body.len(),
                    self.max_filing_size
                ),
            ));
        }

        Ok(visible_text_of_document(&body))
    }
}

#[async_trait]
impl SourceAdapter for SecEdgarAdapter {
    fn kind(&self) -> SourceKind {
        KIND
    }

    async fn validate(&self, params: &SourceParams) -> Result<(), SourceError> {
        if params.get_str("cik").is_none() && params.get_str("ticker").is_none() {
            return Err(SourceError::validation(
                KIND,
                "either 'cik' or 'ticker' parameter is required",
            ));
        }

        if let Some(count) = params.get_u64("count") {
            if count == 0 || count > 100 {
                return Err(SourceError::validation(
                    KIND,
                    format!("'count' must be in 1..=100, got {count}"),
                ));
            }
        }

        Ok(())
    }

    async fn fetch(&self, params: &SourceParams) -> Result<Vec<RawDocument>, SourceError> {
        self.validate(params).await?;

        let cik = match params.get_str("cik") {
            Some(cik) => cik.to_string(),
            None => {
                let ticker = params.require_str("ticker", KIND)?;
                self.cik_from_ticker(ticker).await?
            }
        };
        let form_type = params.get_str("form_type");
        let count = params.get_u64("count").unwrap_or(DEFAULT_FILING_COUNT);

        let (company_name, filings) = self.company_filings(&cik, form_type, count).await?;

        if filings.is_empty() {
            return Err(SourceError::permanent(
                KIND,
                format!("no filings found for CIK {cik}"),
            ));
        }

        let mut documents = Vec::new();
        for filing in filings.iter().take(count as usize) {
            let Some(href) = &filing.filing_href else {
                continue;
            };

            match self.filing_content(href).await {
                Ok(content) if !content.trim().is_empty() => {
                    let mut metadata = JsonMap::new();
                    metadata.insert("company_name".to_string(), json!(company_name));
                    metadata.insert("cik".to_string(), json!(cik));
                    if let Some(form_type) = &filing.form_type {
                        metadata.insert("form_type".to_string(), json!(form_type));
                    }
                    if let Some(filing_date) = &filing.filing_date {
                        metadata.insert("filing_date".to_string(), json!(filing_date));
                    }
                    if let Some(accession) = &filing.accession_number {
                        metadata.insert("accession_number".to_string(), json!(accession));
                    }
                    if let Some(file_number) = &filing.file_number {
                        metadata.insert("file_number".to_string(), json!(file_number));
                    }

                    match RawDocument::new(KIND, content, Some(href.clone()), metadata, None) {
                        Ok(doc) => documents.push(doc),
                        Err(e) => warn!(url = %href, error = %e, "discarding filing"),
                    }
                }
                Ok(_) => {
                    warn!(url = %href, "filing produced no text, skipping");
                }
                Err(e) => {
                    warn!(url = %href, error = %e, "failed to fetch filing, skipping");
                }
            }
        }

        if documents.is_empty() {
            return Err(SourceError::permanent(
                KIND,
                format!("no filing documents could be retrieved for CIK {cik}"),
            ));
        }

        info!(
            %cik,
            company = %company_name,
            documents = documents.len(),
            "SEC EDGAR fetch complete"
        );

        Ok(documents)
    }

    async fn health_check(&self) -> bool {
        self.rate_limit().await;
        match self.client.get(EDGAR_BASE_URL).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}

/// First text content found under `tag`, anywhere in the document.
fn parse_first_tag_text(xml: &str, tag: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut inside = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                inside = start.local_name().as_ref() == tag.as_bytes();
            }
            Ok(Event::Text(text)) if inside => {
                if let Ok(value) = text.unescape() {
                    let value = value.trim().to_string();
                    if !value.is_empty() {
                        return Some(value);
                    }
                }
            }
            Ok(Event::End(_)) => inside = false,
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Collect `<filing>` entries with their child fields from the company
/// index XML.
fn parse_filings(xml: &str) -> Vec<FilingMeta> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut filings = Vec::new();
    let mut current: Option<FilingMeta> = None;
    let mut field: Option<String> = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(start)) => {
                let name = String::from_utf8_lossy(start.local_name().as_ref()).to_string();
                if name == "filing" {
                    current = Some(FilingMeta::default());
                } else if current.is_some() {
                    field = Some(name);
                }
            }
            Ok(Event::Text(text)) => {
                if let (Some(filing), Some(field_name)) = (current.as_mut(), field.as_deref()) {
                    let value = text.unescape().map(|v| v.trim().to_string()).ok();
                    match field_name {
                        "type" => filing.form_type = value,
                        "filingDate" => filing.filing_date = value,
                        "accessionNumber" => filing.accession_number = value,
                        "fileNumber" => filing.file_number = value,
                        "filingHref" => filing.filing_href = value,
                        _ => {}
                    }
                }
            }
            Ok(Event::End(end)) => {
                let name = String::from_utf8_lossy(end.local_name().as_ref()).to_string();
                if name == "filing" {
                    if let Some(filing) = current.take() {
                        filings.push(filing);
                    }
                } else {
                    field = None;
                }
            }
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    filings
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_requires_contact_in_user_agent() {
        assert!(SecEdgarAdapter::new("TestApp", 0.1).is_err());
        assert!(SecEdgarAdapter::new("TestApp admin@example.com", 0.1).is_ok());
        assert!(SecEdgarAdapter::new("TestApp https://example.com", 0.1).is_ok());
    }

    #[tokio::test]
    async fn validate_requires_cik_or_ticker() {
        let adapter = SecEdgarAdapter::new("Test admin@example.com", 0.1).unwrap();

        let err = adapter.validate(&SourceParams::default()).await.unwrap_err();
        assert!(err.message.contains("cik"));

        let mut params = SourceParams::default();
        params.set("ticker", json!("AAPL"));
        assert!(adapter.validate(&params).await.is_ok());

        let mut params = SourceParams::default();
        params.set("cik", json!("0000320193"));
        assert!(adapter.validate(&params).await.is_ok());
    }

    #[tokio::test]
    async fn validate_bounds_count() {
        let adapter = SecEdgarAdapter::new("Test admin@example.com", 0.1).unwrap();
        let mut params = SourceParams::default();
        params.set("cik", json!("123"));
        params.set("count", json!(0));
        assert!(adapter.validate(&params).await.is_err());
        params.set("count", json!(101));
        assert!(adapter.validate(&params).await.is_err());
        params.set("count", json!(10));
        assert!(adapter.validate(&params).await.is_ok());
    }

    #[test]
    fn parses_cik_from_lookup_xml() {
        let xml = r#"<companyInfo><name>Apple Inc</name><CIK>0000320193</CIK></companyInfo>"#;
        assert_eq!(
            parse_first_tag_text(xml, "CIK"),
            Some("0000320193".to_string())
        );
        assert_eq!(parse_first_tag_text(xml, "missing"), None);
    }

    #[test]
    fn parses_filing_entries() {
        let xml = r#"
<companyFilings>
  <companyInfo><companyName>Apple Inc</companyName><CIK>0000320193</CIK></companyInfo>
  <results>
    <filing>
      <type>10-K</type>
      <filingDate>2024-11-01</filingDate>
      <accessionNumber>0000320193-24-000123</accessionNumber>
      <fileNumber>001-36743</fileNumber>
      <filingHref>https://www.sec.gov/Archives/edgar/data/320193/idx.htm</filingHref>
    </filing>
    <filing>
      <type>10-Q</type>
      <filingDate>2024-08-02</filingDate>
      <accessionNumber>0000320193-24-000081</accessionNumber>
      <filingHref>https://www.sec.gov/Archives/edgar/data/320193/q3.htm</filingHref>
    </filing>
  </results>
</companyFilings>"#;

        let filings = parse_filings(xml);
        assert_eq!(filings.len(), 2);
        assert_eq!(filings[0].form_type.as_deref(), Some("10-K"));
        assert_eq!(filings[0].filing_date.as_deref(), Some("2024-11-01"));
        assert!(filings[1].filing_href.as_deref().unwrap().contains("q3.htm"));
        assert_eq!(filings[1].file_number, None);
    }

    #[tokio::test]
    async fn rate_limit_spaces_requests() {
        let adapter = SecEdgarAdapter::new("Test admin@example.com", 0.1).unwrap();

        let started = std::time::Instant::now();
        adapter.rate_limit().await;
        adapter.rate_limit().await;
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
