//! HTTP client for the reading room archive.
//!
//! Implements [`PageSource`] for search result pages and [`DocumentSource`]
//! for detail pages and file downloads. Non-success responses are mapped to
//! [`CollaboratorError`] so the retry governor can classify them.

mod parse;
mod user_agent;

pub use parse::{derive_document_id, page_is_unavailable, parse_detail_page, parse_search_results, slugify};
pub use user_agent::{resolve_user_agent, USER_AGENT};

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use scraper::Selector;
use tracing::{debug, info};

use super::{DetailPage, DocumentSource, FetchedFile, PageLocator, PageResult, PageSource};
use crate::models::DocumentReference;
use crate::rate_limit::{CollaboratorError, RequestPacer};

#[derive(Debug, Clone)]
pub struct ArchiveClientConfig {
    /// Search URL with `{page}`, `{year}` and `{next_year}` placeholders.
    pub search_template: String,
    /// Substring of the final URL that proves we landed on a results page.
    pub results_marker: String,
    /// CSS selector for result links.
    pub link_selector: String,
    /// Result links must contain this substring.
    pub link_filter: String,
    pub unavailable_marker: String,
    pub user_agent: Option<String>,
    pub request_timeout: Duration,
}

impl Default for ArchiveClientConfig {
    fn default() -> Self {
        Self {
            search_template: super::DEFAULT_SEARCH_TEMPLATE.to_string(),
            results_marker: "search/site".to_string(),
            link_selector: "#block-system-main > div > ol > li h3 a".to_string(),
            link_filter: "/readingroom/".to_string(),
            unavailable_marker: "unavailable".to_string(),
            user_agent: None,
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveClientError {
    #[error("invalid link selector {selector:?}: {reason}")]
    Selector { selector: String, reason: String },
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

struct Fetched {
    final_url: String,
    content_type: Option<String>,
    bytes: Vec<u8>,
}

/// Paced HTTP access to the archive.
#[derive(Clone)]
pub struct ArchiveClient {
    client: Client,
    config: ArchiveClientConfig,
    link_selector: Selector,
    pacer: RequestPacer,
}

impl ArchiveClient {
    pub fn new(config: ArchiveClientConfig, pacer: RequestPacer) -> Result<Self, ArchiveClientError> {
        let link_selector =
            Selector::parse(&config.link_selector).map_err(|e| ArchiveClientError::Selector {
                selector: config.link_selector.clone(),
                reason: e.to_string(),
            })?;
        let client = Client::builder()
            .user_agent(resolve_user_agent(config.user_agent.as_deref()))
            .timeout(config.request_timeout)
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .build()?;

        Ok(Self {
            client,
            config,
            link_selector,
            pacer,
        })
    }

    pub fn config(&self) -> &ArchiveClientConfig {
        &self.config
    }

    async fn get(&self, url: &str) -> Result<Fetched, CollaboratorError> {
        self.pacer.acquire(url).await;

        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let header = |name: &str| {
            response
                .headers()
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        };
        let retry_after = header("retry-after");
        let content_type = header("content-type");

        if let Some(err) = CollaboratorError::from_status(status, retry_after.as_deref(), url) {
            if matches!(err, CollaboratorError::RateLimited { .. }) {
                self.pacer.report_rate_limit(url).await;
            }
            return Err(err);
        }

        let final_url = response.url().to_string();
        let bytes = response.bytes().await?.to_vec();
        self.pacer.report_success(url).await;
        debug!("GET {} -> {} ({} bytes)", url, status, bytes.len());

        Ok(Fetched {
            final_url,
            content_type,
            bytes,
        })
    }
}

#[async_trait]
impl PageSource for ArchiveClient {
    async fn fetch_page(&self, locator: &PageLocator) -> Result<PageResult, CollaboratorError> {
        let url = locator.expand(&self.config.search_template);
        let fetched = self.get(&url).await?;

        // The archive redirects past-the-end pages back to its landing page.
        if !fetched.final_url.contains(&self.config.results_marker) {
            info!(
                "{} redirected to {}; treating as end of results",
                locator, fetched.final_url
            );
            return Ok(PageResult::References(Vec::new()));
        }

        let html = String::from_utf8_lossy(&fetched.bytes);
        let references = parse_search_results(
            &html,
            &fetched.final_url,
            &self.link_selector,
            &self.config.link_filter,
            locator.partition,
        );
        if references.is_empty() && page_is_unavailable(&html, &self.config.unavailable_marker) {
            return Ok(PageResult::Unavailable);
        }
        Ok(PageResult::References(references))
    }
}

#[async_trait]
impl DocumentSource for ArchiveClient {
    async fn fetch_detail(&self, reference: &DocumentReference) -> Result<DetailPage, CollaboratorError> {
        let fetched = self.get(&reference.url).await?;
        let html = String::from_utf8_lossy(&fetched.bytes);
        Ok(parse_detail_page(
            &html,
            &fetched.final_url,
            &self.config.unavailable_marker,
        ))
    }

    async fn fetch_file(&self, url: &str) -> Result<FetchedFile, CollaboratorError> {
        let fetched = self.get(url).await?;
        if fetched.bytes.is_empty() {
            return Err(CollaboratorError::transient(format!("empty body from {}", url)));
        }
        Ok(FetchedFile {
            bytes: fetched.bytes,
            content_type: fetched.content_type,
        })
    }
}
