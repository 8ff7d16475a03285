//! Archive acquisition: the search-page cursor and its collaborators.
//!
//! The cursor walks year partitions page by page through a [`PageSource`]
//! and hands every new [`DocumentReference`] to a [`ReferenceSink`], which
//! downloads it. [`ArchiveClient`] is the HTTP implementation of both the
//! page source and the per-document [`DocumentSource`].

mod cursor;
mod http_client;
mod locator;

pub use cursor::{
    load_cursor_record, load_partitions, AcquisitionCursor, CursorConfig, CursorError, CursorEvent, CursorPhase, CursorRunSummary,
    CursorStart, PartitionErrorPolicy, RetryFailedSummary,
};
pub use http_client::{
    derive_document_id, slugify, ArchiveClient, ArchiveClientConfig, ArchiveClientError,
};
pub use locator::{LocatorError, PageLocator, DEFAULT_SEARCH_TEMPLATE};

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::models::DocumentReference;
use crate::rate_limit::CollaboratorError;
use crate::storage::StorageError;

/// What a search page yielded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PageResult {
    /// Ordered references on the page. Empty means no further results.
    References(Vec<DocumentReference>),
    /// The page itself reported it is unavailable; skip to the next one.
    Unavailable,
}

/// Scraping collaborator for search result pages.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn fetch_page(&self, locator: &PageLocator) -> Result<PageResult, CollaboratorError>;
}

/// A document detail page.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DetailPage {
    pub title: Option<String>,
    /// The page reports the document is unavailable.
    pub unavailable: bool,
    pub file_urls: Vec<String>,
    /// Label/value metadata rows shown on the page.
    pub fields: BTreeMap<String, String>,
}

/// Downloaded file content.
#[derive(Debug, Clone)]
pub struct FetchedFile {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Scraping collaborator for individual documents.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn fetch_detail(&self, reference: &DocumentReference) -> Result<DetailPage, CollaboratorError>;
    async fn fetch_file(&self, url: &str) -> Result<FetchedFile, CollaboratorError>;
}

/// How a reference handed to the sink ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkOutcome {
    /// Downloaded and stored now.
    Stored { files: usize },
    /// Raw artifact already present, nothing fetched.
    AlreadyPresent,
    /// The archive reports the document unavailable.
    Unavailable,
    /// Permanently failed (e.g. dead file link). Recorded, never refetched.
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// Rate limiting outlasted the configured patience.
    #[error("rate limited: {0}")]
    Throttled(String),
    /// Transient failures exhausted retries; the page should be retried later.
    #[error("{0}")]
    Retryable(String),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Receives new references before the page is committed.
#[async_trait]
pub trait ReferenceSink: Send + Sync {
    async fn accept(&self, reference: &DocumentReference) -> Result<SinkOutcome, SinkError>;
}
