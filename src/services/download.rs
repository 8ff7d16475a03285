//! Document download sink for the acquisition cursor.
//!
//! For each new reference: fetch the detail page, download every linked
//! file into the raw artifact store, then write the metadata sidecar.
//! Documents whose artifacts already exist are never fetched again. A
//! document is stored whole or not at all: if any linked file fails for
//! good, the files already written for it are removed.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::models::{ArtifactKind, DocumentMetadata, DocumentReference};
use crate::rate_limit::{RetryGovernor, RetryOutcome};
use crate::scrapers::{DocumentSource, FetchedFile, ReferenceSink, SinkError, SinkOutcome};
use crate::storage::{mime_to_extension, ArtifactStore, StorageError};

/// Artifact id for the `index`th (0-based) of `count` files of a document.
pub fn file_artifact_id(document_id: &str, index: usize, count: usize) -> String {
    if count > 1 {
        format!("{}_{}", document_id, index + 1)
    } else {
        document_id.to_string()
    }
}

/// Pick an extension from the content itself, then the server's type, then the URL.
fn file_extension(file: &FetchedFile, url: &str) -> String {
    if let Some(kind) = infer::get(&file.bytes) {
        return kind.extension().to_string();
    }
    if let Some(ext) = file
        .content_type
        .as_deref()
        .map(mime_to_extension)
        .filter(|ext| *ext != "bin")
    {
        return ext.to_string();
    }
    Path::new(url.split(['?', '#']).next().unwrap_or(url))
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .filter(|e| e.len() <= 5 && e.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or_else(|| "bin".to_string())
}

/// Downloads referenced documents into the artifact store.
pub struct DownloadSink {
    store: ArtifactStore,
    source: Arc<dyn DocumentSource>,
    governor: RetryGovernor,
}

impl DownloadSink {
    pub fn new(store: ArtifactStore, source: Arc<dyn DocumentSource>, governor: RetryGovernor) -> Self {
        Self {
            store,
            source,
            governor,
        }
    }

    /// Whether the document was fully acquired by an earlier run.
    ///
    /// Metadata is written last, so a sidecar that lists every linked file
    /// with each file present means the document is complete. Without a
    /// sidecar, a lone raw artifact under the document id counts as done.
    fn already_acquired(&self, id: &str) -> Result<bool, SinkError> {
        match self.store.read_json::<DocumentMetadata>(ArtifactKind::Metadata, id) {
            Ok(Some(meta)) => {
                if meta.files.len() < meta.pdf_urls.len() {
                    debug!(
                        "{} has {} of {} files, fetching again",
                        id,
                        meta.files.len(),
                        meta.pdf_urls.len()
                    );
                    return Ok(false);
                }
                for file in &meta.files {
                    if !self.store.exists(ArtifactKind::Raw, file)? {
                        return Ok(false);
                    }
                }
                Ok(true)
            }
            Ok(None) => Ok(self.store.exists(ArtifactKind::Raw, id)?),
            Err(StorageError::Serialization { path, reason }) => {
                warn!(
                    "Unreadable metadata {} ({}), fetching {} again",
                    path.display(),
                    reason,
                    id
                );
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete files stored for a document that could not be completed.
    fn discard(&self, files: &[String]) -> Result<(), SinkError> {
        for file in files {
            self.store.remove(ArtifactKind::Raw, file)?;
        }
        Ok(())
    }
}

fn retry_failure<T>(outcome: RetryOutcome<T>) -> Result<Result<T, String>, SinkError> {
    match outcome {
        RetryOutcome::Success { value, .. } => Ok(Ok(value)),
        RetryOutcome::Fatal { error, .. } => Ok(Err(error.to_string())),
        RetryOutcome::Throttled { error, .. } => Err(SinkError::Throttled(error.to_string())),
        RetryOutcome::Exhausted { error, .. } => Err(SinkError::Retryable(error.to_string())),
    }
}

#[async_trait]
impl ReferenceSink for DownloadSink {
    async fn accept(&self, reference: &DocumentReference) -> Result<SinkOutcome, SinkError> {
        if self.already_acquired(&reference.id)? {
            debug!("Already downloaded: {}", reference.id);
            return Ok(SinkOutcome::AlreadyPresent);
        }

        let source = &self.source;
        let detail = self
            .governor
            .execute(&format!("detail {}", reference.id), || source.fetch_detail(reference))
            .await;
        let detail = match retry_failure(detail)? {
            Ok(detail) => detail,
            Err(reason) => return Ok(SinkOutcome::Failed(reason)),
        };

        if detail.unavailable {
            return Ok(SinkOutcome::Unavailable);
        }
        if detail.file_urls.is_empty() {
            warn!("No files linked from {}", reference.url);
        }

        let count = detail.file_urls.len();
        let mut files = Vec::new();
        for (index, url) in detail.file_urls.iter().enumerate() {
            let artifact_id = file_artifact_id(&reference.id, index, count);
            if self.store.exists(ArtifactKind::Raw, &artifact_id)? {
                files.push(artifact_id);
                continue;
            }

            let fetched = self
                .governor
                .execute(&format!("file {}", artifact_id), || source.fetch_file(url))
                .await;
            match retry_failure(fetched)? {
                Ok(file) => {
                    let ext = file_extension(&file, url);
                    let path = self
                        .store
                        .write(ArtifactKind::Raw, &artifact_id, Some(&ext), &file.bytes)?;
                    info!("Downloaded {} ({} bytes)", path.display(), file.bytes.len());
                    files.push(artifact_id);
                }
                Err(reason) => {
                    warn!("Failed to download {}: {}", url, reason);
                    self.discard(&files)?;
                    return Ok(SinkOutcome::Failed(format!("{}: {}", url, reason)));
                }
            }
        }

        let metadata = DocumentMetadata {
            id: reference.id.clone(),
            url: reference.url.clone(),
            title: detail.title.or_else(|| reference.title.clone()),
            partition: reference.partition,
            pdf_urls: detail.file_urls,
            fields: detail.fields,
            files,
            acquired_at: Utc::now(),
        };
        self.store
            .write_json(ArtifactKind::Metadata, &reference.id, &metadata)?;

        Ok(SinkOutcome::Stored {
            files: metadata.files.len(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PartitionKey;
    use crate::rate_limit::{CollaboratorError, RetryPolicy};
    use crate::scrapers::DetailPage;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    struct FakeArchive {
        details: HashMap<String, DetailPage>,
        files: HashMap<String, Result<Vec<u8>, CollaboratorError>>,
        detail_calls: AtomicUsize,
    }

    #[async_trait]
    impl DocumentSource for FakeArchive {
        async fn fetch_detail(&self, reference: &DocumentReference) -> Result<DetailPage, CollaboratorError> {
            self.detail_calls.fetch_add(1, Ordering::SeqCst);
            self.details
                .get(&reference.url)
                .cloned()
                .ok_or_else(|| CollaboratorError::permanent("HTTP 404"))
        }

        async fn fetch_file(&self, url: &str) -> Result<FetchedFile, CollaboratorError> {
            match self.files.get(url) {
                Some(Ok(bytes)) => Ok(FetchedFile {
                    bytes: bytes.clone(),
                    content_type: None,
                }),
                Some(Err(e)) => Err(e.clone()),
                None => Err(CollaboratorError::permanent("HTTP 404")),
            }
        }
    }

    fn reference(id: &str) -> DocumentReference {
        DocumentReference {
            id: id.to_string(),
            url: format!("https://archive.test/document/{}", id),
            partition: PartitionKey(1980),
            title: Some("Listing title".into()),
        }
    }

    fn governor() -> RetryGovernor {
        RetryGovernor::new(
            RetryPolicy::default()
                .with_max_attempts(2)
                .with_backoff(Duration::from_millis(1), 2.0, Duration::from_millis(2)),
        )
    }

    fn archive(details: Vec<(&str, DetailPage)>, files: Vec<(&str, Result<Vec<u8>, CollaboratorError>)>) -> Arc<FakeArchive> {
        Arc::new(FakeArchive {
            details: details
                .into_iter()
                .map(|(id, d)| (format!("https://archive.test/document/{}", id), d))
                .collect(),
            files: files.into_iter().map(|(u, f)| (u.to_string(), f)).collect(),
            detail_calls: AtomicUsize::new(0),
        })
    }

    #[tokio::test]
    async fn test_multi_file_document_gets_numbered_artifacts() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let source = archive(
            vec![(
                "DOC1",
                DetailPage {
                    title: Some("Detail title".into()),
                    file_urls: vec!["https://f/a.pdf".into(), "https://f/b.pdf".into()],
                    ..Default::default()
                },
            )],
            vec![
                ("https://f/a.pdf", Ok(b"%PDF-1.4 one".to_vec())),
                ("https://f/b.pdf", Ok(b"%PDF-1.4 two".to_vec())),
            ],
        );
        let sink = DownloadSink::new(store.clone(), source.clone(), governor());

        let outcome = sink.accept(&reference("DOC1")).await.unwrap();
        assert_eq!(outcome, SinkOutcome::Stored { files: 2 });
        assert!(dir.path().join("raw/DOC1_1.pdf").exists());
        assert!(dir.path().join("raw/DOC1_2.pdf").exists());

        let meta: DocumentMetadata = store.read_json(ArtifactKind::Metadata, "DOC1").unwrap().unwrap();
        assert_eq!(meta.files, vec!["DOC1_1", "DOC1_2"]);
        assert_eq!(meta.title.as_deref(), Some("Detail title"));

        // Second pass fetches nothing
        assert_eq!(sink.accept(&reference("DOC1")).await.unwrap(), SinkOutcome::AlreadyPresent);
        assert_eq!(source.detail_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unavailable_and_dead_links() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let source = archive(
            vec![
                (
                    "GONE",
                    DetailPage {
                        unavailable: true,
                        ..Default::default()
                    },
                ),
                (
                    "DEAD",
                    DetailPage {
                        file_urls: vec!["https://f/dead.pdf".into()],
                        ..Default::default()
                    },
                ),
            ],
            vec![],
        );
        let sink = DownloadSink::new(store, source, governor());

        assert_eq!(sink.accept(&reference("GONE")).await.unwrap(), SinkOutcome::Unavailable);
        assert!(matches!(
            sink.accept(&reference("DEAD")).await.unwrap(),
            SinkOutcome::Failed(_)
        ));
    }

    #[tokio::test]
    async fn test_one_dead_file_fails_the_whole_document() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let source = archive(
            vec![(
                "DOC2",
                DetailPage {
                    file_urls: vec!["https://f/a.pdf".into(), "https://f/b.pdf".into()],
                    ..Default::default()
                },
            )],
            vec![
                ("https://f/a.pdf", Ok(b"%PDF-1.4 one".to_vec())),
                ("https://f/b.pdf", Err(CollaboratorError::permanent("HTTP 404"))),
            ],
        );
        let sink = DownloadSink::new(store.clone(), source.clone(), governor());

        let first = sink.accept(&reference("DOC2")).await.unwrap();
        assert!(matches!(first, SinkOutcome::Failed(ref reason) if reason.contains("b.pdf")));
        assert!(!store.exists(ArtifactKind::Raw, "DOC2_1").unwrap());
        assert!(!store.exists(ArtifactKind::Raw, "DOC2_2").unwrap());
        assert!(!store.exists(ArtifactKind::Metadata, "DOC2").unwrap());

        // Nothing was recorded as acquired, so a second attempt goes back to the archive.
        assert!(matches!(sink.accept(&reference("DOC2")).await.unwrap(), SinkOutcome::Failed(_)));
        assert_eq!(source.detail_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_incomplete_or_corrupt_metadata_is_refetched() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let source = archive(
            vec![
                (
                    "PART",
                    DetailPage {
                        file_urls: vec!["https://f/p1.pdf".into(), "https://f/p2.pdf".into()],
                        ..Default::default()
                    },
                ),
                (
                    "BROKEN",
                    DetailPage {
                        file_urls: vec!["https://f/broken.pdf".into()],
                        ..Default::default()
                    },
                ),
            ],
            vec![
                ("https://f/p1.pdf", Ok(b"%PDF-1.4 one".to_vec())),
                ("https://f/p2.pdf", Ok(b"%PDF-1.4 two".to_vec())),
                ("https://f/broken.pdf", Ok(b"%PDF-1.4 three".to_vec())),
            ],
        );

        // A sidecar listing one of two linked files.
        store.write(ArtifactKind::Raw, "PART_1", Some("pdf"), b"%PDF-1.4 one").unwrap();
        let partial = DocumentMetadata {
            id: "PART".into(),
            url: "https://archive.test/document/PART".into(),
            title: None,
            partition: PartitionKey(1980),
            pdf_urls: vec!["https://f/p1.pdf".into(), "https://f/p2.pdf".into()],
            fields: Default::default(),
            files: vec!["PART_1".into()],
            acquired_at: Utc::now(),
        };
        store.write_json(ArtifactKind::Metadata, "PART", &partial).unwrap();

        // A sidecar that does not parse, next to an existing raw file.
        store.write(ArtifactKind::Raw, "BROKEN", Some("pdf"), b"%PDF-1.4 three").unwrap();
        store.write(ArtifactKind::Metadata, "BROKEN", None, b"{not json").unwrap();

        let sink = DownloadSink::new(store.clone(), source.clone(), governor());
        assert_eq!(sink.accept(&reference("PART")).await.unwrap(), SinkOutcome::Stored { files: 2 });
        assert!(store.exists(ArtifactKind::Raw, "PART_2").unwrap());
        assert_eq!(sink.accept(&reference("BROKEN")).await.unwrap(), SinkOutcome::Stored { files: 1 });
        let meta: DocumentMetadata = store.read_json(ArtifactKind::Metadata, "BROKEN").unwrap().unwrap();
        assert_eq!(meta.files, vec!["BROKEN"]);
        assert_eq!(source.detail_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_transient_exhaustion_is_retryable_error() {
        let dir = tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());
        let source = archive(
            vec![(
                "FLAKY",
                DetailPage {
                    file_urls: vec!["https://f/x.pdf".into()],
                    ..Default::default()
                },
            )],
            vec![("https://f/x.pdf", Err(CollaboratorError::transient("reset")))],
        );
        let sink = DownloadSink::new(store.clone(), source, governor());

        assert!(matches!(
            sink.accept(&reference("FLAKY")).await,
            Err(SinkError::Retryable(_))
        ));
        assert!(!store.exists(ArtifactKind::Metadata, "FLAKY").unwrap());
    }

    #[test]
    fn test_file_extension_prefers_content() {
        let pdf = FetchedFile {
            bytes: b"%PDF-1.7".to_vec(),
            content_type: Some("application/octet-stream".into()),
        };
        assert_eq!(file_extension(&pdf, "https://f/download?id=1"), "pdf");

        let text = FetchedFile {
            bytes: b"plain words".to_vec(),
            content_type: Some("text/plain; charset=utf-8".into()),
        };
        assert_eq!(file_extension(&text, "https://f/x"), "txt");

        let unknown = FetchedFile {
            bytes: b"??".to_vec(),
            content_type: None,
        };
        assert_eq!(file_extension(&unknown, "https://f/scan.TIF?x=1"), "tif");
    }
}
