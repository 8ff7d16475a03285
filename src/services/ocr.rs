//! OCR stage: raw artifact in, `text/{id}.txt` out.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use super::item_result;
use crate::models::{ArtifactKind, Stage};
use crate::ocr::OcrEngine;
use crate::rate_limit::RetryGovernor;
use crate::storage::ArtifactStore;
use crate::work_queue::{ItemError, StageProcessor};

pub struct OcrStage {
    artifacts: ArtifactStore,
    engine: Arc<dyn OcrEngine>,
    governor: RetryGovernor,
}

impl OcrStage {
    pub fn new(artifacts: ArtifactStore, engine: Arc<dyn OcrEngine>, governor: RetryGovernor) -> Self {
        Self {
            artifacts,
            engine,
            governor,
        }
    }
}

#[async_trait]
impl StageProcessor for OcrStage {
    fn stage(&self) -> Stage {
        Stage::Ocr
    }

    async fn process(&self, document_id: &str) -> Result<(), ItemError> {
        let path = self
            .artifacts
            .find(ArtifactKind::Raw, document_id)
            .map_err(ItemError::fatal)?
            .ok_or_else(|| ItemError::failed("raw artifact missing"))?;

        let engine = &self.engine;
        let outcome = self
            .governor
            .execute(&format!("ocr {}", document_id), || engine.extract(&path))
            .await;
        let extraction = item_result(outcome)?;

        self.artifacts
            .write(ArtifactKind::Text, document_id, None, extraction.text.as_bytes())
            .map_err(ItemError::fatal)?;
        info!(
            "OCR {} via {} ({} pages, {} chars)",
            document_id,
            extraction.method.as_str(),
            extraction.page_count.unwrap_or(1),
            extraction.text.len()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ocr::{ExtractionMethod, ExtractionResult};
    use crate::rate_limit::{CollaboratorError, RetryPolicy};
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::tempdir;

    struct FlakyEngine {
        failures_left: AtomicUsize,
        error: CollaboratorError,
    }

    #[async_trait]
    impl OcrEngine for FlakyEngine {
        fn name(&self) -> &str {
            "flaky"
        }

        async fn extract(&self, path: &Path) -> Result<ExtractionResult, CollaboratorError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(self.error.clone());
            }
            Ok(ExtractionResult {
                text: format!("text of {}", path.file_name().unwrap().to_string_lossy()),
                method: ExtractionMethod::Direct,
                page_count: None,
            })
        }
    }

    fn stage(dir: &Path, failures: usize, error: CollaboratorError) -> OcrStage {
        let store = ArtifactStore::new(dir);
        store.write(ArtifactKind::Raw, "doc", Some("pdf"), b"%PDF").unwrap();
        let governor = RetryGovernor::new(
            RetryPolicy::default()
                .with_max_attempts(2)
                .with_backoff(Duration::from_millis(1), 1.0, Duration::from_millis(1))
                .with_cooldown(Duration::from_millis(1), Duration::from_millis(1))
                .with_max_rate_limit_waits(Some(1)),
        );
        let engine = Arc::new(FlakyEngine {
            failures_left: AtomicUsize::new(failures),
            error,
        });
        OcrStage::new(store, engine, governor)
    }

    #[tokio::test]
    async fn test_writes_text_after_transient_failure() {
        let dir = tempdir().unwrap();
        let ocr = stage(dir.path(), 1, CollaboratorError::transient("busy"));
        ocr.process("doc").await.unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("text/doc.txt")).unwrap(),
            "text of doc.pdf"
        );
    }

    #[tokio::test]
    async fn test_outcomes_map_to_item_errors() {
        let dir = tempdir().unwrap();
        let ocr = stage(dir.path(), 5, CollaboratorError::permanent("corrupt"));
        assert!(matches!(ocr.process("doc").await, Err(ItemError::Failed(_))));

        let dir = tempdir().unwrap();
        let ocr = stage(dir.path(), 5, CollaboratorError::rate_limited(None, "429"));
        assert!(matches!(ocr.process("doc").await, Err(ItemError::Throttled(_))));
        assert!(!dir.path().join("text/doc.txt").exists());

        assert!(matches!(ocr.process("other").await, Err(ItemError::Failed(_))));
    }
}
