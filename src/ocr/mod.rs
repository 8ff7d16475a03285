//! OCR collaborator.
//!
//! Extracts text from raw artifacts using:
//! - pdftotext (Poppler) for the PDF text layer
//! - pdftoppm + Tesseract for sparse pages and image files
//!
//! The extractor runs on the blocking pool; its failures are mapped into
//! the collaborator taxonomy so the retry governor can classify them.

mod extractor;

use std::path::{Path, PathBuf};

use async_trait::async_trait;

pub use extractor::{
    content_chars, detect_input, prefer_ocr, ExtractionError, ExtractionMethod, ExtractionResult,
    InputKind, TextExtractor, REQUIRED_TOOLS,
};

use crate::rate_limit::CollaboratorError;

/// Turns one raw artifact into text.
#[async_trait]
pub trait OcrEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn extract(&self, path: &Path) -> Result<ExtractionResult, CollaboratorError>;
}

impl From<ExtractionError> for CollaboratorError {
    fn from(e: ExtractionError) -> Self {
        match e {
            // A missing tool or unreadable file fails the same way every time
            ExtractionError::UnsupportedFileType(_)
            | ExtractionError::ToolNotFound(_)
            | ExtractionError::ExtractionFailed(_) => CollaboratorError::permanent(e.to_string()),
            ExtractionError::Io(_) => CollaboratorError::transient(e.to_string()),
        }
    }
}

#[async_trait]
impl OcrEngine for TextExtractor {
    fn name(&self) -> &str {
        "pdftotext+tesseract"
    }

    async fn extract(&self, path: &Path) -> Result<ExtractionResult, CollaboratorError> {
        let extractor = self.clone();
        let path: PathBuf = path.to_path_buf();
        let result = tokio::task::spawn_blocking(move || extractor.extract(&path))
            .await
            .map_err(|e| CollaboratorError::transient(format!("extraction task failed: {}", e)))??;

        if content_chars(&result.text) == 0 {
            return Err(CollaboratorError::permanent("no text extracted"));
        }
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_blank_text_is_permanent() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("blank");
        std::fs::write(&path, "  \n\n ").unwrap();

        let err = OcrEngine::extract(&TextExtractor::new(), &path).await.unwrap_err();
        assert!(matches!(err, CollaboratorError::Permanent(_)));
    }

    #[tokio::test]
    async fn test_missing_file_is_transient() {
        let dir = tempdir().unwrap();
        let err = OcrEngine::extract(&TextExtractor::new(), &dir.path().join("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, CollaboratorError::Transient(_)));
    }
}
