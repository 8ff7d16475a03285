//! Stage services: the acquisition download sink and the per-document
//! processors driven by the stage runner.

pub mod correction;
pub mod download;
pub mod ocr;

pub use correction::{CorrectionConfig, CorrectionError, CorrectionStage, FieldKind, FieldSchema, SeamPolicy};
pub use download::{file_artifact_id, DownloadSink};
pub use ocr::OcrStage;

use crate::rate_limit::RetryOutcome;
use crate::work_queue::ItemError;

/// Map a governed collaborator call onto the per-item outcome: permanent
/// failures and exhausted retries fail the document, throttling stops the run.
pub(crate) fn item_result<T>(outcome: RetryOutcome<T>) -> Result<T, ItemError> {
    match outcome {
        RetryOutcome::Success { value, .. } => Ok(value),
        RetryOutcome::Fatal { error, .. } => Err(ItemError::Failed(error.to_string())),
        RetryOutcome::Exhausted { error, stats } => Err(ItemError::Failed(format!(
            "{} (after {} attempts)",
            error, stats.attempts
        ))),
        RetryOutcome::Throttled { error, .. } => Err(ItemError::Throttled(error.to_string())),
    }
}
