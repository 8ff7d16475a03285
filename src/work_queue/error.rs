//! Work queue error types.

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::models::Stage;
use crate::storage::StorageError;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),
    #[error("No {stage} input artifact for document {document_id}")]
    MissingInput { stage: Stage, document_id: String },
}

/// Errors that stop a stage run.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Tracker(#[from] TrackerError),
    #[error("Fatal error processing {document_id}: {reason}")]
    Fatal { document_id: String, reason: String },
}
