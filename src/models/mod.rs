//! Data models for the acquisition, OCR and correction pipeline.

mod acquisition;
mod artifact;
mod ledger;
mod record;

pub use acquisition::{
    AcquisitionState, CursorRecord, DocumentMetadata, DocumentReference, FailedReference,
    PartitionKey, PartitionProgress,
};
pub use artifact::ArtifactKind;
pub use ledger::{ProcessingRecord, ProgressSummary, Stage, Status};
pub use record::{ChunkResult, CorrectedRecord, TextEntry};
