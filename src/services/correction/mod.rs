//! Correction stage: OCR text in, one structured record out.
//!
//! Text longer than the collaborator's bound is split into chunks, each
//! chunk is corrected through the retry governor, and the results are merged
//! into a single record. Nothing is written unless every chunk succeeded.

mod chunker;
mod merge;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub use chunker::{Chunk, Chunker};
pub use merge::{merge_fields, merge_texts, FieldKind, FieldSchema, SeamPolicy};

use super::item_result;
use crate::llm::{CorrectionRequest, Corrector};
use crate::models::{ArtifactKind, ChunkResult, CorrectedRecord, Stage};
use crate::rate_limit::RetryGovernor;
use crate::storage::{content_hash, ArtifactStore};
use crate::work_queue::{ItemError, StageProcessor};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CorrectionError {
    #[error("Invalid correction settings: {0}")]
    InvalidConfig(String),
    #[error("OCR text is empty")]
    EmptyInput,
    #[error("Model returned no text for chunk {chunk}")]
    EmptyOutput { chunk: usize },
}

impl From<CorrectionError> for ItemError {
    fn from(e: CorrectionError) -> Self {
        ItemError::Failed(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionConfig {
    /// Upper bound on the text sent per call, overlap included.
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,
    #[serde(default)]
    pub overlap_chars: usize,
    #[serde(default)]
    pub seam_policy: SeamPolicy,
    #[serde(default)]
    pub fields: FieldSchema,
}

fn default_max_chunk_chars() -> usize {
    6000
}

impl Default for CorrectionConfig {
    fn default() -> Self {
        Self {
            max_chunk_chars: default_max_chunk_chars(),
            overlap_chars: 0,
            seam_policy: SeamPolicy::default(),
            fields: FieldSchema::default(),
        }
    }
}

/// Assemble the final record from per-chunk results.
pub fn build_record(
    document_id: &str,
    source: &str,
    chunks: &[Chunk],
    results: &[ChunkResult],
    policy: SeamPolicy,
    schema: &FieldSchema,
    model: &str,
) -> Result<CorrectedRecord, CorrectionError> {
    for (chunk, result) in chunks.iter().zip(results) {
        if result.corrected_text.trim().is_empty() && !chunk.body.trim().is_empty() {
            return Err(CorrectionError::EmptyOutput {
                chunk: result.chunk_index,
            });
        }
    }
    let outputs: Vec<&str> = results.iter().map(|r| r.corrected_text.as_str()).collect();

    Ok(CorrectedRecord {
        document_id: document_id.to_string(),
        text: merge_texts(chunks, &outputs, policy),
        fields: merge_fields(schema, results),
        chunk_count: chunks.len(),
        source_sha256: content_hash(source.as_bytes()),
        model: model.to_string(),
        corrected_at: Utc::now(),
    })
}

pub struct CorrectionStage {
    artifacts: ArtifactStore,
    corrector: Arc<dyn Corrector>,
    governor: RetryGovernor,
    chunker: Chunker,
    config: CorrectionConfig,
    field_names: Vec<String>,
}

impl CorrectionStage {
    pub fn new(
        artifacts: ArtifactStore,
        corrector: Arc<dyn Corrector>,
        governor: RetryGovernor,
        config: CorrectionConfig,
    ) -> Result<Self, CorrectionError> {
        let chunker = Chunker::new(config.max_chunk_chars, config.overlap_chars)?;
        let field_names = config.fields.field_names();
        Ok(Self {
            artifacts,
            corrector,
            governor,
            chunker,
            config,
            field_names,
        })
    }

    async fn correct_chunk(
        &self,
        document_id: &str,
        chunk: &Chunk,
        chunk_count: usize,
    ) -> Result<ChunkResult, ItemError> {
        let text = chunk.text();
        let request = CorrectionRequest {
            document_id,
            chunk_index: chunk.index,
            chunk_count,
            fields: &self.field_names,
            text: &text,
        };
        let corrector = &self.corrector;
        let outcome = self
            .governor
            .execute(
                &format!("correct {} [{}/{}]", document_id, chunk.index + 1, chunk_count),
                || corrector.correct(&request),
            )
            .await;
        let correction = item_result(outcome)?;
        Ok(ChunkResult {
            chunk_index: chunk.index,
            corrected_text: correction.corrected_text,
            fields: correction.fields,
        })
    }
}

#[async_trait]
impl StageProcessor for CorrectionStage {
    fn stage(&self) -> Stage {
        Stage::Correction
    }

    async fn process(&self, document_id: &str) -> Result<(), ItemError> {
        let source = self
            .artifacts
            .read_text(ArtifactKind::Text, document_id)
            .map_err(ItemError::fatal)?
            .ok_or_else(|| ItemError::failed("text artifact missing"))?;
        if source.trim().is_empty() {
            return Err(CorrectionError::EmptyInput.into());
        }

        let chunks = self.chunker.split(&source);
        debug!("{} split into {} chunks", document_id, chunks.len());

        let mut results = Vec::with_capacity(chunks.len());
        for chunk in &chunks {
            results.push(self.correct_chunk(document_id, chunk, chunks.len()).await?);
        }

        let record = build_record(
            document_id,
            &source,
            &chunks,
            &results,
            self.config.seam_policy,
            &self.config.fields,
            self.corrector.model(),
        )?;
        self.artifacts
            .write_json(ArtifactKind::Record, document_id, &record)
            .map_err(ItemError::fatal)?;
        info!(
            "Corrected {} ({} chunks, {} fields)",
            document_id,
            record.chunk_count,
            record.fields.len()
        );
        Ok(())
    }
}
