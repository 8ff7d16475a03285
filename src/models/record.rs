//! Correction stage payloads.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Output of the correction collaborator for one chunk. Discarded after merge.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkResult {
    pub chunk_index: usize,
    pub corrected_text: String,
    pub fields: serde_json::Map<String, Value>,
}

/// One entry of a free-text field, tagged with the chunk it came from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextEntry {
    pub chunk: usize,
    pub text: String,
}

/// Final corrected document (`records/{id}.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectedRecord {
    pub document_id: String,
    pub text: String,
    pub fields: BTreeMap<String, Value>,
    pub chunk_count: usize,
    /// SHA-256 of the OCR text the record was produced from.
    pub source_sha256: String,
    pub model: String,
    pub corrected_at: DateTime<Utc>,
}
