//! Artifact kinds produced and consumed by pipeline stages.

use serde::{Deserialize, Serialize};

/// A per-document artifact, stored under its own directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    /// Downloaded source file (PDF, image, text).
    Raw,
    /// OCR output, plain text.
    Text,
    /// Corrected structured record, JSON.
    Record,
    /// Acquisition sidecar, JSON.
    Metadata,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Text => "text",
            Self::Record => "record",
            Self::Metadata => "metadata",
        }
    }

    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Text => "text",
            Self::Record => "records",
            Self::Metadata => "metadata",
        }
    }

    /// Fixed extension, or `None` when the artifact keeps its source extension.
    pub fn extension(&self) -> Option<&'static str> {
        match self {
            Self::Raw => None,
            Self::Text => Some("txt"),
            Self::Record | Self::Metadata => Some("json"),
        }
    }
}

impl std::fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
