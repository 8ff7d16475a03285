//! Per-document, per-stage processing ledger.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ArtifactKind;

/// Processing stage tracked by the ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Ocr,
    Correction,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ocr => "ocr",
            Self::Correction => "correction",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "ocr" => Some(Self::Ocr),
            "correction" => Some(Self::Correction),
            _ => None,
        }
    }

    /// Artifact that must exist before a document enters this stage.
    pub fn input(&self) -> ArtifactKind {
        match self {
            Self::Ocr => ArtifactKind::Raw,
            Self::Correction => ArtifactKind::Text,
        }
    }

    /// Artifact this stage produces.
    pub fn output(&self) -> ArtifactKind {
        match self {
            Self::Ocr => ArtifactKind::Text,
            Self::Correction => ArtifactKind::Record,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Done,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }
}

/// Ledger entry for one (document, stage).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessingRecord {
    pub document_id: String,
    pub stage: Stage,
    pub status: Status,
    /// 1 for the first attempt cycle, incremented on each requeue.
    pub attempt_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProcessingRecord {
    pub fn pending(document_id: impl Into<String>, stage: Stage) -> Self {
        Self {
            document_id: document_id.into(),
            stage,
            status: Status::Pending,
            attempt_count: 1,
            last_error: None,
            updated_at: Utc::now(),
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == Status::Done
    }

    pub fn is_failed(&self) -> bool {
        self.status == Status::Failed
    }

    pub fn complete(&mut self) {
        self.status = Status::Done;
        self.last_error = None;
        self.updated_at = Utc::now();
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.status = Status::Failed;
        self.last_error = Some(error.into());
        self.updated_at = Utc::now();
    }

    /// FAILED → PENDING for another attempt cycle. Other states are left alone.
    pub fn requeue(&mut self) -> bool {
        if self.status != Status::Failed {
            return false;
        }
        self.status = Status::Pending;
        self.attempt_count += 1;
        self.updated_at = Utc::now();
        true
    }

    /// Operator-forced reset of any state back to PENDING.
    pub fn force_reset(&mut self) {
        if self.status != Status::Pending {
            self.attempt_count += 1;
        }
        self.status = Status::Pending;
        self.last_error = None;
        self.updated_at = Utc::now();
    }
}

/// Counts returned by `progress_summary`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProgressSummary {
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub pending: usize,
}

impl ProgressSummary {
    pub fn percent_done(&self) -> f64 {
        if self.total == 0 {
            return 100.0;
        }
        self.done as f64 * 100.0 / self.total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requeue_only_from_failed() {
        let mut rec = ProcessingRecord::pending("doc", Stage::Ocr);
        assert!(!rec.requeue());
        rec.fail("boom");
        assert!(rec.requeue());
        assert_eq!(rec.status, Status::Pending);
        assert_eq!(rec.attempt_count, 2);
        assert_eq!(rec.last_error.as_deref(), Some("boom"));

        rec.complete();
        assert!(!rec.requeue());
        assert!(rec.is_done());
        assert!(rec.last_error.is_none());
    }

    #[test]
    fn test_force_reset_from_done() {
        let mut rec = ProcessingRecord::pending("doc", Stage::Correction);
        rec.complete();
        rec.force_reset();
        assert_eq!(rec.status, Status::Pending);
        assert_eq!(rec.attempt_count, 2);
    }

    #[test]
    fn test_stage_artifacts() {
        assert_eq!(Stage::Ocr.input(), ArtifactKind::Raw);
        assert_eq!(Stage::Ocr.output(), Stage::Correction.input());
        assert_eq!(Stage::from_str("correction"), Some(Stage::Correction));
    }
}
