//! Stage processor abstraction and shared types for stage runs.

use async_trait::async_trait;
use thiserror::Error;

use crate::models::Stage;

/// How a stage run chooses its work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum RunMode {
    /// Process every pending document.
    #[default]
    Normal,
    /// Read-only: report the ledger summary and exit.
    Progress,
    /// Requeue failed documents and process only those.
    #[value(name = "retry")]
    RetryFailed,
}

/// Outcome of processing one document that did not succeed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ItemError {
    /// The document is recorded FAILED and the run moves on.
    #[error("{0}")]
    Failed(String),
    /// Rate limiting outlasted the governor. The document stays PENDING and
    /// the run stops.
    #[error("throttled: {0}")]
    Throttled(String),
    /// Storage or state failure. The run stops.
    #[error("{0}")]
    Fatal(String),
}

impl ItemError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }

    pub fn fatal(reason: impl std::fmt::Display) -> Self {
        Self::Fatal(reason.to_string())
    }
}

/// Progress events emitted by the runner.
#[derive(Debug, Clone, PartialEq)]
pub enum StageEvent {
    StageStarted {
        stage: Stage,
        total_items: usize,
    },
    ItemStarted {
        stage: Stage,
        document_id: String,
    },
    ItemCompleted {
        stage: Stage,
        document_id: String,
    },
    ItemFailed {
        stage: Stage,
        document_id: String,
        error: String,
    },
    Stopped {
        stage: Stage,
        reason: String,
    },
    StageCompleted {
        stage: Stage,
        succeeded: usize,
        failed: usize,
        remaining: usize,
    },
}

/// Turns one document's input artifact into its output artifact.
///
/// Implementations write the output atomically before returning `Ok`; the
/// runner records DONE only afterwards.
#[async_trait]
pub trait StageProcessor: Send + Sync {
    fn stage(&self) -> Stage;

    async fn process(&self, document_id: &str) -> Result<(), ItemError>;
}
