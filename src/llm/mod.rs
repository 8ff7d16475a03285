//! Correction collaborator: bounded OCR text in, corrected text plus
//! extracted fields out.

mod client;
mod config;
mod prompts;

use async_trait::async_trait;
use thiserror::Error;

pub use client::{parse_correction, LlmClient};
pub use config::{LlmConfig, LlmProvider};
pub use prompts::{render_correction_prompt, DEFAULT_CORRECTION_PROMPT};

use crate::rate_limit::CollaboratorError;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Request timed out")]
    Timeout,
    #[error("HTTP {status}: {body}")]
    Http {
        status: u16,
        retry_after: Option<String>,
        body: String,
    },
    #[error("Malformed model output: {0}")]
    Parse(String),
    #[error("{0}")]
    Unsupported(&'static str),
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            LlmError::Timeout
        } else {
            LlmError::Connection(e.to_string())
        }
    }
}

impl From<LlmError> for CollaboratorError {
    fn from(e: LlmError) -> Self {
        match e {
            LlmError::Connection(_) | LlmError::Timeout => CollaboratorError::transient(e.to_string()),
            LlmError::Http {
                status,
                ref retry_after,
                ref body,
            } => CollaboratorError::from_status(status, retry_after.as_deref(), body)
                .unwrap_or_else(|| CollaboratorError::transient(e.to_string())),
            LlmError::Parse(_) | LlmError::Unsupported(_) => CollaboratorError::permanent(e.to_string()),
        }
    }
}

/// One chunk of a document sent for correction.
#[derive(Debug, Clone, Copy)]
pub struct CorrectionRequest<'a> {
    pub document_id: &'a str,
    pub chunk_index: usize,
    pub chunk_count: usize,
    /// Field names the model is asked to extract.
    pub fields: &'a [String],
    pub text: &'a str,
}

/// The model's answer for one chunk.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Correction {
    pub corrected_text: String,
    pub fields: serde_json::Map<String, serde_json::Value>,
}

#[async_trait]
pub trait Corrector: Send + Sync {
    /// Model name recorded in output records.
    fn model(&self) -> &str;

    async fn correct(&self, request: &CorrectionRequest<'_>) -> Result<Correction, CollaboratorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rate_limit::{FailureKind, RateLimitDetector};

    #[test]
    fn test_http_errors_map_to_taxonomy() {
        let rl: CollaboratorError = LlmError::Http {
            status: 429,
            retry_after: Some("7".into()),
            body: "slow down".into(),
        }
        .into();
        assert!(matches!(rl, CollaboratorError::RateLimited { .. }));

        let gone: CollaboratorError = LlmError::Http {
            status: 404,
            retry_after: None,
            body: "model not found".into(),
        }
        .into();
        assert!(matches!(gone, CollaboratorError::Permanent(_)));

        let down: CollaboratorError = LlmError::Http {
            status: 502,
            retry_after: None,
            body: String::new(),
        }
        .into();
        assert!(matches!(down, CollaboratorError::Transient(_)));

        let unavailable: CollaboratorError = LlmError::Http {
            status: 503,
            retry_after: None,
            body: "Service Unavailable".into(),
        }
        .into();
        assert!(matches!(unavailable, CollaboratorError::Transient(_)));
        assert_eq!(
            RateLimitDetector::default().classify(&unavailable),
            FailureKind::Transient
        );
    }
}
