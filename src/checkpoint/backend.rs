//! Pluggable backend trait for checkpoint storage.
//!
//! Backends store opaque string values under `/`-separated keys. Typed
//! access and corruption detection live in [`super::CheckpointStore`].

use std::path::PathBuf;

/// Result type for checkpoint operations.
pub type CheckpointResult<T> = Result<T, CheckpointError>;

/// Errors from checkpoint backends.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Database error: {0}")]
    Database(String),
    #[error("Checkpoint '{key}' is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("Invalid checkpoint key: {0:?}")]
    InvalidKey(String),
}

impl CheckpointError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CheckpointError::Io {
            path: path.into(),
            source,
        }
    }
}

impl From<rusqlite::Error> for CheckpointError {
    fn from(e: rusqlite::Error) -> Self {
        CheckpointError::Database(e.to_string())
    }
}

/// Trait for checkpoint storage backends.
///
/// `write` must be atomic: a reader (or a process restarted after a crash)
/// observes either the previous value or the new one, never a torn write.
pub trait CheckpointBackend: Send + Sync {
    /// Short backend name for diagnostics.
    fn name(&self) -> &'static str;

    /// Read the raw value stored under `key`.
    fn read(&self, key: &str) -> CheckpointResult<Option<String>>;

    /// Atomically replace the value stored under `key`.
    fn write(&self, key: &str, value: &str) -> CheckpointResult<()>;

    /// Remove a key. Returns whether it existed.
    fn remove(&self, key: &str) -> CheckpointResult<bool>;

    /// All keys starting with `prefix`, sorted ascending.
    fn keys(&self, prefix: &str) -> CheckpointResult<Vec<String>>;

    fn contains(&self, key: &str) -> CheckpointResult<bool> {
        Ok(self.read(key)?.is_some())
    }
}

/// Reject keys that could escape the backend's namespace.
pub(crate) fn validate_key(key: &str) -> CheckpointResult<()> {
    let bad_segment = key
        .split('/')
        .any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if key.is_empty() || bad_segment || key.contains('\\') || key.contains('\0') {
        return Err(CheckpointError::InvalidKey(key.to_string()));
    }
    Ok(())
}
