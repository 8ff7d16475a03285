//! Durable key/state storage for pipeline progress.
//!
//! Every persisted piece of progress (acquisition cursor, per-partition
//! pages, per-document ledger entries) goes through [`CheckpointStore`].
//! Backends:
//! - **file**: one JSON file per key, atomic temp-file rename
//! - **sqlite**: a single `checkpoints` table
//! - **memory**: process-local, for tests

mod backend;
mod file;
mod memory;
mod sqlite;

pub use backend::{CheckpointBackend, CheckpointError, CheckpointResult};
pub use file::FileCheckpointBackend;
pub use memory::InMemoryCheckpointBackend;
pub use sqlite::SqliteCheckpointBackend;

use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Which backend to persist checkpoints with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum CheckpointBackendKind {
    #[default]
    File,
    Sqlite,
    Memory,
}

impl std::str::FromStr for CheckpointBackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "file" | "json" => Ok(Self::File),
            "sqlite" | "db" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown checkpoint backend: {}", other)),
        }
    }
}

/// Typed facade over a [`CheckpointBackend`].
#[derive(Clone)]
pub struct CheckpointStore {
    backend: Arc<dyn CheckpointBackend>,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore")
            .field("backend", &self.backend.name())
            .finish()
    }
}

impl CheckpointStore {
    pub fn new(backend: Arc<dyn CheckpointBackend>) -> Self {
        Self { backend }
    }

    /// Open a store of the given kind rooted at `state_dir`.
    pub fn open(kind: CheckpointBackendKind, state_dir: &Path) -> CheckpointResult<Self> {
        let backend: Arc<dyn CheckpointBackend> = match kind {
            CheckpointBackendKind::File => Arc::new(FileCheckpointBackend::new(state_dir)?),
            CheckpointBackendKind::Sqlite => {
                Arc::new(SqliteCheckpointBackend::new(state_dir.join("checkpoints.db"))?)
            }
            CheckpointBackendKind::Memory => Arc::new(InMemoryCheckpointBackend::new()),
        };
        Ok(Self::new(backend))
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryCheckpointBackend::new()))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Load and decode the state stored under `key`.
    ///
    /// A value that exists but cannot be decoded is reported as
    /// [`CheckpointError::Corrupt`] rather than treated as absent.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> CheckpointResult<Option<T>> {
        let Some(raw) = self.backend.read(key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| CheckpointError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })
    }

    /// Atomically replace the state stored under `key`.
    pub fn save<T: Serialize + ?Sized>(&self, key: &str, state: &T) -> CheckpointResult<()> {
        let raw = serde_json::to_string_pretty(state)
            .map_err(|e| CheckpointError::Serialization(e.to_string()))?;
        self.backend.write(key, &raw)
    }

    pub fn exists(&self, key: &str) -> CheckpointResult<bool> {
        self.backend.contains(key)
    }

    pub fn remove(&self, key: &str) -> CheckpointResult<bool> {
        self.backend.remove(key)
    }

    /// Keys under `prefix`, sorted.
    pub fn keys(&self, prefix: &str) -> CheckpointResult<Vec<String>> {
        self.backend.keys(prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Progress {
        page: u32,
        done: bool,
    }

    #[test]
    fn test_typed_round_trip_on_every_backend() {
        let dir = tempdir().unwrap();
        for kind in [
            CheckpointBackendKind::File,
            CheckpointBackendKind::Sqlite,
            CheckpointBackendKind::Memory,
        ] {
            let store = CheckpointStore::open(kind, &dir.path().join(format!("{:?}", kind))).unwrap();
            assert!(!store.exists("p/2012").unwrap());
            store.save("p/2012", &Progress { page: 3, done: false }).unwrap();
            assert!(store.exists("p/2012").unwrap());
            assert_eq!(
                store.load::<Progress>("p/2012").unwrap(),
                Some(Progress { page: 3, done: false })
            );
        }
    }

    #[test]
    fn test_undecodable_value_is_corrupt_not_absent() {
        let dir = tempdir().unwrap();
        let backend = Arc::new(FileCheckpointBackend::new(dir.path()).unwrap());
        backend.write("acquisition/cursor", "{not json").unwrap();

        let store = CheckpointStore::new(backend);
        let err = store.load::<Progress>("acquisition/cursor").unwrap_err();
        assert!(matches!(err, CheckpointError::Corrupt { ref key, .. } if key == "acquisition/cursor"));
    }

    #[test]
    fn test_memory_keys_are_prefix_scoped() {
        let store = CheckpointStore::in_memory();
        store.save("ledger/ocr/a", &1).unwrap();
        store.save("ledger/ocrx/a", &1).unwrap();
        store.save("ledger/ocr/b", &1).unwrap();
        assert_eq!(
            store.keys("ledger/ocr/").unwrap(),
            vec!["ledger/ocr/a".to_string(), "ledger/ocr/b".to_string()]
        );
    }

    #[test]
    fn test_backend_kind_parse() {
        assert_eq!("SQLite".parse::<CheckpointBackendKind>().unwrap(), CheckpointBackendKind::Sqlite);
        assert!("redis".parse::<CheckpointBackendKind>().is_err());
    }
}
