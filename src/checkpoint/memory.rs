//! In-memory checkpoint backend for tests and dry runs.
//!
//! State is not persisted across restarts.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::backend::{validate_key, CheckpointBackend, CheckpointResult};

#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointBackend {
    entries: Arc<Mutex<BTreeMap<String, String>>>,
}

impl InMemoryCheckpointBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        // A panic while holding the lock cannot leave a half-written entry.
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CheckpointBackend for InMemoryCheckpointBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn read(&self, key: &str) -> CheckpointResult<Option<String>> {
        validate_key(key)?;
        Ok(self.entries().get(key).cloned())
    }

    fn write(&self, key: &str, value: &str) -> CheckpointResult<()> {
        validate_key(key)?;
        self.entries().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> CheckpointResult<bool> {
        validate_key(key)?;
        Ok(self.entries().remove(key).is_some())
    }

    fn keys(&self, prefix: &str) -> CheckpointResult<Vec<String>> {
        Ok(self
            .entries()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}
