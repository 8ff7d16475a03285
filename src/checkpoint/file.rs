//! File checkpoint backend: one JSON file per key.
//!
//! Writes go to a temp file in the destination directory which is then
//! renamed over the target, so a crash leaves either the old or the new file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;

use super::backend::{validate_key, CheckpointBackend, CheckpointError, CheckpointResult};

const EXTENSION: &str = "json";

/// Directory-backed checkpoint store.
#[derive(Debug, Clone)]
pub struct FileCheckpointBackend {
    root: PathBuf,
}

impl FileCheckpointBackend {
    /// Open (and create if needed) a checkpoint directory.
    pub fn new(root: impl Into<PathBuf>) -> CheckpointResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| CheckpointError::io(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.split('/') {
            path.push(segment);
        }
        let file_name = format!(
            "{}.{}",
            path.file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            EXTENSION
        );
        path.set_file_name(file_name);
        path
    }

    fn collect_keys(&self, dir: &Path, out: &mut Vec<String>) -> CheckpointResult<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(CheckpointError::io(dir, e)),
        };

        for entry in entries {
            let entry = entry.map_err(|e| CheckpointError::io(dir, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| CheckpointError::io(&path, e))?;

            if file_type.is_dir() {
                self.collect_keys(&path, out)?;
                continue;
            }

            let name = entry.file_name().to_string_lossy().into_owned();
            // Leftover temp files from an interrupted write
            if name.starts_with(".tmp") {
                continue;
            }
            let Some(stem) = name.strip_suffix(&format!(".{}", EXTENSION)) else {
                continue;
            };

            let Ok(relative) = path.strip_prefix(&self.root) else {
                continue;
            };
            let mut segments: Vec<String> = relative
                .parent()
                .map(|p| {
                    p.components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect()
                })
                .unwrap_or_default();
            segments.push(stem.to_string());
            out.push(segments.join("/"));
        }
        Ok(())
    }
}

/// Flush directory metadata so the rename itself survives power loss.
#[cfg(unix)]
fn sync_dir(dir: &Path) {
    if let Ok(handle) = fs::File::open(dir) {
        let _ = handle.sync_all();
    }
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) {}

impl CheckpointBackend for FileCheckpointBackend {
    fn name(&self) -> &'static str {
        "file"
    }

    fn read(&self, key: &str) -> CheckpointResult<Option<String>> {
        validate_key(key)?;
        let path = self.path_for(key);
        match fs::read_to_string(&path) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(CheckpointError::io(path, e)),
        }
    }

    fn write(&self, key: &str, value: &str) -> CheckpointResult<()> {
        validate_key(key)?;
        let path = self.path_for(key);
        let parent = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent).map_err(|e| CheckpointError::io(&parent, e))?;

        let mut tmp = NamedTempFile::new_in(&parent).map_err(|e| CheckpointError::io(&parent, e))?;
        tmp.write_all(value.as_bytes())
            .map_err(|e| CheckpointError::io(tmp.path(), e))?;
        tmp.as_file()
            .sync_all()
            .map_err(|e| CheckpointError::io(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| CheckpointError::io(&path, e.error))?;
        sync_dir(&parent);

        debug!("checkpoint written: {}", key);
        Ok(())
    }

    fn remove(&self, key: &str) -> CheckpointResult<bool> {
        validate_key(key)?;
        let path = self.path_for(key);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(CheckpointError::io(path, e)),
        }
    }

    fn keys(&self, prefix: &str) -> CheckpointResult<Vec<String>> {
        let mut keys = Vec::new();
        self.collect_keys(&self.root, &mut keys)?;
        keys.retain(|k| k.starts_with(prefix));
        keys.sort();
        Ok(keys)
    }
}
