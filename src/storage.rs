//! Artifact storage on disk, keyed by document id per artifact kind.
//!
//! Layout under the data directory:
//! `raw/{id}.{ext}`, `text/{id}.txt`, `records/{id}.json`, `metadata/{id}.json`.
//! A document's id is its raw file stem. All writes go through a temp file
//! in the destination directory followed by a rename.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::warn;

use crate::models::ArtifactKind;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Serialization error for {path}: {reason}")]
    Serialization { path: PathBuf, reason: String },
    #[error("Invalid document id: {0:?}")]
    InvalidId(String),
}

fn io_err(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> StorageError {
    let path = path.into();
    move |source| StorageError::Io { path, source }
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Write `bytes` to `path` so readers see either the old file or the new one.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> StorageResult<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_err(parent))?;

    let mut tmp = NamedTempFile::new_in(parent).map_err(io_err(parent))?;
    tmp.write_all(bytes).map_err(io_err(path))?;
    tmp.as_file().sync_all().map_err(io_err(path))?;
    tmp.persist(path).map_err(|e| StorageError::Io {
        path: path.to_path_buf(),
        source: e.error,
    })?;
    Ok(())
}

/// Hex SHA-256 of some content.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Map MIME type to file extension.
pub fn mime_to_extension(mime: &str) -> &'static str {
    let essence = mime.split(';').next().unwrap_or(mime).trim();
    match essence {
        "application/pdf" => "pdf",
        "text/html" => "html",
        "text/plain" => "txt",
        "image/jpeg" => "jpg",
        "image/png" => "png",
        "image/gif" => "gif",
        "image/tiff" => "tif",
        _ => "bin",
    }
}

fn validate_id(id: &str) -> StorageResult<()> {
    if id.is_empty()
        || id.starts_with('.')
        || id.contains(['/', '\\', '\0'])
    {
        return Err(StorageError::InvalidId(id.to_string()));
    }
    Ok(())
}

/// Per-kind artifact directories rooted at the data directory.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn dir(&self, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    pub fn ensure_dirs(&self) -> StorageResult<()> {
        for kind in [
            ArtifactKind::Raw,
            ArtifactKind::Text,
            ArtifactKind::Record,
            ArtifactKind::Metadata,
        ] {
            let dir = self.dir(kind);
            fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        }
        Ok(())
    }

    /// Path an artifact would be written to. Raw artifacts need an extension.
    pub fn path_for(&self, kind: ArtifactKind, id: &str, extension: Option<&str>) -> PathBuf {
        let ext = kind.extension().or(extension);
        let file_name = match ext {
            Some(ext) => format!("{}.{}", id, ext),
            None => id.to_string(),
        };
        self.dir(kind).join(file_name)
    }

    /// All artifacts of a kind, by document id.
    pub fn list(&self, kind: ArtifactKind) -> StorageResult<BTreeMap<String, PathBuf>> {
        let dir = self.dir(kind);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeMap::new()),
            Err(e) => return Err(io_err(&dir)(e)),
        };

        let mut found: BTreeMap<String, PathBuf> = BTreeMap::new();
        for entry in entries {
            let entry = entry.map_err(io_err(&dir))?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let Some(id) = Self::id_from_name(kind, &name) else {
                continue;
            };
            if let Some(previous) = found.get(&id) {
                warn!(
                    "Duplicate {} artifact for {}: keeping {}, ignoring {}",
                    kind,
                    id,
                    previous.display(),
                    path.display()
                );
                continue;
            }
            found.insert(id, path);
        }
        Ok(found)
    }

    fn id_from_name(kind: ArtifactKind, name: &str) -> Option<String> {
        match kind.extension() {
            Some(ext) => name
                .strip_suffix(&format!(".{}", ext))
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            None => Path::new(name)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned()),
        }
    }

    /// Locate an existing artifact.
    pub fn find(&self, kind: ArtifactKind, id: &str) -> StorageResult<Option<PathBuf>> {
        validate_id(id)?;
        if kind.extension().is_some() {
            let path = self.path_for(kind, id, None);
            return Ok(path.is_file().then_some(path));
        }
        Ok(self.list(kind)?.remove(id))
    }

    pub fn exists(&self, kind: ArtifactKind, id: &str) -> StorageResult<bool> {
        Ok(self.find(kind, id)?.is_some())
    }

    /// Whether the artifact exists and holds something other than whitespace.
    pub fn has_content(&self, kind: ArtifactKind, id: &str) -> StorageResult<bool> {
        let Some(path) = self.find(kind, id)? else {
            return Ok(false);
        };
        let bytes = fs::read(&path).map_err(io_err(&path))?;
        Ok(bytes.iter().any(|b| !b.is_ascii_whitespace()))
    }

    pub fn write(
        &self,
        kind: ArtifactKind,
        id: &str,
        extension: Option<&str>,
        bytes: &[u8],
    ) -> StorageResult<PathBuf> {
        validate_id(id)?;
        let path = self.path_for(kind, id, extension);
        write_atomic(&path, bytes)?;
        Ok(path)
    }

    /// Delete an artifact. Returns whether one existed.
    pub fn remove(&self, kind: ArtifactKind, id: &str) -> StorageResult<bool> {
        let Some(path) = self.find(kind, id)? else {
            return Ok(false);
        };
        fs::remove_file(&path).map_err(io_err(&path))?;
        Ok(true)
    }

    pub fn read(&self, kind: ArtifactKind, id: &str) -> StorageResult<Option<Vec<u8>>> {
        let Some(path) = self.find(kind, id)? else {
            return Ok(None);
        };
        fs::read(&path).map(Some).map_err(io_err(path))
    }

    pub fn read_text(&self, kind: ArtifactKind, id: &str) -> StorageResult<Option<String>> {
        Ok(self
            .read(kind, id)?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    pub fn write_json<T: Serialize>(
        &self,
        kind: ArtifactKind,
        id: &str,
        value: &T,
    ) -> StorageResult<PathBuf> {
        let json = serde_json::to_vec_pretty(value).map_err(|e| StorageError::Serialization {
            path: self.path_for(kind, id, None),
            reason: e.to_string(),
        })?;
        self.write(kind, id, None, &json)
    }

    pub fn read_json<T: DeserializeOwned>(
        &self,
        kind: ArtifactKind,
        id: &str,
    ) -> StorageResult<Option<T>> {
        let Some(path) = self.find(kind, id)? else {
            return Ok(None);
        };
        let bytes = fs::read(&path).map_err(io_err(&path))?;
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Serialization {
                path,
                reason: e.to_string(),
            })
    }
}
