//! Durable storage for enrolled embeddings.
//!
//! The gallery is small and read whole at startup, then rewritten whole on
//! every registration. The JSON store writes to a sibling temp file, syncs
//! it, and renames it over the old file, so a crash mid-write leaves the
//! previous gallery intact.

use crate::types::GalleryEntry;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

const FORMAT_VERSION: u32 = 1;

#[derive(Error, Debug)]
pub enum GalleryError {
    #[error("gallery I/O on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("gallery file {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },
    #[error("embedding has {actual} dimensions, gallery uses {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("embedding from extractor {actual}, gallery uses {expected}")]
    VersionMismatch { expected: String, actual: String },
}

pub trait GalleryStore {
    fn load(&self) -> Result<Vec<GalleryEntry>, GalleryError>;
    fn save(&mut self, entries: &[GalleryEntry]) -> Result<(), GalleryError>;
}

#[derive(Serialize, Deserialize)]
struct GalleryFile {
    version: u32,
    entries: Vec<GalleryEntry>,
}

/// Gallery persisted as a single JSON document.
#[derive(Debug, Clone)]
pub struct JsonGalleryStore {
    path: PathBuf,
}

impl JsonGalleryStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_err(&self, source: std::io::Error) -> GalleryError {
        GalleryError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "gallery".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl GalleryStore for JsonGalleryStore {
    fn load(&self) -> Result<Vec<GalleryEntry>, GalleryError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %self.path.display(), "no gallery yet, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(self.io_err(e)),
        };

        let doc: GalleryFile =
            serde_json::from_reader(BufReader::new(file)).map_err(|e| GalleryError::Corrupt {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        if doc.version != FORMAT_VERSION {
            return Err(GalleryError::Corrupt {
                path: self.path.clone(),
                reason: format!("unsupported format version {}", doc.version),
            });
        }
        check_dimensions(&doc.entries).map_err(|e| GalleryError::Corrupt {
            path: self.path.clone(),
            reason: e.to_string(),
        })?;

        tracing::info!(path = %self.path.display(), entries = doc.entries.len(), "gallery loaded");
        Ok(doc.entries)
    }

    fn save(&mut self, entries: &[GalleryEntry]) -> Result<(), GalleryError> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| self.io_err(e))?;
        }

        let tmp = self.temp_path();
        let doc = GalleryFile {
            version: FORMAT_VERSION,
            entries: entries.to_vec(),
        };

        let file = File::create(&tmp).map_err(|e| self.io_err(e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &doc).map_err(|e| self.io_err(e.into()))?;
        writer.flush().map_err(|e| self.io_err(e))?;
        writer
            .get_ref()
            .sync_all()
            .map_err(|e| self.io_err(e))?;
        drop(writer);

        fs::rename(&tmp, &self.path).map_err(|e| self.io_err(e))?;
        tracing::debug!(path = %self.path.display(), entries = entries.len(), "gallery written");
        Ok(())
    }
}

/// In-memory gallery; nothing survives the process.
#[derive(Debug, Default, Clone)]
pub struct MemoryGalleryStore {
    entries: Vec<GalleryEntry>,
    /// When set, every save fails, for exercising write-failure paths.
    pub fail_writes: bool,
}

impl MemoryGalleryStore {
    pub fn with_entries(entries: Vec<GalleryEntry>) -> Self {
        Self {
            entries,
            fail_writes: false,
        }
    }
}

impl GalleryStore for MemoryGalleryStore {
    fn load(&self) -> Result<Vec<GalleryEntry>, GalleryError> {
        Ok(self.entries.clone())
    }

    fn save(&mut self, entries: &[GalleryEntry]) -> Result<(), GalleryError> {
        if self.fail_writes {
            return Err(GalleryError::Io {
                path: PathBuf::from("<memory>"),
                source: std::io::Error::new(std::io::ErrorKind::Other, "writes disabled"),
            });
        }
        self.entries = entries.to_vec();
        Ok(())
    }
}

/// All entries must share one embedding dimension.
pub fn check_dimensions(entries: &[GalleryEntry]) -> Result<(), GalleryError> {
    let Some(first) = entries.first() else {
        return Ok(());
    };
    let expected = first.embedding.dim();
    match entries.iter().find(|e| e.embedding.dim() != expected) {
        Some(bad) => Err(GalleryError::DimensionMismatch {
            expected,
            actual: bad.embedding.dim(),
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Embedding;

    fn entry(name: &str, values: Vec<f32>) -> GalleryEntry {
        GalleryEntry { name: name.into(), embedding: Embedding::new(values) }
    }

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonGalleryStore::new(dir.path().join("embeddings.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonGalleryStore::new(dir.path().join("nested/embeddings.json"));
        let entries = vec![entry("alice", vec![0.1, 0.2]), entry("bob", vec![0.3, 0.4])];
        store.save(&entries).unwrap();

        let loaded = JsonGalleryStore::new(store.path()).load().unwrap();
        assert_eq!(loaded, entries);
        assert!(!store.temp_path().exists());
    }

    #[test]
    fn test_rewrite_replaces_whole_gallery() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonGalleryStore::new(dir.path().join("embeddings.json"));
        store.save(&[entry("alice", vec![1.0])]).unwrap();
        store.save(&[entry("alice", vec![1.0]), entry("bob", vec![2.0])]).unwrap();
        assert_eq!(store.load().unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_file_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("embeddings.json");
        fs::write(&path, b"{not json").unwrap();
        let err = JsonGalleryStore::new(&path).load().unwrap_err();
        assert!(matches!(err, GalleryError::Corrupt { .. }));
    }

    #[test]
    fn test_stale_temp_file_does_not_affect_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = JsonGalleryStore::new(dir.path().join("embeddings.json"));
        store.save(&[entry("alice", vec![1.0])]).unwrap();
        // Simulate a crash after the temp write but before rename.
        fs::write(store.temp_path(), b"garbage").unwrap();
        assert_eq!(store.load().unwrap(), vec![entry("alice", vec![1.0])]);
    }

    #[test]
    fn test_mixed_dimensions_rejected() {
        let entries = vec![entry("a", vec![1.0, 2.0]), entry("b", vec![1.0])];
        assert!(matches!(
            check_dimensions(&entries),
            Err(GalleryError::DimensionMismatch { expected: 2, actual: 1 })
        ));
    }
}
