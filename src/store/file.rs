//! File-backed record store
//!
//! Each record is a JSON file at `<root>/<segment>/.../<last>.json`.

use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::core::MeshResult;

use super::key::RecordKey;
use super::RecordStore;

const RECORD_EXTENSION: &str = "json";

/// Record store rooted at a directory shared by all sessions on the host
#[derive(Debug, Clone)]
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    /// Create a store rooted at `root`; the directory is created on first write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Get the root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory that holds the children of `key`
    fn dir_path(&self, key: &RecordKey) -> PathBuf {
        key.segments().fold(self.root.clone(), |path, segment| path.join(segment))
    }

    /// File that holds the record at `key`
    fn record_path(&self, key: &RecordKey) -> PathBuf {
        // Not `with_extension`: segments may contain dots
        let mut path = self.dir_path(key);
        path.set_file_name(format!("{}.{}", key.last(), RECORD_EXTENSION));
        path
    }

    fn read_record(path: &Path) -> MeshResult<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Collect every record below `dir`, whose keys start with `prefix`
    fn walk(&self, dir: &Path, prefix: &RecordKey, out: &mut Vec<(RecordKey, Vec<u8>)>) -> MeshResult<()> {
        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };

        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if path.is_dir() {
                // Directories that aren't valid segments were not created by us
                if let Ok(child) = prefix.child(name) {
                    self.walk(&path, &child, out)?;
                }
                continue;
            }

            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Ok(key) = prefix.child(stem) else {
                continue;
            };

            match Self::read_record(&path) {
                Ok(Some(bytes)) => out.push((key, bytes)),
                // Deleted between read_dir and read
                Ok(None) => {}
                Err(e) => tracing::warn!(key = %key, error = %e, "Skipping unreadable record"),
            }
        }

        Ok(())
    }
}

impl RecordStore for FileStore {
    fn put(&self, key: &RecordKey, value: &[u8]) -> MeshResult<()> {
        let path = self.record_path(key);
        let parent = path.parent().unwrap_or(&self.root);
        fs::create_dir_all(parent)?;

        // Write beside the target so the rename never crosses filesystems
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(value)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;

        tracing::debug!(key = %key, bytes = value.len(), "Stored record");
        Ok(())
    }

    fn get(&self, key: &RecordKey) -> MeshResult<Option<Vec<u8>>> {
        Self::read_record(&self.record_path(key))
    }

    fn list(&self, prefix: &RecordKey) -> MeshResult<Vec<(RecordKey, Vec<u8>)>> {
        let mut records = Vec::new();

        if let Some(bytes) = Self::read_record(&self.record_path(prefix))? {
            records.push((prefix.clone(), bytes));
        }
        self.walk(&self.dir_path(prefix), prefix, &mut records)?;

        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }

    fn delete(&self, key: &RecordKey) -> MeshResult<()> {
        match fs::remove_file(self.record_path(key)) {
            Ok(()) => {
                tracing::debug!(key = %key, "Deleted record");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
