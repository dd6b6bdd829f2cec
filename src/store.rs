//! The metadata store: a flat directory of step record files.
//!
//! One JSON file per step, named `<step_id>.crc32_<8-hex-digit checksum>.json`.
//! The checksum is computed over the serialized bytes, so two distinct
//! records can never collide on both id and checksum — concurrent writers
//! need no locking. The store is append-only; nothing here updates or
//! deletes records.

use crate::error::StoreError;
use crate::types::StepId;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Handle to a metadata store directory.
#[derive(Debug, Clone)]
pub struct MetadataStore {
    location: String,
    root: PathBuf,
}

impl MetadataStore {
    /// Open (creating if needed) the store at the given location string.
    pub fn open(location: &str) -> Result<Self, StoreError> {
        let root = PathBuf::from(location);
        fs::create_dir_all(&root)
            .map_err(|e| StoreError::InvalidLocation(location.to_string(), e))?;
        Ok(MetadataStore {
            location: location.to_string(),
            root,
        })
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Compute the checksum-qualified filename for a serialized record.
    pub fn record_filename(step_id: &StepId, json: &str) -> String {
        let crc = crc32fast::hash(json.as_bytes());
        format!("{}.crc32_{:08x}.json", step_id, crc)
    }

    /// Write one record file.
    ///
    /// Writes to a temporary name and renames into place. A record file that
    /// already exists is left untouched: identical name implies identical
    /// id and checksum, hence identical content.
    pub fn write_record(&self, filename: &str, json: &str) -> Result<PathBuf, StoreError> {
        let path = self.root.join(filename);
        if path.exists() {
            return Ok(path);
        }

        let temp_path = path.with_extension("json.tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, &path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            StoreError::IoError(e)
        })?;
        Ok(path)
    }

    /// Flat enumeration of all record files currently in the store.
    pub fn list_records(&self) -> Result<Vec<PathBuf>, StoreError> {
        let mut records = Vec::new();
        for entry in WalkDir::new(&self.root).max_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                StoreError::IoError(std::io::Error::other(e))
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            if entry.path().extension().and_then(|e| e.to_str()) == Some("json") {
                records.push(entry.into_path());
            }
        }
        Ok(records)
    }

    /// Read the content of one record file.
    pub fn read_record(&self, path: &Path) -> Result<String, StoreError> {
        Ok(fs::read_to_string(path)?)
    }
}
