//! Content-addressed cache of step output files.
//!
//! A flat directory with one file per distinct content hash, filename = the
//! hash string. Concurrent writers for the same hash are safe without
//! coordination: content at a given hash is identical, so a redundant write
//! changes nothing.

use crate::error::CacheError;
use crate::types::ContentHash;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Flat content-hash-keyed artifact store.
#[derive(Debug, Clone)]
pub struct ArtifactCache {
    dir: PathBuf,
}

impl ArtifactCache {
    /// Open (creating if needed) the cache directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(ArtifactCache { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Store artifact bytes under their content hash.
    pub fn save(&self, hash: &ContentHash, bytes: &[u8]) -> Result<(), CacheError> {
        let path = self.entry_path(hash)?;
        if path.exists() {
            return Ok(());
        }
        fs::write(&path, bytes)?;
        Ok(())
    }

    /// Copy an existing file into the cache under its content hash.
    pub fn save_file(&self, hash: &ContentHash, src: &Path) -> Result<(), CacheError> {
        let path = self.entry_path(hash)?;
        if path.exists() {
            return Ok(());
        }
        fs::copy(src, &path)?;
        debug!(hash = %hash, src = %src.display(), "Cached step output");
        Ok(())
    }

    /// Whether an artifact with this content hash is cached.
    pub fn exists(&self, hash: &ContentHash) -> bool {
        self.entry_path(hash).map(|p| p.is_file()).unwrap_or(false)
    }

    /// Fetch cached artifact bytes.
    pub fn fetch(&self, hash: &ContentHash) -> Result<Vec<u8>, CacheError> {
        let path = self.entry_path(hash)?;
        if !path.is_file() {
            return Err(CacheError::NotCached(hash.clone()));
        }
        Ok(fs::read(&path)?)
    }

    fn entry_path(&self, hash: &ContentHash) -> Result<PathBuf, CacheError> {
        if hash.is_empty() {
            return Err(CacheError::EmptyHash);
        }
        Ok(self.dir.join(hash.as_str()))
    }
}
