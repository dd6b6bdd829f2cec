//! Content hashing of data files using BLAKE3.
//!
//! Hashes are algorithm-tagged (`blake3_<hex>`) so stored identities remain
//! unambiguous if the algorithm ever changes. Hashing is best-effort and
//! never raises: a missing file, a special file, or a permission error
//! degrades to the empty marker with a logged warning.

use crate::types::ContentHash;
use std::fs::File;
use std::io;
use std::path::Path;
use tracing::warn;

/// Tag prepended to every digest produced by [`ContentHasher`].
const HASH_ALGORITHM: &str = "blake3";

/// Computes stable content identities for files.
#[derive(Debug, Clone)]
pub struct ContentHasher {
    enabled: bool,
}

impl Default for ContentHasher {
    fn default() -> Self {
        ContentHasher::new()
    }
}

impl ContentHasher {
    pub fn new() -> Self {
        ContentHasher { enabled: true }
    }

    /// A hasher that yields the empty marker for every file, for callers
    /// that have hashing switched off but still capture other metadata.
    pub fn disabled() -> Self {
        ContentHasher { enabled: false }
    }

    /// Compute the algorithm-tagged content hash of the file at `path`.
    ///
    /// Returns the empty marker if the path does not name a regular file
    /// (FIFOs are explicitly skipped to avoid blocking reads) or if reading
    /// fails for any reason.
    pub fn hash_file(&self, path: &Path) -> ContentHash {
        if !self.enabled {
            return ContentHash::empty();
        }
        match self.try_hash_file(path) {
            Ok(Some(hash)) => hash,
            Ok(None) => ContentHash::empty(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Cannot compute content hash");
                ContentHash::empty()
            }
        }
    }

    /// Compute the tagged hash of a byte slice (used by tests and the
    /// artifact cache to derive keys for in-memory content).
    pub fn hash_bytes(&self, bytes: &[u8]) -> ContentHash {
        let digest = blake3::hash(bytes);
        ContentHash(format!("{}_{}", HASH_ALGORITHM, hex::encode(digest.as_bytes())))
    }

    fn try_hash_file(&self, path: &Path) -> io::Result<Option<ContentHash>> {
        let meta = match std::fs::metadata(path) {
            Ok(m) => m,
            // Missing file is an expected condition, not an error.
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        };
        if !meta.is_file() || is_fifo(&meta) {
            return Ok(None);
        }

        let mut file = File::open(path)?;
        let mut hasher = blake3::Hasher::new();
        io::copy(&mut file, &mut hasher)?;
        Ok(Some(ContentHash(format!(
            "{}_{}",
            HASH_ALGORITHM,
            hex::encode(hasher.finalize().as_bytes())
        ))))
    }
}

#[cfg(unix)]
fn is_fifo(meta: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::FileTypeExt;
    meta.file_type().is_fifo()
}

#[cfg(not(unix))]
fn is_fifo(_meta: &std::fs::Metadata) -> bool {
    false
}
