//! Shared identity types for steps, runs, and file states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Identifier of one step: a particular invocation of a particular command.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(pub String);

impl StepId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        StepId(s.to_string())
    }
}

/// Identifier of one run: a set of steps executed as part of one workflow.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Algorithm-tagged content hash of a file, e.g. `blake3_<hex>`.
///
/// The empty marker stands for "hash unavailable" (missing file, special
/// file, permission error). Hashing never fails hard; it degrades to this.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
    /// The empty marker: content identity could not be computed.
    pub fn empty() -> Self {
        ContentHash(String::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identity of one observed state of a file: three files with the same path
/// but different content or modification time are distinct states.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileSig {
    /// Canonical path (symlinks resolved, Unicode-normalized).
    pub canonical_path: PathBuf,
    /// Content hash at observation time; may be the empty marker.
    pub hash: ContentHash,
    /// Modification time at observation time.
    pub mtime: DateTime<Utc>,
}

impl FileSig {
    pub fn new(canonical_path: impl Into<PathBuf>, hash: ContentHash, mtime: DateTime<Utc>) -> Self {
        FileSig {
            canonical_path: canonical_path.into(),
            hash,
            mtime,
        }
    }

    pub fn path(&self) -> &Path {
        &self.canonical_path
    }
}

impl fmt::Display for FileSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} ({})",
            self.canonical_path.display(),
            self.mtime.to_rfc3339(),
            if self.hash.is_empty() { "unhashed" } else { self.hash.as_str() }
        )
    }
}
