//! Error types for provenance recording and lineage analysis.

use crate::types::ContentHash;
use std::path::PathBuf;
use thiserror::Error;

/// Metadata store errors
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid store location {0:?}: {1}")]
    InvalidLocation(String, std::io::Error),

    #[error("Store I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Errors while building a step record
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Metadata store location not configured")]
    StoreNotConfigured,

    #[error("Failed to serialize step record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Artifact cache errors
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("No cached artifact for hash {0:?}")]
    NotCached(ContentHash),

    #[error("Cannot cache artifact with empty content hash")]
    EmptyHash,

    #[error("Cache I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

/// Lineage graph errors.
///
/// `CycleDetected` and `NoProvenance` are data-integrity violations, not
/// recoverable runtime conditions: a cycle after repair signals a recording
/// or repair defect, and a point query on a file with no resolvable producer
/// has no meaningful answer.
#[derive(Debug, Error)]
pub enum GraphError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Provenance graph contains a cycle after repair")]
    CycleDetected,

    #[error("No provenance recorded for file {0:?}")]
    NoProvenance(PathBuf),

    #[error("File not found: {0:?}")]
    FileNotFound(PathBuf),
}
