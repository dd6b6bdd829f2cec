//! Tracking configuration.
//!
//! Recording is opt-in: with no store location configured, instrumented
//! commands run untracked and this crate has no effect. Configuration comes
//! from the environment (the normal path for pipeline runs) or is built
//! programmatically.
//!
//! Environment variables:
//! - `PEDIGREE_STORE_PATH`: directory to record step metadata to; recording
//!   is enabled iff this is set.
//! - `PEDIGREE_CACHE_DIR`: directory for the content-addressed artifact
//!   cache; caching and reuse checks are enabled iff this is set.
//! - `PEDIGREE_RUN_ID`: run id inherited by every step of one workflow.
//! - `PEDIGREE_META_<KEY>`: ambient metadata attached to every step record.
//! - `PEDIGREE_LOG`: tracing filter for this crate's own logging.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub const STORE_PATH_ENV: &str = "PEDIGREE_STORE_PATH";
pub const CACHE_DIR_ENV: &str = "PEDIGREE_CACHE_DIR";
pub const RUN_ID_ENV: &str = "PEDIGREE_RUN_ID";
pub const METADATA_VALUE_PREFIX: &str = "PEDIGREE_META_";

/// Provenance tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Metadata store location; `None` disables recording entirely.
    #[serde(default)]
    pub store_location: Option<String>,

    /// Artifact cache directory; `None` disables caching and reuse checks.
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Hash input files when recording (outputs are always hashed on
    /// success). Disable to cut recording cost on huge inputs.
    #[serde(default = "default_true")]
    pub hash_inputs: bool,

    /// Capture run environment details (host, user, platform, cpus).
    #[serde(default = "default_true")]
    pub capture_env: bool,
}

fn default_true() -> bool {
    true
}

impl Default for TrackingConfig {
    fn default() -> Self {
        TrackingConfig {
            store_location: None,
            cache_dir: None,
            hash_inputs: true,
            capture_env: true,
        }
    }
}

impl TrackingConfig {
    /// Build configuration from the process environment.
    pub fn from_env() -> TrackingConfig {
        TrackingConfig {
            store_location: std::env::var(STORE_PATH_ENV).ok().filter(|s| !s.is_empty()),
            cache_dir: std::env::var(CACHE_DIR_ENV)
                .ok()
                .filter(|s| !s.is_empty())
                .map(PathBuf::from),
            ..TrackingConfig::default()
        }
    }

    /// Recording is enabled iff a store location is configured.
    pub fn is_enabled(&self) -> bool {
        self.store_location.is_some()
    }

    /// Explicitly enable recording to the given store location.
    pub fn with_store(mut self, location: impl Into<String>) -> TrackingConfig {
        self.store_location = Some(location.into());
        self
    }

    /// Enable the artifact cache and advisory reuse checks.
    pub fn with_cache(mut self, dir: impl Into<PathBuf>) -> TrackingConfig {
        self.cache_dir = Some(dir.into());
        self
    }
}

/// Ambient step metadata from `PEDIGREE_META_<KEY>` environment variables.
pub fn metadata_from_env() -> std::collections::BTreeMap<String, String> {
    std::env::vars()
        .filter_map(|(k, v)| {
            k.strip_prefix(METADATA_VALUE_PREFIX)
                .map(|key| (key.to_lowercase(), v))
        })
        .collect()
}
