//! File-valued command arguments and their resolution into hashed metadata.
//!
//! The execution harness tags each argument at definition time as either a
//! plain value or a file reference with a read/write mode — a [`CmdArg`].
//! At recording time every [`FileArg`] is expanded to its concrete paths and
//! resolved into the [`FileArgRef`] that the step record stores.

use crate::hasher::ContentHasher;
use crate::record::{FileArgRef, FileMeta, FileMode};
use crate::types::ContentHash;
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use unicode_normalization::UnicodeNormalization;

/// Expands a raw argument value into the concrete paths it denotes.
///
/// The default resolver treats the value as one filename; a custom resolver
/// can expand a prefix into a group of files, a directory into its members,
/// and so on.
pub type PathResolver = Arc<dyn Fn(&str) -> Vec<PathBuf> + Send + Sync>;

/// One argument value as supplied by the execution harness.
#[derive(Clone)]
pub enum CmdArg {
    /// A non-file value, kept verbatim in the record.
    Plain(serde_json::Value),
    /// A file-valued argument, resolved to file metadata at recording time.
    File(FileArg),
}

impl CmdArg {
    pub fn plain(value: impl Into<serde_json::Value>) -> CmdArg {
        CmdArg::Plain(value.into())
    }

    /// A single input file named directly by `value`.
    pub fn input(value: impl Into<String>) -> CmdArg {
        CmdArg::File(FileArg::input(value))
    }

    /// A single output file named directly by `value`.
    pub fn output(value: impl Into<String>) -> CmdArg {
        CmdArg::File(FileArg::output(value))
    }
}

impl fmt::Debug for CmdArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CmdArg::Plain(v) => write!(f, "Plain({})", v),
            CmdArg::File(arg) => arg.fmt(f),
        }
    }
}

/// A file-valued argument before resolution: the raw value, the access mode,
/// and the resolver that expands the value into concrete paths.
#[derive(Clone)]
pub struct FileArg {
    pub value: String,
    pub mode: FileMode,
    resolver: Option<PathResolver>,
}

impl FileArg {
    pub fn input(value: impl Into<String>) -> FileArg {
        FileArg {
            value: value.into(),
            mode: FileMode::Read,
            resolver: None,
        }
    }

    pub fn output(value: impl Into<String>) -> FileArg {
        FileArg {
            value: value.into(),
            mode: FileMode::Write,
            resolver: None,
        }
    }

    /// Replace the default one-path resolver.
    pub fn with_resolver(mut self, resolver: PathResolver) -> FileArg {
        self.resolver = Some(resolver);
        self
    }

    /// The concrete paths this argument denotes.
    pub fn paths(&self) -> Vec<PathBuf> {
        match &self.resolver {
            Some(resolve) => resolve(&self.value),
            None => vec![PathBuf::from(&self.value)],
        }
    }

    /// Resolve into the stored representation, capturing per-file metadata.
    ///
    /// Content hash and stat fields are captured for inputs always, and for
    /// outputs only when `outputs_exist` (the step succeeded — a failed step
    /// may have left partial or garbage outputs). Capture failures degrade
    /// to default fields with a logged warning.
    pub fn resolve(&self, hasher: &ContentHasher, outputs_exist: bool) -> FileArgRef {
        let capture = self.mode == FileMode::Read || outputs_exist;
        let files = self
            .paths()
            .into_iter()
            .map(|path| gather_file_meta(&path, hasher, capture))
            .collect();
        FileArgRef {
            value: self.value.clone(),
            mode: self.mode,
            files,
        }
    }
}

impl fmt::Debug for FileArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self.mode {
            FileMode::Read => "InFile",
            FileMode::Write => "OutFile",
        };
        write!(f, "{}({})", kind, self.value)
    }
}

/// Canonical form of a path for identity purposes: symlinks and `.`/`..`
/// resolved, Unicode normalized to NFC, trailing separators stripped.
///
/// Falls back to a lexical absolute path when the file does not exist (the
/// canonical identity of a path must be computable even for files that were
/// deleted after recording).
pub fn canonical_path(path: &Path) -> PathBuf {
    let resolved = match dunce::canonicalize(path) {
        Ok(p) => p,
        Err(_) => {
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                std::env::current_dir()
                    .map(|cwd| cwd.join(path))
                    .unwrap_or_else(|_| path.to_path_buf())
            }
        }
    };

    let normalized: String = resolved.to_string_lossy().nfc().collect();
    let mut out = normalized;
    while out.len() > 1 && (out.ends_with('/') || out.ends_with('\\')) {
        out.pop();
    }
    PathBuf::from(out)
}

fn gather_file_meta(path: &Path, hasher: &ContentHasher, capture: bool) -> FileMeta {
    let mut meta = FileMeta {
        path: path.to_path_buf(),
        canonical_path: canonical_path(path),
        hash: ContentHash::empty(),
        size: 0,
        mtime: DateTime::UNIX_EPOCH,
        ctime: DateTime::UNIX_EPOCH,
        owner: String::new(),
        inode: 0,
        device: 0,
    };
    if !capture {
        return meta;
    }

    meta.hash = hasher.hash_file(path);
    match std::fs::metadata(path) {
        Ok(stat) => {
            meta.size = stat.len();
            meta.mtime = stat
                .modified()
                .map(DateTime::<Utc>::from)
                .unwrap_or(DateTime::UNIX_EPOCH);
            fill_platform_meta(&stat, &mut meta);
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Error getting file info");
        }
    }
    meta
}

#[cfg(unix)]
fn fill_platform_meta(stat: &std::fs::Metadata, meta: &mut FileMeta) {
    use std::os::unix::fs::MetadataExt;
    meta.ctime = Utc
        .timestamp_opt(stat.ctime(), stat.ctime_nsec() as u32)
        .single()
        .unwrap_or(DateTime::UNIX_EPOCH);
    meta.owner = stat.uid().to_string();
    meta.inode = stat.ino();
    meta.device = stat.dev();
}

#[cfg(not(unix))]
fn fill_platform_meta(_stat: &std::fs::Metadata, _meta: &mut FileMeta) {}
