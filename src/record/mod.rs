//! The step record data model.
//!
//! One [`StepRecord`] captures one execution of one command: its arguments
//! (with file-valued arguments resolved to hashed file metadata), the run
//! environment, timing and outcome, and a best-effort code version. Records
//! are immutable and append-only: created once at step completion, never
//! updated or deleted by this system.
//!
//! On disk a record is a JSON object with a top-level `format` version and a
//! `step` object. All mappings are `BTreeMap`s, so serialization has
//! deterministic key order.

pub mod file_arg;

pub use file_arg::{CmdArg, FileArg, PathResolver};

use crate::types::{ContentHash, RunId, StepId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Semantic version of the record schema.
pub const RECORD_FORMAT: &str = "1.0.0";

/// Prefix of `metadata_from_cmd_line` keys that attach per-argument metadata
/// to graph edges: `file.<arg>.<name>`.
const FILE_METADATA_PREFIX: &str = "file.";

fn epoch() -> DateTime<Utc> {
    DateTime::UNIX_EPOCH
}

/// Top-level envelope of a serialized step record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepEnvelope {
    pub format: String,
    pub step: StepRecord,
}

impl StepEnvelope {
    pub fn new(step: StepRecord) -> Self {
        StepEnvelope {
            format: RECORD_FORMAT.to_string(),
            step,
        }
    }

    /// Serialize with deterministic key ordering.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse a record, rejecting any that lack the required key set
    /// (`format`, `step.step_id`, `step.cmd_module`, `step.args`). Optional
    /// fields missing from older records fall back to defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// Everything recorded about one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub step_id: StepId,
    #[serde(default)]
    pub run_id: RunId,
    pub cmd_module: String,
    #[serde(default)]
    pub cmd_name: String,
    pub args: BTreeMap<String, ArgValue>,
    #[serde(default)]
    pub run_env: RunEnv,
    #[serde(default)]
    pub run_info: RunInfo,
    #[serde(default)]
    pub metadata_from_cmd_line: BTreeMap<String, String>,
    #[serde(default)]
    pub metadata_from_cmd_return: BTreeMap<String, String>,
    /// Steps that were already running when this step started, outermost
    /// first. Non-empty means this was a nested sub-invocation.
    #[serde(default)]
    pub enclosing_steps: Vec<StepId>,
    #[serde(default)]
    pub version_info: VersionInfo,
}

impl StepRecord {
    /// Display name of the step: the `step_name` command-line metadata entry
    /// if present, else the command name.
    pub fn step_name(&self) -> &str {
        self.metadata_from_cmd_line
            .get("step_name")
            .map(String::as_str)
            .unwrap_or(&self.cmd_name)
    }

    /// All file-valued argument references, flattened out of lists, paired
    /// with the argument name that carried them.
    pub fn file_refs(&self) -> Vec<(&str, &FileArgRef)> {
        let mut out = Vec::new();
        for (arg, val) in &self.args {
            for fref in val.file_refs() {
                out.push((arg.as_str(), fref));
            }
        }
        out
    }

    /// Per-argument metadata overrides supplied at invocation time, taken
    /// from `metadata_from_cmd_line` keys of the form `file.<arg>.<name>`.
    pub fn metadata_overrides_for(&self, arg: &str) -> BTreeMap<String, String> {
        let prefix = format!("{}{}.", FILE_METADATA_PREFIX, arg);
        self.metadata_from_cmd_line
            .iter()
            .filter_map(|(k, v)| {
                k.strip_prefix(&prefix)
                    .map(|name| (name.to_string(), v.clone()))
            })
            .collect()
    }
}

/// The recorded value of one command argument.
///
/// File-valued arguments are a distinct variant, decided at argument
/// definition time; nothing is inferred from value shape at serialization
/// time. The only object-shaped JSON form is `Files`, so the untagged
/// representation is unambiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Files(FileArgRef),
    List(Vec<ArgValue>),
}

impl ArgValue {
    /// Convert a plain (non-file) JSON value supplied by the argument
    /// framework. Objects have no plain representation and are rendered to
    /// their compact JSON text.
    pub fn from_plain(value: serde_json::Value) -> ArgValue {
        match value {
            serde_json::Value::Null => ArgValue::Null,
            serde_json::Value::Bool(b) => ArgValue::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ArgValue::Int(i)
                } else {
                    ArgValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => ArgValue::Str(s),
            serde_json::Value::Array(items) => {
                ArgValue::List(items.into_iter().map(ArgValue::from_plain).collect())
            }
            other @ serde_json::Value::Object(_) => ArgValue::Str(other.to_string()),
        }
    }

    /// File references carried by this value, flattened out of lists.
    pub fn file_refs(&self) -> Vec<&FileArgRef> {
        match self {
            ArgValue::Files(fref) => vec![fref],
            ArgValue::List(items) => items.iter().flat_map(ArgValue::file_refs).collect(),
            _ => Vec::new(),
        }
    }

    pub fn is_file_valued(&self) -> bool {
        !self.file_refs().is_empty()
    }

    /// Render for attribute comparison: scalars bare, lists bracketed.
    pub fn to_display_string(&self) -> String {
        match self {
            ArgValue::Null => "null".to_string(),
            ArgValue::Bool(b) => b.to_string(),
            ArgValue::Int(i) => i.to_string(),
            ArgValue::Float(x) => x.to_string(),
            ArgValue::Str(s) => s.clone(),
            ArgValue::Files(fref) => fref.value.clone(),
            ArgValue::List(items) => {
                let parts: Vec<String> = items.iter().map(ArgValue::to_display_string).collect();
                format!("[{}]", parts.join(", "))
            }
        }
    }
}

/// Whether a file-valued argument denotes input or output files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileMode {
    Read,
    Write,
}

/// A resolved file-valued argument: the raw argument value plus per-path
/// metadata for every concrete file it denoted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileArgRef {
    /// The raw command-line value (a filename, or e.g. a prefix expanded to
    /// several filenames by the argument's resolver).
    pub value: String,
    pub mode: FileMode,
    pub files: Vec<FileMeta>,
}

/// Metadata captured for one concrete file of a file-valued argument.
///
/// For write-mode arguments this is captured only if the step succeeded;
/// failed steps may leave partial or garbage outputs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMeta {
    pub path: PathBuf,
    #[serde(default)]
    pub canonical_path: PathBuf,
    #[serde(default)]
    pub hash: ContentHash,
    #[serde(default)]
    pub size: u64,
    #[serde(default = "epoch")]
    pub mtime: DateTime<Utc>,
    #[serde(default = "epoch")]
    pub ctime: DateTime<Utc>,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub inode: u64,
    #[serde(default)]
    pub device: u64,
}

/// Timing and outcome of a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    #[serde(default = "epoch")]
    pub beg_time: DateTime<Utc>,
    #[serde(default = "epoch")]
    pub end_time: DateTime<Utc>,
    /// Wall-clock duration in seconds.
    #[serde(default)]
    pub duration: f64,
    /// Rendered failure text, or `None` for a successful step.
    #[serde(default)]
    pub exception: Option<String>,
    #[serde(default)]
    pub argv: Vec<String>,
}

impl Default for RunInfo {
    fn default() -> Self {
        RunInfo {
            beg_time: epoch(),
            end_time: epoch(),
            duration: 0.0,
            exception: None,
            argv: Vec::new(),
        }
    }
}

/// Snapshot of the environment a step ran in. Population is the execution
/// harness's concern; [`RunEnv::detect`] is a best-effort default.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunEnv {
    #[serde(default)]
    pub store_location: String,
    #[serde(default)]
    pub platform: String,
    #[serde(default)]
    pub cpus: u32,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub cwd: PathBuf,
}

impl RunEnv {
    /// Best-effort detection from the process environment. Never fails;
    /// unknown fields stay at their defaults.
    pub fn detect(store_location: &str) -> RunEnv {
        RunEnv {
            store_location: store_location.to_string(),
            platform: format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH),
            cpus: std::thread::available_parallelism()
                .map(|n| n.get() as u32)
                .unwrap_or(0),
            host: std::env::var("HOSTNAME")
                .or_else(|_| std::env::var("HOST"))
                .unwrap_or_default(),
            user: std::env::var("USER")
                .or_else(|_| std::env::var("USERNAME"))
                .unwrap_or_default(),
            cwd: std::env::current_dir().unwrap_or_default(),
        }
    }
}

/// Best-effort identity of the code that ran the step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionInfo {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub project_path: Option<PathBuf>,
    #[serde(default)]
    pub code_hash: String,
}

impl VersionInfo {
    pub fn unknown() -> Self {
        VersionInfo {
            version: "unknown".to_string(),
            project_path: None,
            code_hash: String::new(),
        }
    }
}

impl Default for VersionInfo {
    fn default() -> Self {
        VersionInfo::unknown()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_record() -> StepRecord {
        let mtime = Utc.timestamp_opt(1_700_000_100, 250_000_000).unwrap();
        let mut args = BTreeMap::new();
        args.insert("threads".to_string(), ArgValue::Int(8));
        args.insert("min_quality".to_string(), ArgValue::Float(0.75));
        args.insert(
            "in_reads".to_string(),
            ArgValue::Files(FileArgRef {
                value: "reads.bam".to_string(),
                mode: FileMode::Read,
                files: vec![FileMeta {
                    path: PathBuf::from("reads.bam"),
                    canonical_path: PathBuf::from("/data/reads.bam"),
                    hash: ContentHash("blake3_00ff".to_string()),
                    size: 4096,
                    mtime,
                    ctime: mtime,
                    owner: "1000".to_string(),
                    inode: 42,
                    device: 7,
                }],
            }),
        );

        let mut cmd_line = BTreeMap::new();
        cmd_line.insert("step_name".to_string(), "trim".to_string());
        cmd_line.insert("file.in_reads.lane".to_string(), "L001".to_string());

        StepRecord {
            step_id: StepId::from("run1__trim_mod__trim"),
            run_id: RunId("run1".to_string()),
            cmd_module: "trim_mod".to_string(),
            cmd_name: "trim".to_string(),
            args,
            run_env: RunEnv::detect("/tmp/store"),
            run_info: RunInfo {
                beg_time: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
                end_time: Utc.timestamp_opt(1_700_000_090, 0).unwrap(),
                duration: 90.0,
                exception: None,
                argv: vec!["trim".to_string(), "reads.bam".to_string()],
            },
            metadata_from_cmd_line: cmd_line,
            metadata_from_cmd_return: BTreeMap::new(),
            enclosing_steps: Vec::new(),
            version_info: VersionInfo::unknown(),
        }
    }

    #[test]
    fn test_round_trip() {
        let envelope = StepEnvelope::new(sample_record());
        let json = envelope.to_json().unwrap();
        let parsed = StepEnvelope::from_json(&json).unwrap();
        assert_eq!(parsed, envelope);
    }

    #[test]
    fn test_deterministic_serialization() {
        let envelope = StepEnvelope::new(sample_record());
        assert_eq!(envelope.to_json().unwrap(), envelope.to_json().unwrap());
    }

    #[test]
    fn test_missing_required_key_rejected() {
        let envelope = StepEnvelope::new(sample_record());
        let mut value: serde_json::Value = serde_json::from_str(&envelope.to_json().unwrap()).unwrap();
        value["step"].as_object_mut().unwrap().remove("step_id");
        assert!(StepEnvelope::from_json(&value.to_string()).is_err());
    }

    #[test]
    fn test_missing_optional_fields_default() {
        let json = r#"{
            "format": "1.0.0",
            "step": {
                "step_id": "s1",
                "cmd_module": "m",
                "args": {}
            }
        }"#;
        let envelope = StepEnvelope::from_json(json).unwrap();
        assert_eq!(envelope.step.cmd_name, "");
        assert!(envelope.step.run_info.exception.is_none());
        assert!(envelope.step.enclosing_steps.is_empty());
        assert_eq!(envelope.step.version_info.version, "unknown");
    }

    #[test]
    fn test_untagged_file_arg_parse() {
        let json = r#"{
            "value": "out.fasta",
            "mode": "write",
            "files": []
        }"#;
        let val: ArgValue = serde_json::from_str(json).unwrap();
        assert!(matches!(val, ArgValue::Files(_)));
    }

    #[test]
    fn test_file_refs_flatten_lists() {
        let record = sample_record();
        let refs = record.file_refs();
        assert_eq!(refs.len(), 1);
        assert_eq!(refs[0].0, "in_reads");
    }

    #[test]
    fn test_metadata_overrides() {
        let record = sample_record();
        let overrides = record.metadata_overrides_for("in_reads");
        assert_eq!(overrides.get("lane").map(String::as_str), Some("L001"));
        assert!(record.metadata_overrides_for("threads").is_empty());
    }

    #[test]
    fn test_step_name_falls_back_to_cmd_name() {
        let mut record = sample_record();
        assert_eq!(record.step_name(), "trim");
        record.metadata_from_cmd_line.remove("step_name");
        assert_eq!(record.step_name(), "trim");
        record.cmd_name = "trim_reads".to_string();
        assert_eq!(record.step_name(), "trim_reads");
    }
}
