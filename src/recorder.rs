//! The step recorder: wraps one command execution and writes one immutable,
//! content-identified step record.
//!
//! A [`WorkflowContext`] carries the run id, the tracking configuration, and
//! the stack of steps currently running (used to mark nested invocations).
//! It is an explicit object threaded through the instrumentation call chain,
//! so parallel step execution within one process stays correct.
//!
//! Recording is best-effort on every path: the wrapped command's own outcome
//! is returned unchanged, recording failures are logged warnings, and an
//! explicit user interruption skips recording entirely.

use crate::cache::ArtifactCache;
use crate::config::{self, TrackingConfig};
use crate::error::{RecordError, StoreError};
use crate::hasher::ContentHasher;
use crate::record::{
    ArgValue, CmdArg, RunEnv, RunInfo, StepEnvelope, StepRecord,
};
use crate::reuse::ReuseIndex;
use crate::store::MetadataStore;
use crate::types::{RunId, StepId};
use crate::version::{NullVersionTagger, VersionTagger};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Run/step tokens are kept short enough for any filesystem.
const MAX_TOKEN_LEN: usize = 210;

/// Outcome of a wrapped command, as seen by the recorder.
///
/// `Interrupted` models an explicit user interruption: no record is written
/// for interrupted runs. Any other failure is recorded with its rendered
/// text and then returned to the caller unchanged.
#[derive(Debug, Error)]
pub enum StepFailure {
    #[error("step interrupted by user")]
    Interrupted,

    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Recording lifecycle of one step. Only the `Running` outcome is ever
/// surfaced to the caller; recording outcomes are logged only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepState {
    Created,
    Running,
    Succeeded,
    Failed,
    Recording,
    Recorded,
    RecordingFailed,
}

/// Invocation-scoped context supplied by the execution harness.
#[derive(Debug, Clone, Default)]
pub struct Invocation {
    /// The process argv, recorded verbatim.
    pub argv: Vec<String>,
    /// Step metadata supplied on the command line (`--metadata KEY VALUE`
    /// style). Merged over ambient `PEDIGREE_META_*` environment entries.
    pub metadata: BTreeMap<String, String>,
}

/// Handle passed to the wrapped command; collects metrics the command wants
/// attached to its step record (`metadata_from_cmd_return`).
#[derive(Debug, Default)]
pub struct StepHandle {
    metrics: BTreeMap<String, String>,
}

impl StepHandle {
    pub fn add_metric(&mut self, name: impl Into<String>, value: impl ToString) {
        self.metrics.insert(name.into(), value.to_string());
    }
}

/// Pops the running-steps stack on every exit path.
struct RunningGuard<'a> {
    stack: &'a Mutex<Vec<StepId>>,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.stack.lock().pop();
    }
}

/// Workflow-scoped state shared by all steps of one run.
pub struct WorkflowContext {
    config: TrackingConfig,
    run_id: RunId,
    running: Mutex<Vec<StepId>>,
    tagger: Arc<dyn VersionTagger>,
}

impl WorkflowContext {
    /// Create a context for one workflow execution. The run id is inherited
    /// from `PEDIGREE_RUN_ID` (so steps of one multi-process workflow group
    /// together) or minted fresh.
    pub fn new(config: TrackingConfig) -> Self {
        let run_id = std::env::var(config::RUN_ID_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .map(RunId)
            .unwrap_or_else(|| RunId(run_token(Utc::now())));
        WorkflowContext {
            config,
            run_id,
            running: Mutex::new(Vec::new()),
            tagger: Arc::new(NullVersionTagger),
        }
    }

    /// Context configured entirely from the process environment.
    pub fn from_env() -> Self {
        WorkflowContext::new(TrackingConfig::from_env())
    }

    /// Install a code-version tagger collaborator.
    pub fn with_version_tagger(mut self, tagger: Arc<dyn VersionTagger>) -> Self {
        self.tagger = tagger;
        self
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn config(&self) -> &TrackingConfig {
        &self.config
    }

    /// Execute one command as a recorded step.
    ///
    /// The command reads its file paths out of `args` and reports metrics
    /// through the [`StepHandle`]. Its result is returned unchanged; any
    /// recording error is logged and swallowed.
    pub fn run_step<T, F>(
        &self,
        cmd_module: &str,
        cmd_name: &str,
        args: BTreeMap<String, CmdArg>,
        invocation: Invocation,
        f: F,
    ) -> Result<T, StepFailure>
    where
        F: FnOnce(&BTreeMap<String, CmdArg>, &mut StepHandle) -> Result<T, StepFailure>,
    {
        let beg_time = Utc::now();
        let step_id = StepId(format!(
            "{}__{}__{}",
            run_token(beg_time),
            sanitize_token(cmd_module),
            sanitize_token(cmd_name)
        ));
        trace_state(&step_id, StepState::Created);

        let enclosing_steps = {
            let mut stack = self.running.lock();
            let enclosing = stack.clone();
            stack.push(step_id.clone());
            enclosing
        };
        let _guard = RunningGuard { stack: &self.running };

        // Advisory only: a reuse hit is logged, never short-circuits the run.
        if self.config.is_enabled() && self.config.cache_dir.is_some() {
            if let Err(e) = self.check_reuse(cmd_module, cmd_name, &args) {
                warn!(step_id = %step_id, error = %e, "Reuse check failed");
            }
        }

        trace_state(&step_id, StepState::Running);
        let mut handle = StepHandle::default();
        let result = f(&args, &mut handle);
        let end_time = Utc::now();

        let exception = match &result {
            Ok(_) => {
                trace_state(&step_id, StepState::Succeeded);
                None
            }
            Err(StepFailure::Interrupted) => {
                debug!(step_id = %step_id, "Step interrupted; skipping metadata recording");
                return result;
            }
            Err(StepFailure::Failed(e)) => {
                trace_state(&step_id, StepState::Failed);
                Some(format!("{:#}", e))
            }
        };

        if self.config.is_enabled() {
            trace_state(&step_id, StepState::Recording);
            match self.record_step(
                &step_id,
                cmd_module,
                cmd_name,
                &args,
                &invocation,
                handle.metrics,
                enclosing_steps,
                beg_time,
                end_time,
                exception,
            ) {
                Ok(fname) => {
                    trace_state(&step_id, StepState::Recorded);
                    info!(step_id = %step_id, record = %fname, "Step metadata recorded");
                }
                Err(e) => {
                    trace_state(&step_id, StepState::RecordingFailed);
                    warn!(step_id = %step_id, error = %e, "Error recording step metadata");
                }
            }
        }

        result
    }

    fn check_reuse(
        &self,
        cmd_module: &str,
        cmd_name: &str,
        args: &BTreeMap<String, CmdArg>,
    ) -> Result<(), StoreError> {
        let Some(location) = self.config.store_location.as_deref() else {
            return Ok(());
        };
        let store = MetadataStore::open(location)?;
        ReuseIndex::new(&store).check(cmd_module, cmd_name, args);
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn record_step(
        &self,
        step_id: &StepId,
        cmd_module: &str,
        cmd_name: &str,
        args: &BTreeMap<String, CmdArg>,
        invocation: &Invocation,
        metrics: BTreeMap<String, String>,
        enclosing_steps: Vec<StepId>,
        beg_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        exception: Option<String>,
    ) -> Result<String, RecordError> {
        let location = self
            .config
            .store_location
            .as_deref()
            .ok_or(RecordError::StoreNotConfigured)?;
        let store = MetadataStore::open(location)?;
        let succeeded = exception.is_none();

        let hasher = if self.config.hash_inputs {
            ContentHasher::new()
        } else {
            ContentHasher::disabled()
        };

        let mut resolved_args = BTreeMap::new();
        for (name, arg) in args {
            let value = match arg {
                CmdArg::Plain(v) => ArgValue::from_plain(v.clone()),
                CmdArg::File(file_arg) => {
                    let fref = file_arg.resolve(&hasher, succeeded);
                    ArgValue::Files(fref)
                }
            };
            resolved_args.insert(name.clone(), value);
        }

        if succeeded {
            self.cache_outputs(&resolved_args);
        }

        let mut metadata_from_cmd_line = config::metadata_from_env();
        metadata_from_cmd_line.extend(invocation.metadata.clone());

        let run_env = if self.config.capture_env {
            RunEnv::detect(location)
        } else {
            RunEnv {
                store_location: location.to_string(),
                ..RunEnv::default()
            }
        };

        let record = StepRecord {
            step_id: step_id.clone(),
            run_id: self.run_id.clone(),
            cmd_module: cmd_module.to_string(),
            cmd_name: cmd_name.to_string(),
            args: resolved_args,
            run_env,
            run_info: RunInfo {
                beg_time,
                end_time,
                duration: (end_time - beg_time).num_milliseconds() as f64 / 1000.0,
                exception,
                argv: invocation.argv.clone(),
            },
            metadata_from_cmd_line,
            metadata_from_cmd_return: metrics,
            enclosing_steps,
            version_info: self.tagger.tag(step_id),
        };

        let json = StepEnvelope::new(record).to_json()?;
        let filename = MetadataStore::record_filename(step_id, &json);
        store.write_record(&filename, &json)?;
        Ok(filename)
    }

    /// Save every successfully hashed output file into the artifact cache.
    fn cache_outputs(&self, args: &BTreeMap<String, ArgValue>) {
        let Some(cache_dir) = &self.config.cache_dir else { return };
        let cache = match ArtifactCache::open(cache_dir) {
            Ok(cache) => cache,
            Err(e) => {
                warn!(error = %e, "Cannot open artifact cache");
                return;
            }
        };
        for value in args.values() {
            for fref in value.file_refs() {
                if fref.mode != crate::record::FileMode::Write {
                    continue;
                }
                for meta in &fref.files {
                    if meta.hash.is_empty() {
                        continue;
                    }
                    if let Err(e) = cache.save_file(&meta.hash, &meta.path) {
                        warn!(path = %meta.path.display(), error = %e, "Cannot cache output file");
                    }
                }
            }
        }
    }
}

/// Wrap a command implementation with provenance recording.
///
/// The returned closure has the same observable behavior as calling the
/// command directly; recording happens around it.
pub fn instrument<T, F>(
    ctx: &Arc<WorkflowContext>,
    cmd_module: impl Into<String>,
    cmd_name: impl Into<String>,
    command: F,
) -> impl Fn(BTreeMap<String, CmdArg>, Invocation) -> Result<T, StepFailure>
where
    F: Fn(&BTreeMap<String, CmdArg>, &mut StepHandle) -> Result<T, StepFailure>,
{
    let ctx = Arc::clone(ctx);
    let cmd_module = cmd_module.into();
    let cmd_name = cmd_name.into();
    move |args, invocation| {
        ctx.run_step(&cmd_module, &cmd_name, args, invocation, |args, handle| {
            command(args, handle)
        })
    }
}

fn trace_state(step_id: &StepId, state: StepState) {
    debug!(step_id = %step_id, state = ?state, "Step state");
}

/// Mint a unique, filename-safe token for a run or step started at `t`:
/// timestamp, user, working-directory basename, and a random suffix.
fn run_token(t: DateTime<Utc>) -> String {
    let user = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "nobody".to_string());
    let cwd_base = std::env::current_dir()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().to_string()))
        .unwrap_or_default();
    let raw = format!(
        "{}__{}__{}__{}",
        t.format("%y%m%d%H%M%S"),
        user,
        cwd_base,
        Uuid::new_v4()
    );
    let mut token = sanitize_token(&raw);
    token.truncate(MAX_TOKEN_LEN);
    token
}

/// Keep only characters that are safe in a filename on any filesystem.
fn sanitize_token(s: &str) -> String {
    s.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_token_is_filename_safe() {
        let token = run_token(Utc::now());
        assert!(!token.is_empty());
        assert!(token.len() <= MAX_TOKEN_LEN);
        assert!(token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')));
    }

    #[test]
    fn test_run_tokens_are_unique() {
        let t = Utc::now();
        assert_ne!(run_token(t), run_token(t));
    }

    #[test]
    fn test_sanitize_token() {
        assert_eq!(sanitize_token("a b/c:d"), "a-b-c-d");
        assert_eq!(sanitize_token("ok_1.2-3"), "ok_1.2-3");
    }

    #[test]
    fn test_untracked_context_runs_commands() {
        let ctx = WorkflowContext::new(TrackingConfig::default());
        let out = ctx
            .run_step(
                "mod",
                "cmd",
                BTreeMap::new(),
                Invocation::default(),
                |_args, _handle| Ok::<_, StepFailure>(21 * 2),
            )
            .unwrap();
        assert_eq!(out, 42);
    }

    #[test]
    fn test_command_failure_passes_through() {
        let ctx = WorkflowContext::new(TrackingConfig::default());
        let result: Result<(), _> = ctx.run_step(
            "mod",
            "cmd",
            BTreeMap::new(),
            Invocation::default(),
            |_args, _handle| Err(StepFailure::Failed(anyhow::anyhow!("boom"))),
        );
        match result {
            Err(StepFailure::Failed(e)) => assert_eq!(e.to_string(), "boom"),
            other => panic!("unexpected outcome: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_nesting_stack_pops_on_exit() {
        let ctx = WorkflowContext::new(TrackingConfig::default());
        ctx.run_step(
            "mod",
            "outer",
            BTreeMap::new(),
            Invocation::default(),
            |_args, _handle| {
                let nested_enclosing = ctx.run_step(
                    "mod",
                    "inner",
                    BTreeMap::new(),
                    Invocation::default(),
                    |_a, _h| Ok::<_, StepFailure>(ctx.running.lock().len()),
                )?;
                // inner saw both itself and the outer step on the stack
                assert_eq!(nested_enclosing, 2);
                Ok::<_, StepFailure>(())
            },
        )
        .unwrap();
        assert!(ctx.running.lock().is_empty());
    }
}
