//! Advisory detection of equivalent prior step invocations.
//!
//! A step's arguments are normalized by replacing each input file argument
//! with the content hashes of its resolved files and each output file
//! argument with a pending-output sentinel (its future identity is unknown).
//! The store is then scanned for a prior record of the same command whose
//! normalized arguments are structurally equal.
//!
//! This is diagnostic only: a match is logged, never substituted for actual
//! execution.

use crate::hasher::ContentHasher;
use crate::record::{ArgValue, CmdArg, FileMode, StepEnvelope};
use crate::store::MetadataStore;
use crate::types::ContentHash;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// A normalized argument value: content identity for inputs, a sentinel for
/// outputs, the literal value otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum NormalArg {
    Plain(serde_json::Value),
    Inputs(Vec<ContentHash>),
    PendingOutput,
    List(Vec<NormalArg>),
}

impl NormalArg {
    fn render(&self) -> String {
        match self {
            NormalArg::Plain(v) => v.to_string(),
            NormalArg::Inputs(hashes) => {
                let parts: Vec<&str> = hashes.iter().map(ContentHash::as_str).collect();
                format!("[{}]", parts.join(","))
            }
            NormalArg::PendingOutput => "_pending_output_".to_string(),
            NormalArg::List(items) => {
                let parts: Vec<String> = items.iter().map(NormalArg::render).collect();
                format!("[{}]", parts.join(","))
            }
        }
    }
}

/// One prior record examined for reuse.
#[derive(Debug, Clone)]
pub struct ReuseCandidate {
    /// Record filename in the store.
    pub record: String,
    pub matched: bool,
    /// Symmetric difference of differing normalized entries, rendered
    /// `name=value`. Empty for a match.
    pub differing: BTreeSet<String>,
}

/// Outcome of a reuse scan.
#[derive(Debug, Clone, Default)]
pub struct ReuseReport {
    pub candidates: Vec<ReuseCandidate>,
}

impl ReuseReport {
    /// The first equivalent prior invocation, if any.
    pub fn matched(&self) -> Option<&ReuseCandidate> {
        self.candidates.iter().find(|c| c.matched)
    }
}

/// Scans existing records for an identical prior invocation.
pub struct ReuseIndex<'a> {
    store: &'a MetadataStore,
    hasher: ContentHasher,
}

impl<'a> ReuseIndex<'a> {
    pub fn new(store: &'a MetadataStore) -> Self {
        ReuseIndex {
            store,
            hasher: ContentHasher::new(),
        }
    }

    /// Compare the invocation against all prior records of the same command.
    ///
    /// Match or mismatch is logged; the report is returned for callers that
    /// want to inspect it. Control flow is never altered.
    pub fn check(
        &self,
        cmd_module: &str,
        cmd_name: &str,
        args: &BTreeMap<String, CmdArg>,
    ) -> ReuseReport {
        let current = self.normalize_invocation(args);
        let mut report = ReuseReport::default();

        let records = match self.store.list_records() {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Reuse scan could not list records");
                return report;
            }
        };

        for path in records {
            let fname = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) if name.contains(cmd_name) => name.to_string(),
                _ => continue,
            };
            let Ok(json) = self.store.read_record(&path) else { continue };
            let Ok(envelope) = StepEnvelope::from_json(&json) else { continue };
            let step = &envelope.step;
            if step.run_info.exception.is_some() || !step.enclosing_steps.is_empty() {
                continue;
            }
            if step.cmd_module != cmd_module || step.cmd_name != cmd_name {
                continue;
            }

            let prior: BTreeMap<String, NormalArg> = step
                .args
                .iter()
                .map(|(k, v)| (k.clone(), normalize_recorded(v)))
                .collect();

            if prior == current {
                info!(record = %fname, "Equivalent prior invocation found");
                report.candidates.push(ReuseCandidate {
                    record: fname,
                    matched: true,
                    differing: BTreeSet::new(),
                });
            } else {
                let differing = symmetric_diff(&prior, &current);
                debug!(record = %fname, differing = ?differing, "Prior invocation differs");
                report.candidates.push(ReuseCandidate {
                    record: fname,
                    matched: false,
                    differing,
                });
            }
        }

        if report.matched().is_none() {
            debug!(
                cmd_module,
                cmd_name,
                examined = report.candidates.len(),
                "No equivalent prior invocation"
            );
        }
        report
    }

    fn normalize_invocation(&self, args: &BTreeMap<String, CmdArg>) -> BTreeMap<String, NormalArg> {
        args.iter()
            .map(|(name, arg)| {
                let normal = match arg {
                    CmdArg::Plain(v) => NormalArg::Plain(v.clone()),
                    CmdArg::File(file_arg) => match file_arg.mode {
                        FileMode::Write => NormalArg::PendingOutput,
                        FileMode::Read => NormalArg::Inputs(
                            file_arg
                                .paths()
                                .iter()
                                .map(|p| self.hasher.hash_file(p))
                                .collect(),
                        ),
                    },
                };
                (name.clone(), normal)
            })
            .collect()
    }
}

fn normalize_recorded(val: &ArgValue) -> NormalArg {
    match val {
        ArgValue::Files(fref) => match fref.mode {
            FileMode::Write => NormalArg::PendingOutput,
            FileMode::Read => {
                NormalArg::Inputs(fref.files.iter().map(|f| f.hash.clone()).collect())
            }
        },
        ArgValue::List(items) => {
            if val.is_file_valued() {
                NormalArg::List(items.iter().map(normalize_recorded).collect())
            } else {
                NormalArg::Plain(serde_json::to_value(val).unwrap_or(serde_json::Value::Null))
            }
        }
        other => NormalArg::Plain(serde_json::to_value(other).unwrap_or(serde_json::Value::Null)),
    }
}

fn symmetric_diff(
    a: &BTreeMap<String, NormalArg>,
    b: &BTreeMap<String, NormalArg>,
) -> BTreeSet<String> {
    let render = |m: &BTreeMap<String, NormalArg>| -> BTreeSet<String> {
        m.iter().map(|(k, v)| format!("{}={}", k, v.render())).collect()
    };
    render(a).symmetric_difference(&render(b)).cloned().collect()
}
