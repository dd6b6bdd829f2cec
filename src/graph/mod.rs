//! The provenance graph: a bipartite DAG of step and file nodes.
//!
//! Built from scratch on every load by a single-threaded, read-only batch
//! pass over the record store — it may run concurrently with ongoing
//! recording and simply sees whatever records exist at listing time. Step
//! nodes carry the full step record; file nodes are identified by the
//! (canonical path, content hash, mtime) triple, so distinct states of the
//! same path over time are distinct nodes. Edges run from input files into
//! steps and from steps out to their output files.
//!
//! After loading, missing producer edges are repaired by a hash/path/time
//! heuristic (see [`repair`]), and the graph must be acyclic; a cycle after
//! repair signals a recording or repair defect and is fatal.

pub mod render;
mod repair;

use crate::error::GraphError;
use crate::hasher::ContentHasher;
use crate::record::file_arg::canonical_path;
use crate::record::{FileMeta, FileMode, StepEnvelope, StepRecord};
use crate::store::MetadataStore;
use crate::types::{FileSig, StepId};
use chrono::{DateTime, Duration, Utc};
use petgraph::algo::{is_cyclic_directed, toposort};
use petgraph::stable_graph::{NodeIndex, StableDiGraph};
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use petgraph::Direction::{Incoming, Outgoing};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use tracing::{info, warn};

/// A step node: one non-failed, non-nested step record.
#[derive(Debug, Clone)]
pub struct StepNode {
    pub record: StepRecord,
    /// Filename of the record in the store, for reporting.
    pub record_fname: String,
}

impl StepNode {
    pub fn step_name(&self) -> &str {
        self.record.step_name()
    }

    pub fn beg_time(&self) -> DateTime<Utc> {
        self.record.run_info.beg_time
    }
}

/// A file node: one observed state of one file.
#[derive(Debug, Clone)]
pub struct FileNode {
    pub sig: FileSig,
    /// Metadata from the first record that mentioned this state.
    pub meta: FileMeta,
}

/// Graph node: step and file identities are distinct types and never
/// compare across kinds.
#[derive(Debug, Clone)]
pub enum Node {
    Step(StepNode),
    File(FileNode),
}

impl Node {
    pub fn as_step(&self) -> Option<&StepNode> {
        match self {
            Node::Step(s) => Some(s),
            Node::File(_) => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileNode> {
        match self {
            Node::File(f) => Some(f),
            Node::Step(_) => None,
        }
    }
}

/// Edge label: the argument that carried the file, any per-argument metadata
/// overrides supplied at invocation time, and whether this edge was
/// heuristically reconstructed by the repair pass.
#[derive(Debug, Clone)]
pub struct EdgeLabel {
    pub arg: String,
    pub overrides: BTreeMap<String, String>,
    pub repaired: bool,
}

/// Options for [`ProvenanceGraph::load`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// Ignore records whose step began more than this long ago.
    pub max_age: Option<Duration>,
}

/// What loading saw and did; useful for diagnostics and tests.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub loaded_steps: usize,
    pub skipped_invalid: usize,
    pub skipped_failed: usize,
    pub skipped_nested: usize,
    pub skipped_stale: usize,
    /// File states claimed as output by more than one step.
    pub anomalies: Vec<FileSig>,
    pub repaired_edges: usize,
    /// Producer-less file states whose path still exists on disk.
    pub unknown_origin: Vec<std::path::PathBuf>,
}

/// The ancestry answer for one file, with the heuristic taint flag.
#[derive(Debug)]
pub struct ProvenanceChain<'a> {
    /// Producing steps, in topological (oldest-first) order.
    pub steps: Vec<&'a StepNode>,
    /// True if any link was heuristically reconstructed rather than
    /// directly recorded.
    pub heuristic: bool,
}

/// Bipartite provenance DAG over one record store snapshot.
pub struct ProvenanceGraph {
    pub(crate) graph: StableDiGraph<Node, EdgeLabel>,
    pub(crate) steps: HashMap<StepId, NodeIndex>,
    pub(crate) files: HashMap<FileSig, NodeIndex>,
    report: LoadReport,
}

impl ProvenanceGraph {
    /// Load all valid, non-failed, non-nested, non-stale records from the
    /// store, repair missing producer edges, and verify acyclicity.
    pub fn load(store: &MetadataStore, options: &LoadOptions) -> Result<Self, GraphError> {
        let mut g = ProvenanceGraph {
            graph: StableDiGraph::new(),
            steps: HashMap::new(),
            files: HashMap::new(),
            report: LoadReport::default(),
        };
        let now = Utc::now();

        for path in store.list_records()? {
            let fname = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            let json = match store.read_record(&path) {
                Ok(json) => json,
                Err(e) => {
                    warn!(record = %fname, error = %e, "Cannot read step record");
                    g.report.skipped_invalid += 1;
                    continue;
                }
            };
            let envelope = match StepEnvelope::from_json(&json) {
                Ok(envelope) => envelope,
                Err(e) => {
                    warn!(record = %fname, error = %e, "Not a valid step record");
                    g.report.skipped_invalid += 1;
                    continue;
                }
            };
            let step = envelope.step;
            if step.run_info.exception.is_some() {
                // Failed steps produce no trusted edges.
                g.report.skipped_failed += 1;
                continue;
            }
            if !step.enclosing_steps.is_empty() {
                // Only the outermost step's edges are trusted.
                g.report.skipped_nested += 1;
                continue;
            }
            if let Some(max_age) = options.max_age {
                if now - step.run_info.beg_time > max_age {
                    g.report.skipped_stale += 1;
                    continue;
                }
            }
            g.add_step(step, fname);
        }

        g.check_anomalies();
        g.report.repaired_edges = repair::repair_missing_producers(&mut g);

        if is_cyclic_directed(&g.graph) {
            return Err(GraphError::CycleDetected);
        }

        g.collect_unknown_origin();
        Ok(g)
    }

    fn add_step(&mut self, record: StepRecord, record_fname: String) {
        // Collect file entries before the record moves into the node.
        let mut entries: Vec<(String, FileMode, FileMeta, BTreeMap<String, String>)> = Vec::new();
        for (arg, fref) in record.file_refs() {
            let overrides = record.metadata_overrides_for(arg);
            for meta in &fref.files {
                // entries with no captured stat info identify nothing
                if meta.hash.is_empty() && meta.mtime == DateTime::UNIX_EPOCH {
                    continue;
                }
                entries.push((arg.to_string(), fref.mode, meta.clone(), overrides.clone()));
            }
        }

        let step_id = record.step_id.clone();
        let s_idx = self.graph.add_node(Node::Step(StepNode {
            record,
            record_fname,
        }));
        self.steps.insert(step_id, s_idx);
        self.report.loaded_steps += 1;

        for (arg, mode, meta, overrides) in entries {
            let sig = FileSig::new(meta.canonical_path.clone(), meta.hash.clone(), meta.mtime);
            let f_idx = *self.files.entry(sig.clone()).or_insert_with(|| {
                self.graph.add_node(Node::File(FileNode { sig, meta }))
            });
            let label = EdgeLabel {
                arg,
                overrides,
                repaired: false,
            };
            let (a, b) = match mode {
                FileMode::Read => (f_idx, s_idx),
                FileMode::Write => (s_idx, f_idx),
            };
            self.graph.update_edge(a, b, label);
        }
    }

    /// Warn for every file state claimed as output by more than one step.
    fn check_anomalies(&mut self) {
        for f_idx in self.file_indices() {
            let in_degree = self.in_degree(f_idx);
            if in_degree > 1 {
                if let Some(file) = self.graph[f_idx].as_file() {
                    warn!(file = %file.sig, in_degree, "ANOMALY: multiple producers for one file state");
                    self.report.anomalies.push(file.sig.clone());
                }
            }
        }
    }

    fn collect_unknown_origin(&mut self) {
        let mut unknown = Vec::new();
        for f_idx in self.file_indices() {
            if self.in_degree(f_idx) > 0 {
                continue;
            }
            if let Some(file) = self.graph[f_idx].as_file() {
                if file.sig.canonical_path.is_file() {
                    unknown.push(file.sig.canonical_path.clone());
                }
            }
        }
        if !unknown.is_empty() {
            warn!(count = unknown.len(), "Files of unknown origin");
        }
        self.report.unknown_origin = unknown;
    }

    pub fn report(&self) -> &LoadReport {
        &self.report
    }

    pub fn node(&self, idx: NodeIndex) -> &Node {
        &self.graph[idx]
    }

    pub fn step_index(&self, step_id: &StepId) -> Option<NodeIndex> {
        self.steps.get(step_id).copied()
    }

    pub fn file_index(&self, sig: &FileSig) -> Option<NodeIndex> {
        self.files.get(sig).copied()
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn step_indices(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&i| self.graph[i].as_step().is_some())
            .collect()
    }

    pub fn file_indices(&self) -> Vec<NodeIndex> {
        self.graph
            .node_indices()
            .filter(|&i| self.graph[i].as_file().is_some())
            .collect()
    }

    pub fn in_degree(&self, idx: NodeIndex) -> usize {
        self.graph.edges_directed(idx, Incoming).count()
    }

    /// The step that produced this file state, if one was recorded.
    pub fn producer(&self, f_idx: NodeIndex) -> Option<NodeIndex> {
        self.graph
            .edges_directed(f_idx, Incoming)
            .map(|e| e.source())
            .next()
    }

    /// Steps that consumed this file state.
    pub fn consumers(&self, f_idx: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .edges_directed(f_idx, Outgoing)
            .map(|e| e.target())
            .collect()
    }

    /// Predecessor closure of `start` (excluding `start` itself).
    pub fn ancestors(&self, start: NodeIndex) -> HashSet<NodeIndex> {
        let mut seen = HashSet::new();
        let mut frontier = vec![start];
        while let Some(idx) = frontier.pop() {
            for e in self.graph.edges_directed(idx, Incoming) {
                if seen.insert(e.source()) {
                    frontier.push(e.source());
                }
            }
        }
        seen
    }

    /// Whether any edge within this node set was heuristically repaired.
    pub fn any_repaired_within(&self, nodes: &HashSet<NodeIndex>) -> bool {
        self.graph.edge_references().any(|e| {
            e.weight().repaired && nodes.contains(&e.source()) && nodes.contains(&e.target())
        })
    }

    /// Answer "what produced this file" for a path on disk.
    ///
    /// The file's current state is resolved to its identity triple; if that
    /// state is absent from the graph or has no recorded producer, the same
    /// single-node repair heuristic used at load time is applied. A file
    /// that still has no resolvable producer has no answer — that is a
    /// data-integrity failure, not a recoverable condition.
    pub fn provenance(&self, path: &Path) -> Result<ProvenanceChain<'_>, GraphError> {
        let stat = std::fs::metadata(path)
            .map_err(|_| GraphError::FileNotFound(path.to_path_buf()))?;
        let mtime = stat
            .modified()
            .map(DateTime::<Utc>::from)
            .unwrap_or(DateTime::UNIX_EPOCH);
        let sig = FileSig::new(
            canonical_path(path),
            ContentHasher::new().hash_file(path),
            mtime,
        );

        let direct = self
            .file_index(&sig)
            .filter(|&idx| self.in_degree(idx) >= 1);
        let mut heuristic = false;
        let f_idx = match direct {
            Some(idx) => idx,
            None => {
                // The exact state was never recorded as an output; fall back
                // to the latest other state with the same content and path.
                heuristic = true;
                let substitute = repair::find_producer_substitute(self, &sig)
                    .filter(|&idx| self.in_degree(idx) == 1);
                match substitute {
                    Some(idx) => {
                        info!(file = %sig, "Provenance resolved through reconstructed file state");
                        idx
                    }
                    None => return Err(GraphError::NoProvenance(path.to_path_buf())),
                }
            }
        };

        let ancestor_set = self.ancestors(f_idx);
        heuristic = heuristic || self.any_repaired_within(&ancestor_set);

        let order = toposort(&self.graph, None).map_err(|_| GraphError::CycleDetected)?;
        let steps = order
            .into_iter()
            .filter(|idx| ancestor_set.contains(idx))
            .filter_map(|idx| self.graph[idx].as_step())
            .collect();
        Ok(ProvenanceChain { steps, heuristic })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ArgValue, FileArgRef, RunInfo};
    use crate::types::{ContentHash, RunId};
    use chrono::TimeZone;
    use std::path::PathBuf;

    pub(super) fn file_meta(path: &str, hash: &str, mtime_secs: i64) -> FileMeta {
        let mtime = Utc.timestamp_opt(mtime_secs, 0).unwrap();
        FileMeta {
            path: PathBuf::from(path),
            canonical_path: PathBuf::from(path),
            hash: ContentHash(hash.to_string()),
            size: 1,
            mtime,
            ctime: mtime,
            owner: String::new(),
            inode: 0,
            device: 0,
        }
    }

    pub(super) fn step_record(
        step_id: &str,
        beg_secs: i64,
        reads: &[(&str, FileMeta)],
        writes: &[(&str, FileMeta)],
    ) -> StepRecord {
        let mut args = BTreeMap::new();
        for (arg, meta) in reads {
            args.insert(
                arg.to_string(),
                ArgValue::Files(FileArgRef {
                    value: meta.path.to_string_lossy().to_string(),
                    mode: FileMode::Read,
                    files: vec![meta.clone()],
                }),
            );
        }
        for (arg, meta) in writes {
            args.insert(
                arg.to_string(),
                ArgValue::Files(FileArgRef {
                    value: meta.path.to_string_lossy().to_string(),
                    mode: FileMode::Write,
                    files: vec![meta.clone()],
                }),
            );
        }
        StepRecord {
            step_id: StepId::from(step_id),
            run_id: RunId("run".to_string()),
            cmd_module: "pipeline".to_string(),
            cmd_name: step_id.to_string(),
            args,
            run_env: Default::default(),
            run_info: RunInfo {
                beg_time: Utc.timestamp_opt(beg_secs, 0).unwrap(),
                end_time: Utc.timestamp_opt(beg_secs + 10, 0).unwrap(),
                duration: 10.0,
                exception: None,
                argv: Vec::new(),
            },
            metadata_from_cmd_line: BTreeMap::new(),
            metadata_from_cmd_return: BTreeMap::new(),
            enclosing_steps: Vec::new(),
            version_info: Default::default(),
        }
    }

    pub(super) fn graph_of(records: Vec<StepRecord>) -> ProvenanceGraph {
        let mut g = ProvenanceGraph {
            graph: StableDiGraph::new(),
            steps: HashMap::new(),
            files: HashMap::new(),
            report: LoadReport::default(),
        };
        for record in records {
            let fname = format!("{}.crc32_00000000.json", record.step_id);
            g.add_step(record, fname);
        }
        g.check_anomalies();
        g.report.repaired_edges = repair::repair_missing_producers(&mut g);
        assert!(!is_cyclic_directed(&g.graph));
        g
    }

    #[test]
    fn test_minimal_graph() {
        let out = file_meta("/data/out.txt", "blake3_aa", 100);
        let g = graph_of(vec![step_record("make", 90, &[], &[("out", out)])]);
        assert_eq!(g.node_count(), 2);
        assert_eq!(g.edge_count(), 1);
        let f_idx = g.file_indices()[0];
        assert!(g.producer(f_idx).is_some());
    }

    #[test]
    fn test_chain_ancestors() {
        let f1 = file_meta("/data/f1", "blake3_f1", 100);
        let f2 = file_meta("/data/f2", "blake3_f2", 200);
        let g = graph_of(vec![
            step_record("a", 90, &[], &[("out", f1.clone())]),
            step_record("b", 150, &[("in", f1.clone())], &[("out", f2.clone())]),
            step_record("c", 250, &[("in", f2.clone())], &[]),
        ]);

        let f2_sig = FileSig::new(f2.canonical_path.clone(), f2.hash.clone(), f2.mtime);
        let f2_idx = g.file_index(&f2_sig).unwrap();
        let ancs = g.ancestors(f2_idx);

        let a_idx = g.step_index(&StepId::from("a")).unwrap();
        let b_idx = g.step_index(&StepId::from("b")).unwrap();
        let f1_sig = FileSig::new(f1.canonical_path.clone(), f1.hash.clone(), f1.mtime);
        let f1_idx = g.file_index(&f1_sig).unwrap();

        let expected: HashSet<NodeIndex> = [a_idx, b_idx, f1_idx].into_iter().collect();
        assert_eq!(ancs, expected);

        let f1_ancs = g.ancestors(f1_idx);
        let expected_f1: HashSet<NodeIndex> = [a_idx].into_iter().collect();
        assert_eq!(f1_ancs, expected_f1);
    }

    #[test]
    fn test_in_degree_invariant_after_load() {
        let f1 = file_meta("/data/f1", "blake3_f1", 100);
        let g = graph_of(vec![
            step_record("a", 90, &[], &[("out", f1.clone())]),
            step_record("b", 150, &[("in", f1.clone())], &[]),
        ]);
        for f_idx in g.file_indices() {
            assert!(g.in_degree(f_idx) <= 1);
        }
    }

    #[test]
    fn test_anomaly_detection() {
        let f1 = file_meta("/data/f1", "blake3_f1", 100);
        let g = graph_of(vec![
            step_record("a", 90, &[], &[("out", f1.clone())]),
            step_record("b", 95, &[], &[("out", f1.clone())]),
        ]);
        assert_eq!(g.report().anomalies.len(), 1);
    }

    #[test]
    fn test_repair_reconnects_consumer() {
        // An earlier run produced the same content at the same path (mtime
        // 100). The producer record for the state at mtime 200 is missing.
        let old_state = file_meta("/data/f1", "blake3_same", 100);
        let new_state = file_meta("/data/f1", "blake3_same", 200);
        let g = graph_of(vec![
            step_record("old_maker", 90, &[], &[("out", old_state.clone())]),
            step_record("reader", 250, &[("in", new_state.clone())], &[]),
        ]);

        assert_eq!(g.report().repaired_edges, 1);
        let reader_idx = g.step_index(&StepId::from("reader")).unwrap();
        let ancs = g.ancestors(reader_idx);
        let maker_idx = g.step_index(&StepId::from("old_maker")).unwrap();
        assert!(ancs.contains(&maker_idx));

        // the orphaned state no longer feeds the reader
        let new_sig = FileSig::new(new_state.canonical_path, new_state.hash, new_state.mtime);
        let new_idx = g.file_index(&new_sig).unwrap();
        assert!(g.consumers(new_idx).is_empty());
    }

    #[test]
    fn test_repair_respects_consumer_start_time() {
        // Candidate exists but was written after the consumer started; the
        // edge must stay on the orphan.
        let old_state = file_meta("/data/f1", "blake3_same", 300);
        let new_state = file_meta("/data/f1", "blake3_same", 400);
        let g = graph_of(vec![
            step_record("late_maker", 290, &[], &[("out", old_state.clone())]),
            step_record("reader", 250, &[("in", new_state.clone())], &[]),
        ]);
        assert_eq!(g.report().repaired_edges, 0);
    }
}
