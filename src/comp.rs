//! Extraction and comparison of sub-computations ("comps").
//!
//! A comp is a closed input-to-output slice of the provenance graph: one
//! main output file, the unique main input file in its ancestry, and every
//! node in between. Comps from different runs are grouped by the content
//! identity of their main inputs; within a group, the symmetric difference
//! of step parameters and metrics surfaces exactly what differed between
//! runs that started from identical data.
//!
//! Comps are derived fresh per analysis pass and never persisted.

use crate::graph::ProvenanceGraph;
use crate::types::ContentHash;
use petgraph::stable_graph::NodeIndex;
use std::collections::{BTreeSet, HashSet};

/// What to extract: files matching `output_pattern` whose ancestry contains
/// exactly one file matching `input_pattern`. Patterns are matched against
/// canonical paths; `*` matches any run of characters (including `/`), `?`
/// matches one character.
#[derive(Debug, Clone)]
pub struct CompSpec {
    pub output_pattern: String,
    pub input_pattern: String,
    /// If set, each comp also includes the most recently started step of
    /// this name that directly consumed the main output (metrics steps run
    /// after the output is produced and are not in its ancestry).
    pub metrics_step: Option<String>,
}

/// One extracted sub-computation.
#[derive(Debug, Clone)]
pub struct Comp {
    pub nodes: HashSet<NodeIndex>,
    pub main_inputs: Vec<NodeIndex>,
    pub main_outputs: Vec<NodeIndex>,
}

impl Comp {
    /// Ordered tuple of main-input content hashes; the grouping key.
    pub fn main_input_hashes(&self, g: &ProvenanceGraph) -> Vec<ContentHash> {
        self.main_inputs
            .iter()
            .filter_map(|&idx| g.node(idx).as_file().map(|f| f.sig.hash.clone()))
            .collect()
    }
}

/// Extract all comps matching `spec` from the graph.
pub fn extract_comps(g: &ProvenanceGraph, spec: &CompSpec) -> Vec<Comp> {
    let input_nodes: HashSet<NodeIndex> = g
        .file_indices()
        .into_iter()
        .filter(|&idx| sig_matches(g, idx, &spec.input_pattern))
        .collect();

    let mut comps = Vec::new();
    for end_idx in g.file_indices() {
        if !sig_matches(g, end_idx, &spec.output_pattern) {
            continue;
        }
        let mut nodes = g.ancestors(end_idx);
        nodes.insert(end_idx);

        let beg: Vec<NodeIndex> = input_nodes
            .iter()
            .copied()
            .filter(|idx| nodes.contains(idx))
            .collect();
        if beg.len() != 1 {
            continue;
        }

        if let Some(metrics_name) = &spec.metrics_step {
            let metrics = g
                .consumers(end_idx)
                .into_iter()
                .filter(|&s_idx| {
                    g.node(s_idx)
                        .as_step()
                        .map(|s| s.step_name() == metrics_name)
                        .unwrap_or(false)
                })
                .max_by_key(|&s_idx| g.node(s_idx).as_step().map(|s| s.beg_time()));
            if let Some(m_idx) = metrics {
                nodes.insert(m_idx);
            }
        }

        comps.push(Comp {
            nodes,
            main_inputs: beg,
            main_outputs: vec![end_idx],
        });
    }
    comps
}

/// Partition comps by the ordered tuple of their main-input content hashes.
pub fn group_by_main_input(g: &ProvenanceGraph, comps: Vec<Comp>) -> Vec<Vec<Comp>> {
    let mut keyed: Vec<(Vec<ContentHash>, Comp)> = comps
        .into_iter()
        .map(|c| (c.main_input_hashes(g), c))
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));

    let mut groups: Vec<Vec<Comp>> = Vec::new();
    let mut current_key: Option<Vec<ContentHash>> = None;
    for (key, comp) in keyed {
        if current_key.as_ref() == Some(&key) {
            if let Some(last) = groups.last_mut() {
                last.push(comp);
                continue;
            }
        }
        current_key = Some(key);
        groups.push(vec![comp]);
    }
    groups
}

/// Flatten the non-file arguments and returned metrics of every step in the
/// comp into `<step_name>.<arg> -> value` pairs, excluding deny-listed
/// argument names (temp dirs, log levels and similar non-semantic knobs).
pub fn comp_attributes(
    g: &ProvenanceGraph,
    comp: &Comp,
    deny: &[&str],
) -> BTreeSet<(String, String)> {
    let mut attrs = BTreeSet::new();
    for &idx in &comp.nodes {
        let Some(step) = g.node(idx).as_step() else { continue };
        let step_name = step.step_name();
        for (arg, value) in &step.record.args {
            if value.is_file_valued() || deny.contains(&arg.as_str()) {
                continue;
            }
            attrs.insert((
                format!("{}.{}", step_name, arg),
                value.to_display_string(),
            ));
        }
        for (key, value) in &step.record.metadata_from_cmd_return {
            attrs.insert((format!("{}.{}", step_name, key), value.clone()));
        }
    }
    attrs
}

/// Which attribute pairs differ between two comps of one group.
pub fn attrs_symdiff(
    a: &BTreeSet<(String, String)>,
    b: &BTreeSet<(String, String)>,
) -> BTreeSet<(String, String)> {
    a.symmetric_difference(b).cloned().collect()
}

fn sig_matches(g: &ProvenanceGraph, idx: NodeIndex, pattern: &str) -> bool {
    g.node(idx)
        .as_file()
        .map(|f| wildcard_match(pattern, &f.sig.canonical_path.to_string_lossy()))
        .unwrap_or(false)
}

/// Shell-style wildcard match: `*` matches any run of characters (slashes
/// included), `?` matches exactly one.
fn wildcard_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0usize, 0usize);
    let (mut star, mut star_ti) = (None::<usize>, 0usize);

    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some(pi);
            star_ti = ti;
            pi += 1;
        } else if let Some(s) = star {
            pi = s + 1;
            star_ti += 1;
            ti = star_ti;
        } else {
            return false;
        }
    }
    while pi < p.len() && p[pi] == '*' {
        pi += 1;
    }
    pi == p.len()
}
