//! Repair of missing producer edges.
//!
//! Records are written independently by many processes, so the store can
//! have gaps: a step consumed a file state whose producing step was never
//! recorded (lost record, produced outside the pipeline, recorded before
//! tracking was enabled). When another node exists with the same content
//! hash and the same underlying path but an earlier mtime, the consumer is
//! rewired to that node. This is a heuristic, not proof of causality —
//! every rewired edge is marked `repaired`.

use super::{EdgeLabel, ProvenanceGraph};
use crate::types::{ContentHash, FileSig};
use petgraph::stable_graph::NodeIndex;
use petgraph::visit::EdgeRef;
use petgraph::Direction::Outgoing;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tracing::{debug, info};

/// Rewire consumers of producer-less file states to the best earlier
/// same-content, same-path candidate. Returns the number of rewired edges.
pub(super) fn repair_missing_producers(g: &mut ProvenanceGraph) -> usize {
    let (hash_index, path_index) = identity_indices(g);
    let orphans: Vec<NodeIndex> = g
        .file_indices()
        .into_iter()
        .filter(|&idx| g.in_degree(idx) == 0 && !g.consumers(idx).is_empty())
        .collect();

    let mut repaired = 0;
    for f_idx in orphans {
        let Some(sig) = g.graph[f_idx].as_file().map(|f| f.sig.clone()) else {
            continue;
        };
        debug!(file = %sig, "Trying to reconstruct missing producer");

        let mut candidates = shared_identity_candidates(g, &hash_index, &path_index, &sig, f_idx);
        // A candidate must represent a strictly earlier state of the file.
        candidates.retain(|&(_, mtime)| mtime < sig.mtime);
        if candidates.is_empty() {
            continue;
        }
        candidates.sort_by_key(|&(_, mtime)| mtime);

        // Rewire each consumer to the latest candidate preceding its start.
        let consumer_edges: Vec<(petgraph::stable_graph::EdgeIndex, NodeIndex)> = g
            .graph
            .edges_directed(f_idx, Outgoing)
            .map(|e| (e.id(), e.target()))
            .collect();
        for (edge_idx, s_idx) in consumer_edges {
            let Some(step) = g.graph[s_idx].as_step() else { continue };
            let beg_time = step.beg_time();
            let best = candidates
                .iter()
                .filter(|&&(_, mtime)| mtime < beg_time)
                .last()
                .map(|&(idx, _)| idx);
            let Some(candidate_idx) = best else { continue };

            let Some(old_label) = g.graph.edge_weight(edge_idx).cloned() else { continue };
            let label = EdgeLabel {
                repaired: true,
                ..old_label
            };
            g.graph.remove_edge(edge_idx);
            g.graph.update_edge(candidate_idx, s_idx, label);
            repaired += 1;

            if let (Some(candidate), Some(step)) =
                (g.graph[candidate_idx].as_file(), g.graph[s_idx].as_step())
            {
                info!(
                    file = %candidate.sig,
                    step = %step.record.step_id,
                    "Reconnected consumer to earlier file state"
                );
            }
        }
    }
    repaired
}

/// Single-node variant used by the point query: the latest other node with
/// the same content and the same underlying path, regardless of mtime order.
pub(super) fn find_producer_substitute(
    g: &ProvenanceGraph,
    sig: &FileSig,
) -> Option<NodeIndex> {
    let (hash_index, path_index) = identity_indices(g);
    let mut candidates =
        shared_identity_candidates_by_sig(&hash_index, &path_index, sig, g);
    candidates.sort_by_key(|&(_, mtime)| mtime);
    candidates.last().map(|&(idx, _)| idx)
}

type HashIndex = HashMap<ContentHash, HashSet<NodeIndex>>;
type PathIndex = HashMap<PathBuf, HashSet<NodeIndex>>;

/// Index all file nodes by content hash and by canonical path. Path
/// equivalence is extended transitively to paths that the OS reports as the
/// same underlying file (hardlinks, bind mounts), checked only within
/// same-hash buckets to bound the number of stat calls.
fn identity_indices(g: &ProvenanceGraph) -> (HashIndex, PathIndex) {
    let mut hash_index: HashIndex = HashMap::new();
    let mut path_index: PathIndex = HashMap::new();

    for idx in g.file_indices() {
        if let Some(file) = g.graph[idx].as_file() {
            hash_index
                .entry(file.sig.hash.clone())
                .or_default()
                .insert(idx);
            path_index
                .entry(file.sig.canonical_path.clone())
                .or_default()
                .insert(idx);
        }
    }

    for nodes in hash_index.values() {
        if nodes.len() < 2 {
            continue;
        }
        let nodes: Vec<NodeIndex> = nodes.iter().copied().collect();
        for (i, &a) in nodes.iter().enumerate() {
            for &b in &nodes[i + 1..] {
                let (Some(fa), Some(fb)) = (g.graph[a].as_file(), g.graph[b].as_file()) else {
                    continue;
                };
                let (pa, pb) = (&fa.sig.canonical_path, &fb.sig.canonical_path);
                if pa == pb || !pa.is_file() || !pb.is_file() {
                    continue;
                }
                if same_file::is_same_file(pa, pb).unwrap_or(false) {
                    path_index.entry(pa.clone()).or_default().insert(b);
                    path_index.entry(pb.clone()).or_default().insert(a);
                }
            }
        }
    }

    (hash_index, path_index)
}

/// Nodes sharing both content hash and path equivalence with `sig`,
/// excluding `exclude`, paired with their mtime.
fn shared_identity_candidates(
    g: &ProvenanceGraph,
    hash_index: &HashIndex,
    path_index: &PathIndex,
    sig: &FileSig,
    exclude: NodeIndex,
) -> Vec<(NodeIndex, chrono::DateTime<chrono::Utc>)> {
    let empty = HashSet::new();
    let by_hash = hash_index.get(&sig.hash).unwrap_or(&empty);
    let by_path = path_index.get(&sig.canonical_path).unwrap_or(&empty);
    by_hash
        .intersection(by_path)
        .copied()
        .filter(|&idx| idx != exclude)
        .filter_map(|idx| g.graph[idx].as_file().map(|f| (idx, f.sig.mtime)))
        .collect()
}

fn shared_identity_candidates_by_sig(
    hash_index: &HashIndex,
    path_index: &PathIndex,
    sig: &FileSig,
    g: &ProvenanceGraph,
) -> Vec<(NodeIndex, chrono::DateTime<chrono::Utc>)> {
    let empty = HashSet::new();
    let by_hash = hash_index.get(&sig.hash).unwrap_or(&empty);
    let by_path = path_index.get(&sig.canonical_path).unwrap_or(&empty);
    by_hash
        .intersection(by_path)
        .copied()
        .filter_map(|idx| {
            g.graph[idx]
                .as_file()
                .filter(|f| f.sig != *sig)
                .map(|f| (idx, f.sig.mtime))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::super::tests::{file_meta, graph_of, step_record};
    use super::*;
    use crate::types::FileSig;

    #[test]
    fn test_substitute_prefers_latest_state() {
        let s1 = file_meta("/data/f", "blake3_x", 100);
        let s2 = file_meta("/data/f", "blake3_x", 200);
        let g = graph_of(vec![
            step_record("m1", 90, &[], &[("out", s1.clone())]),
            step_record("m2", 190, &[], &[("out", s2.clone())]),
        ]);

        // a state of the same file never recorded as an output
        let probe = FileSig::new("/data/f", s1.hash.clone(), chrono::DateTime::UNIX_EPOCH);
        let found = find_producer_substitute(&g, &probe).unwrap();
        let expected_sig = FileSig::new(s2.canonical_path, s2.hash, s2.mtime);
        assert_eq!(found, g.file_index(&expected_sig).unwrap());
    }

    #[test]
    fn test_no_candidates_without_shared_path() {
        let s1 = file_meta("/data/a", "blake3_x", 100);
        let g = graph_of(vec![step_record("m1", 90, &[], &[("out", s1)])]);
        let probe = FileSig::new("/data/b", ContentHash("blake3_x".to_string()), chrono::DateTime::UNIX_EPOCH);
        assert!(find_producer_substitute(&g, &probe).is_none());
    }
}
