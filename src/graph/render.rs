//! GraphViz dot emission.
//!
//! Emits a node/edge description of the loaded graph (or a subset of it)
//! for an external renderer to turn into an image. Step nodes are drawn as
//! `invhouse`, file nodes as `oval`; repaired edges are dashed.

use super::{Node, ProvenanceGraph};
use petgraph::stable_graph::NodeIndex;
use petgraph::visit::{EdgeRef, IntoEdgeReferences};
use std::collections::{HashMap, HashSet};
use std::io::{self, Write};

/// Options for [`write_dot`].
#[derive(Debug, Clone, Default)]
pub struct DotOptions {
    /// Restrict output to these nodes; `None` means the whole graph.
    pub nodes: Option<HashSet<NodeIndex>>,
    /// Step names to leave out of the drawing.
    pub ignore_cmds: Vec<String>,
    /// File extensions (with leading dot) to leave out of the drawing.
    pub ignore_exts: Vec<String>,
    pub title: String,
}

/// Write the graph as GraphViz dot text.
pub fn write_dot<W: Write>(
    g: &ProvenanceGraph,
    out: &mut W,
    options: &DotOptions,
) -> io::Result<()> {
    writeln!(out, "digraph G {{")?;

    let mut names: HashMap<NodeIndex, usize> = HashMap::new();
    let mut ignored: HashSet<NodeIndex> = HashSet::new();
    let included = |idx: NodeIndex| options.nodes.as_ref().map(|s| s.contains(&idx)).unwrap_or(true);

    for idx in g.graph.node_indices() {
        if !included(idx) {
            continue;
        }
        let (label, shape) = match &g.graph[idx] {
            Node::Step(step) => {
                let name = step.step_name().to_string();
                if options.ignore_cmds.iter().any(|c| c == &name) {
                    ignored.insert(idx);
                    continue;
                }
                (name, "invhouse")
            }
            Node::File(file) => {
                let name = file
                    .sig
                    .canonical_path
                    .file_name()
                    .map(|n| n.to_string_lossy().to_string())
                    .unwrap_or_else(|| "noname".to_string());
                if options.ignore_exts.iter().any(|e| name.ends_with(e.as_str())) {
                    ignored.insert(idx);
                    continue;
                }
                (name, "oval")
            }
        };
        let next = names.len();
        let id = *names.entry(idx).or_insert(next);
        writeln!(out, "n{} [label=\"{}\", shape={}];", id, escape(&label), shape)?;
    }

    for e in g.graph.edge_references() {
        let (u, v) = (e.source(), e.target());
        if !included(u) || !included(v) || ignored.contains(&u) || ignored.contains(&v) {
            continue;
        }
        let (Some(&u_id), Some(&v_id)) = (names.get(&u), names.get(&v)) else {
            continue;
        };
        let style = if e.weight().repaired { ", style=dashed" } else { "" };
        writeln!(
            out,
            "n{} -> n{} [label=\"{}\"{}];",
            u_id,
            v_id,
            escape(&e.weight().arg),
            style
        )?;
    }

    writeln!(out, "labelloc=\"t\";")?;
    writeln!(out, "label=\"{}\";", escape(&options.title))?;
    writeln!(out, "}}")?;
    Ok(())
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}

#[cfg(test)]
mod tests {
    use super::super::tests::{file_meta, graph_of, step_record};
    use super::*;

    #[test]
    fn test_dot_contains_nodes_and_edges() {
        let f1 = file_meta("/data/f1.txt", "blake3_f1", 100);
        let g = graph_of(vec![
            step_record("make", 90, &[], &[("out", f1.clone())]),
            step_record("use", 150, &[("in", f1)], &[]),
        ]);

        let mut buf = Vec::new();
        write_dot(&g, &mut buf, &DotOptions::default()).unwrap();
        let dot = String::from_utf8(buf).unwrap();

        assert!(dot.starts_with("digraph G {"));
        assert!(dot.contains("shape=invhouse"));
        assert!(dot.contains("shape=oval"));
        assert!(dot.contains("f1.txt"));
        assert!(dot.contains("->"));
    }

    #[test]
    fn test_ignored_step_omitted() {
        let f1 = file_meta("/data/f1.txt", "blake3_f1", 100);
        let g = graph_of(vec![step_record("make", 90, &[], &[("out", f1)])]);

        let options = DotOptions {
            ignore_cmds: vec!["make".to_string()],
            ..DotOptions::default()
        };
        let mut buf = Vec::new();
        write_dot(&g, &mut buf, &options).unwrap();
        let dot = String::from_utf8(buf).unwrap();
        assert!(!dot.contains("invhouse"));
        assert!(!dot.contains("->"));
    }
}
