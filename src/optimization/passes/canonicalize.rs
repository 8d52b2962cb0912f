use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashSet};
use std::time::Instant;

use log::debug;

use crate::error::Result;
use crate::model::{Edge, EdgeId, Graph, Node, NodeId, OpKind, Raw};
use crate::optimization::graph_optimizer::{NormalizationPass, PassResult};

/// Rewrites a raw graph into normal form.
///
/// * duplicate sink and fanin/fanout references are removed
/// * the control edges of a node are merged into one, dropping sinks that a
///   data edge from the same producer already orders
/// * control edges left without sinks are deleted
/// * data edges without sinks are attached to a single output node
/// * nodes are renumbered in topological order (smallest previous id first)
///   and edges by producer, then position in the producer's fanout
///
/// Running the pass twice leaves the graph unchanged the second time.
pub struct Canonicalize {
    name: String,
}

impl Default for Canonicalize {
    fn default() -> Self {
        Self::new()
    }
}

impl Canonicalize {
    pub fn new() -> Self {
        Self {
            name: "Canonicalize".to_string(),
        }
    }

    fn dedup<T: Copy + Eq + std::hash::Hash>(items: &mut Vec<T>) -> usize {
        let before = items.len();
        let mut seen = HashSet::with_capacity(before);
        items.retain(|item| seen.insert(*item));
        before - items.len()
    }

    /// Merge control fanout per producer; returns the number of rewrites
    fn merge_control_edges(nodes: &[Node], edges: &mut [Edge], removed: &mut [bool]) -> usize {
        let mut rewrites = 0;
        for node in nodes {
            let controls: Vec<EdgeId> = node
                .fanout
                .iter()
                .copied()
                .filter(|e| edges[e.0].is_control())
                .collect();
            let Some((&keep, rest)) = controls.split_first() else {
                continue;
            };

            let data_sinks: HashSet<NodeId> = node
                .fanout
                .iter()
                .filter(|e| !edges[e.0].is_control())
                .flat_map(|e| edges[e.0].sinks.iter().copied())
                .collect();

            let mut merged = Vec::new();
            for control in &controls {
                for &sink in &edges[control.0].sinks {
                    if !data_sinks.contains(&sink) && !merged.contains(&sink) {
                        merged.push(sink);
                    }
                }
            }

            for other in rest {
                removed[other.0] = true;
                rewrites += 1;
            }
            if merged.is_empty() {
                removed[keep.0] = true;
                rewrites += 1;
            } else if edges[keep.0].sinks != merged {
                edges[keep.0].sinks = merged;
                rewrites += 1;
            }
        }
        rewrites
    }

    /// Make fanin lists agree with the sink lists of surviving edges
    fn sync_references(nodes: &mut [Node], edges: &[Edge], removed: &[bool]) {
        for node in nodes.iter_mut() {
            let id = node.id;
            node.fanout.retain(|e| !removed[e.0]);
            node.fanin
                .retain(|e| !removed[e.0] && edges[e.0].sinks.contains(&id));
        }
        for edge in edges.iter().filter(|e| !removed[e.id.0]) {
            for &sink in &edge.sinks {
                let fanin = &mut nodes[sink.0].fanin;
                if !fanin.contains(&edge.id) {
                    fanin.push(edge.id);
                }
            }
        }
    }

    fn unique_name(nodes: &[Node], base: &str) -> String {
        let taken: HashSet<&str> = nodes.iter().map(|n| n.name.as_str()).collect();
        let mut name = base.to_string();
        let mut suffix = 1;
        while taken.contains(name.as_str()) {
            name = format!("{}_{}", base, suffix);
            suffix += 1;
        }
        name
    }

    /// Route data edges without consumers into the output node
    fn attach_outputs(nodes: &mut Vec<Node>, edges: &mut [Edge], removed: &[bool]) -> usize {
        let dangling: Vec<EdgeId> = edges
            .iter()
            .filter(|e| !removed[e.id.0] && !e.is_control() && e.sinks.is_empty())
            .map(|e| e.id)
            .collect();
        if dangling.is_empty() {
            return 0;
        }

        let output = match nodes.iter().find(|n| n.kind == OpKind::Output) {
            Some(node) => node.id,
            None => {
                let id = NodeId(nodes.len());
                let name = Self::unique_name(nodes, "output");
                nodes.push(Node {
                    id,
                    name,
                    kind: OpKind::Output,
                    time: None,
                    fanin: Vec::new(),
                    fanout: Vec::new(),
                });
                id
            }
        };

        let mut attached = 0;
        for edge_id in dangling {
            let edge = &mut edges[edge_id.0];
            if edge.producer == output {
                continue;
            }
            edge.sinks.push(output);
            nodes[output.0].fanin.push(edge_id);
            attached += 1;
        }
        attached
    }

    /// Kahn order with the smallest previous id first, or `None` on a cycle
    fn topological_numbering(nodes: &[Node], edges: &[Edge], removed: &[bool]) -> Option<Vec<usize>> {
        let n = nodes.len();
        let mut in_degree = vec![0usize; n];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];
        for node in nodes {
            let mut seen = HashSet::new();
            for edge in node.fanout.iter().filter(|e| !removed[e.0]) {
                for &sink in &edges[edge.0].sinks {
                    if seen.insert(sink) {
                        successors[node.id.0].push(sink.0);
                        in_degree[sink.0] += 1;
                    }
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> =
            (0..n).filter(|&i| in_degree[i] == 0).map(Reverse).collect();
        let mut new_ids = vec![usize::MAX; n];
        let mut next = 0;
        while let Some(Reverse(i)) = ready.pop() {
            new_ids[i] = next;
            next += 1;
            for &succ in &successors[i] {
                in_degree[succ] -= 1;
                if in_degree[succ] == 0 {
                    ready.push(Reverse(succ));
                }
            }
        }

        (next == n).then_some(new_ids)
    }
}

impl NormalizationPass for Canonicalize {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, graph: &mut Graph<Raw>) -> Result<PassResult> {
        let start_time = Instant::now();
        let mut nodes = graph.nodes().to_vec();
        let mut edges = graph.edges().to_vec();
        let mut rewrites = 0;

        for edge in &mut edges {
            rewrites += Self::dedup(&mut edge.sinks);
        }
        for node in &mut nodes {
            rewrites += Self::dedup(&mut node.fanin);
            rewrites += Self::dedup(&mut node.fanout);
        }

        let mut removed = vec![false; edges.len()];
        rewrites += Self::merge_control_edges(&nodes, &mut edges, &mut removed);
        Self::sync_references(&mut nodes, &edges, &removed);
        rewrites += Self::attach_outputs(&mut nodes, &mut edges, &removed);

        let node_map = match Self::topological_numbering(&nodes, &edges, &removed) {
            Some(map) => map,
            None => {
                debug!("graph '{}' is cyclic, keeping node numbering", graph.name());
                (0..nodes.len()).collect()
            }
        };

        // Edges follow their producer's new position, then fanout order.
        let mut producers: Vec<usize> = (0..nodes.len()).collect();
        producers.sort_by_key(|&i| node_map[i]);
        let mut edge_map = vec![usize::MAX; edges.len()];
        let mut next_edge = 0;
        for &p in &producers {
            for e in &nodes[p].fanout {
                if edge_map[e.0] == usize::MAX {
                    edge_map[e.0] = next_edge;
                    next_edge += 1;
                }
            }
        }
        for (old, slot) in edge_map.iter_mut().enumerate() {
            if *slot == usize::MAX && !removed[old] {
                *slot = next_edge;
                next_edge += 1;
            }
        }

        let renumbered = node_map.iter().enumerate().any(|(old, &new)| old != new)
            || edge_map
                .iter()
                .enumerate()
                .any(|(old, &new)| !removed[old] && old != new);
        if renumbered {
            rewrites += 1;
        }

        let remap_edge = |e: &EdgeId| EdgeId(edge_map[e.0]);
        let mut new_nodes: Vec<Option<Node>> = vec![None; nodes.len()];
        for node in nodes {
            let id = NodeId(node_map[node.id.0]);
            new_nodes[id.0] = Some(Node {
                id,
                fanin: node.fanin.iter().map(remap_edge).collect(),
                fanout: node.fanout.iter().map(remap_edge).collect(),
                ..node
            });
        }
        let mut new_edges: Vec<Option<Edge>> = vec![None; next_edge];
        for edge in edges.into_iter().filter(|e| !removed[e.id.0]) {
            let id = EdgeId(edge_map[edge.id.0]);
            new_edges[id.0] = Some(Edge {
                id,
                producer: NodeId(node_map[edge.producer.0]),
                sinks: edge.sinks.iter().map(|s| NodeId(node_map[s.0])).collect(),
                ..edge
            });
        }

        graph.replace_contents(
            new_nodes.into_iter().flatten().collect(),
            new_edges.into_iter().flatten().collect(),
        );

        Ok(PassResult {
            name: self.name.clone(),
            optimizations_applied: rewrites,
            duration: start_time.elapsed(),
            changed: rewrites > 0,
        })
    }
}
