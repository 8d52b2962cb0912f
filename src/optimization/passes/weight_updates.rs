use std::time::Instant;

use log::debug;
use petgraph::algo::{has_path_connecting, DfsSpace};
use petgraph::graph::NodeIndex;

use crate::error::{Error, Result};
use crate::model::{Graph, GraphMode, NodeId, OpKind, Raw};
use crate::optimization::graph_optimizer::{NormalizationPass, PassResult};

/// Orders every weight update after all other readers of the weight value it
/// overwrites, so the optimizer cannot reorder a read past the update.
///
/// The weight value is the data fanin produced by a `Weight` node. Updates
/// with no such fanin fall back to constraining all of their data fanin.
pub struct ConstrainWeightUpdates {
    name: String,
}

impl Default for ConstrainWeightUpdates {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstrainWeightUpdates {
    pub fn new() -> Self {
        Self {
            name: "ConstrainWeightUpdates".to_string(),
        }
    }

    /// Readers of the pre-update values consumed by `update`
    fn readers(graph: &Graph<Raw>, update: NodeId) -> Vec<NodeId> {
        let Some(node) = graph.node(update) else {
            return Vec::new();
        };
        let data: Vec<_> = node
            .fanin
            .iter()
            .filter_map(|e| graph.edge(*e))
            .filter(|e| !e.is_control())
            .collect();
        let weights: Vec<_> = data
            .iter()
            .filter(|e| graph.node(e.producer).map_or(false, |p| p.kind == OpKind::Weight))
            .copied()
            .collect();
        let constrained = if weights.is_empty() { data } else { weights };

        let mut readers = Vec::new();
        for edge in constrained {
            for &sink in &edge.sinks {
                if sink != update && !readers.contains(&sink) {
                    readers.push(sink);
                }
            }
        }
        readers
    }
}

impl NormalizationPass for ConstrainWeightUpdates {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, graph: &mut Graph<Raw>) -> Result<PassResult> {
        let start_time = Instant::now();

        let updates: Vec<NodeId> = graph
            .nodes()
            .iter()
            .filter(|n| n.kind == OpKind::WeightUpdate)
            .map(|n| n.id)
            .collect();

        if updates.is_empty() && graph.mode() == GraphMode::Training {
            return Err(Error::InvalidGraph(format!(
                "Training graph '{}' has no weight update operators",
                graph.name()
            )));
        }

        let mut deps = graph.dependency_graph();
        let mut space = DfsSpace::new(&deps);
        let mut added = 0;

        for update in updates {
            for reader in Self::readers(graph, update) {
                let (r, u) = (NodeIndex::new(reader.0), NodeIndex::new(update.0));
                if has_path_connecting(&deps, r, u, Some(&mut space)) {
                    continue;
                }
                if has_path_connecting(&deps, u, r, Some(&mut space)) {
                    return Err(Error::InvalidGraph(format!(
                        "Weight update {} must run after {} but is one of its ancestors",
                        update, reader
                    )));
                }
                let edge = graph.add_control_dependency(reader, update)?;
                deps.add_edge(r, u, edge);
                added += 1;
            }
        }

        debug!("added {} weight update constraints", added);

        Ok(PassResult {
            name: self.name.clone(),
            optimizations_applied: added,
            duration: start_time.elapsed(),
            changed: added > 0,
        })
    }

    fn dependencies(&self) -> Vec<&str> {
        vec!["Canonicalize"]
    }
}
