use std::time::Instant;

use log::debug;
use petgraph::algo::{has_path_connecting, DfsSpace};
use petgraph::graph::NodeIndex;

use crate::error::Result;
use crate::model::{Graph, NodeId, OpKind, Raw};
use crate::optimization::graph_optimizer::{NormalizationPass, PassResult};

/// Delays tensor generators that feed a single consumer until the other
/// inputs of that consumer exist, so generated tensors are not allocated
/// long before use. Constraints that would close a cycle are skipped.
pub struct ConstrainTensorGenerators {
    name: String,
}

impl Default for ConstrainTensorGenerators {
    fn default() -> Self {
        Self::new()
    }
}

impl ConstrainTensorGenerators {
    pub fn new() -> Self {
        Self {
            name: "ConstrainTensorGenerators".to_string(),
        }
    }

    /// The unique consumer of a pure generator's data outputs
    fn single_consumer(graph: &Graph<Raw>, generator: NodeId) -> Option<NodeId> {
        let node = graph.node(generator)?;
        let has_data_fanin = node
            .fanin
            .iter()
            .filter_map(|e| graph.edge(*e))
            .any(|e| !e.is_control());
        if has_data_fanin {
            return None;
        }

        let mut consumer = None;
        for edge in node.fanout.iter().filter_map(|e| graph.edge(*e)) {
            if edge.is_control() {
                continue;
            }
            for &sink in &edge.sinks {
                match consumer {
                    None => consumer = Some(sink),
                    Some(c) if c == sink => {}
                    Some(_) => return None,
                }
            }
        }
        consumer
    }
}

impl NormalizationPass for ConstrainTensorGenerators {
    fn name(&self) -> &str {
        &self.name
    }

    fn run(&self, graph: &mut Graph<Raw>) -> Result<PassResult> {
        let start_time = Instant::now();

        let generators: Vec<NodeId> = graph
            .nodes()
            .iter()
            .filter(|n| n.kind == OpKind::TensorGenerator)
            .map(|n| n.id)
            .collect();

        let mut deps = graph.dependency_graph();
        let mut space = DfsSpace::new(&deps);
        let mut added = 0;
        let mut skipped = 0;

        for generator in generators {
            let Some(consumer) = Self::single_consumer(graph, generator) else {
                continue;
            };
            let producers: Vec<NodeId> = graph
                .predecessors(consumer)
                .into_iter()
                .filter(|&p| p != generator)
                .collect();

            for producer in producers {
                let (p, g) = (NodeIndex::new(producer.0), NodeIndex::new(generator.0));
                if has_path_connecting(&deps, p, g, Some(&mut space)) {
                    continue;
                }
                if has_path_connecting(&deps, g, p, Some(&mut space)) {
                    skipped += 1;
                    continue;
                }
                let edge = graph.add_control_dependency(producer, generator)?;
                deps.add_edge(p, g, edge);
                added += 1;
            }
        }

        debug!(
            "added {} tensor generator constraints, skipped {} that would create cycles",
            added, skipped
        );

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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::GraphMode;

    #[test]
    fn test_generator_waits_for_sibling_inputs() {
        let mut g = Graph::new("dropout", GraphMode::Inference);
        let x = g.add_node("x", OpKind::Input, None).unwrap();
        let conv = g.add_node("conv", OpKind::Compute, None).unwrap();
        let rng = g.add_node("rng", OpKind::TensorGenerator, None).unwrap();
        let drop = g.add_node("dropout", OpKind::Compute, None).unwrap();
        g.add_edge(x, &[conv], 4, "x").unwrap();
        g.add_edge(conv, &[drop], 4, "act").unwrap();
        g.add_edge(rng, &[drop], 4, "mask").unwrap();
        g.add_edge(drop, &[], 4, "y").unwrap();

        let result = g.constrain_tensor_generators().unwrap();
        assert_eq!(result.optimizations_applied, 1);
        assert!(g.has_direct_dependency(conv, rng));
    }

    #[test]
    fn test_shared_generator_is_left_alone() {
        let mut g = Graph::new("shared", GraphMode::Inference);
        let rng = g.add_node("rng", OpKind::TensorGenerator, None).unwrap();
        let a = g.add_node("a", OpKind::Compute, None).unwrap();
        let b = g.add_node("b", OpKind::Compute, None).unwrap();
        g.add_edge(rng, &[a, b], 4, "mask").unwrap();
        let result = g.constrain_tensor_generators().unwrap();
        assert!(!result.changed);
    }

    #[test]
    fn test_cyclic_constraint_is_skipped() {
        let mut g = Graph::new("cyclic", GraphMode::Inference);
        let rng = g.add_node("rng", OpKind::TensorGenerator, None).unwrap();
        let a = g.add_node("a", OpKind::Compute, None).unwrap();
        let c = g.add_node("c", OpKind::Compute, None).unwrap();
        g.add_edge(rng, &[c], 4, "mask").unwrap();
        // rng orders a, which also feeds c: a -> rng would close a loop.
        g.add_edge(rng, &[a], 0, "ctrl").unwrap();
        g.add_edge(a, &[c], 4, "act").unwrap();

        let result = g.constrain_tensor_generators().unwrap();
        assert!(!result.changed);
        assert!(g.topological_order().is_ok());
    }
}
