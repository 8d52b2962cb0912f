use serde::{Deserialize, Serialize};
use strum_macros::Display;

use crate::error::Result;
use crate::model::{EdgeId, Graph, Normalized, NodeId};
use crate::validation::validate_topological_order;

/// Memory profile of a plain execution order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationResult {
    /// Maximum resident bytes over all steps
    pub peak_mem_usage: u64,
    /// Resident bytes after each node completes
    pub mem_per_timestep: Vec<(NodeId, u64)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum MemoryEventKind {
    Allocate,
    Free,
}

/// One allocation or release caused by executing a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryEvent {
    pub step: usize,
    pub node: NodeId,
    pub edge: EdgeId,
    pub size: u64,
    pub kind: MemoryEventKind,
}

/// Computes memory usage of a graph under a given execution order.
///
/// Executing a node allocates its data outputs and releases every input
/// whose consumers have now all run. Control edges never hold memory.
pub struct Simulator<'g> {
    graph: &'g Graph<Normalized>,
}

impl<'g> Simulator<'g> {
    pub fn new(graph: &'g Graph<Normalized>) -> Self {
        Self { graph }
    }

    /// Allocation and release events of `order`, in execution order
    pub fn memory_events(&self, order: &[NodeId]) -> Result<Vec<MemoryEvent>> {
        validate_topological_order(self.graph, order)?;

        let edges = self.graph.edges();
        let mut remaining: Vec<usize> = edges.iter().map(|e| e.sinks.len()).collect();
        let mut events = Vec::new();

        for (step, &node_id) in order.iter().enumerate() {
            let node = &self.graph.nodes()[node_id.0];
            for &e in &node.fanout {
                if !edges[e.0].is_control() {
                    events.push(MemoryEvent {
                        step,
                        node: node_id,
                        edge: e,
                        size: edges[e.0].size,
                        kind: MemoryEventKind::Allocate,
                    });
                }
            }
            for &e in &node.fanin {
                remaining[e.0] -= 1;
                if remaining[e.0] == 0 && !edges[e.0].is_control() {
                    events.push(MemoryEvent {
                        step,
                        node: node_id,
                        edge: e,
                        size: edges[e.0].size,
                        kind: MemoryEventKind::Free,
                    });
                }
            }
        }

        Ok(events)
    }

    /// Peak memory and per-step usage of `order`
    pub fn simulate(&self, order: &[NodeId]) -> Result<SimulationResult> {
        let events = self.memory_events(order)?;
        let mut mem_per_timestep = Vec::with_capacity(order.len());
        let mut usage: u64 = 0;
        let mut peak: u64 = 0;
        let mut cursor = events.iter().peekable();

        for (step, &node) in order.iter().enumerate() {
            while let Some(event) = cursor.next_if(|e| e.step == step) {
                match event.kind {
                    MemoryEventKind::Allocate => usage += event.size,
                    MemoryEventKind::Free => usage -= event.size,
                }
            }
            peak = peak.max(usage);
            mem_per_timestep.push((node, usage));
        }

        Ok(SimulationResult {
            peak_mem_usage: peak,
            mem_per_timestep,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GraphMode, OpKind};

    fn fork() -> Graph<Normalized> {
        let mut g = Graph::new("fork", GraphMode::Inference);
        let a = g.add_node("a", OpKind::Input, None).unwrap();
        let b = g.add_node("b", OpKind::Compute, None).unwrap();
        let c = g.add_node("c", OpKind::Compute, None).unwrap();
        let d = g.add_node("d", OpKind::Compute, None).unwrap();
        g.add_edge(a, &[b, c], 8, "x").unwrap();
        g.add_edge(b, &[d], 4, "y").unwrap();
        g.add_edge(c, &[d], 16, "z").unwrap();
        g.add_edge(b, &[c], 0, "order").unwrap();
        g.add_edge(d, &[], 2, "out").unwrap();
        g.into_normalized().unwrap()
    }

    #[test]
    fn test_usage_after_each_step() {
        let g = fork();
        let order = g.topological_order().unwrap();
        let result = Simulator::new(&g).simulate(&order).unwrap();
        let usage: Vec<u64> = result.mem_per_timestep.iter().map(|(_, m)| *m).collect();
        assert_eq!(usage, vec![8, 12, 20, 2, 0]);
        assert_eq!(result.peak_mem_usage, 20);
    }

    #[test]
    fn test_events_balance() {
        let g = fork();
        let order = g.topological_order().unwrap();
        let events = Simulator::new(&g).memory_events(&order).unwrap();
        let allocated: u64 = events
            .iter()
            .filter(|e| e.kind == MemoryEventKind::Allocate)
            .map(|e| e.size)
            .sum();
        let freed: u64 = events
            .iter()
            .filter(|e| e.kind == MemoryEventKind::Free)
            .map(|e| e.size)
            .sum();
        assert_eq!(allocated, freed);
        assert_eq!(allocated, 30);
    }

    #[test]
    fn test_invalid_orders_are_rejected() {
        let g = fork();
        let sim = Simulator::new(&g);
        let mut order = g.topological_order().unwrap();
        order.swap(0, 1);
        assert!(sim.simulate(&order).is_err());
        assert!(sim.simulate(&order[..2]).is_err());
    }
}
