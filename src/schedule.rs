use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::liveness::{BufferId, LiveRange};
use crate::model::{EdgeId, Graph, Normalized, NodeId};
use crate::validation;

/// One step of an execution plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ScheduleStep {
    /// First execution of a node
    Compute(NodeId),
    /// Re-execution of a node to restore discarded outputs
    Recompute(NodeId),
    /// Copy a buffer to host memory and release it on the device
    SpillOut(EdgeId),
    /// Copy a spilled buffer back to the device
    SpillIn(EdgeId),
    /// Release a buffer that will be recomputed later
    Discard(EdgeId),
}

impl fmt::Display for ScheduleStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScheduleStep::Compute(n) => write!(f, "compute {}", n),
            ScheduleStep::Recompute(n) => write!(f, "recompute {}", n),
            ScheduleStep::SpillOut(e) => write!(f, "spill-out {}", e),
            ScheduleStep::SpillIn(e) => write!(f, "spill-in {}", e),
            ScheduleStep::Discard(e) => write!(f, "discard {}", e),
        }
    }
}

/// An ordered execution plan over a normalized graph
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    steps: Vec<ScheduleStep>,
}

impl Schedule {
    /// Wrap a candidate step list; use the validation functions to check it
    pub fn new(steps: Vec<ScheduleStep>) -> Self {
        Self { steps }
    }

    /// Plain schedule computing each node of a valid topological order once
    pub fn from_order(graph: &Graph<Normalized>, order: &[NodeId]) -> Result<Self> {
        validation::validate_topological_order(graph, order)?;
        Ok(Self::new(order.iter().map(|&n| ScheduleStep::Compute(n)).collect()))
    }

    pub fn steps(&self) -> &[ScheduleStep] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// First executions, in order
    pub fn node_order(&self) -> Vec<NodeId> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                ScheduleStep::Compute(n) => Some(*n),
                _ => None,
            })
            .collect()
    }

    /// Nodes executed more than once, in order of their re-execution
    pub fn recomputed_nodes(&self) -> Vec<NodeId> {
        self.steps
            .iter()
            .filter_map(|step| match step {
                ScheduleStep::Recompute(n) => Some(*n),
                _ => None,
            })
            .collect()
    }

    /// Whether the plan only computes nodes
    pub fn is_plain(&self) -> bool {
        self.steps
            .iter()
            .all(|step| matches!(step, ScheduleStep::Compute(_)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Touch {
    Read,
    Produce,
    Release,
    Restore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Residency {
    Pending,
    Resident { instance: u32, since: usize },
    Spilled,
    Dropped,
}

/// Device memory over the course of a schedule
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Replay {
    /// Bytes resident after each step
    pub usage: Vec<u64>,
    /// Maximum of `usage`
    pub peak: u64,
    /// Every resident buffer instance
    pub ranges: Vec<LiveRange>,
    /// Bytes moved in either direction
    pub bytes_swapped: u64,
    /// Number of spill-out steps
    pub spill_outs: usize,
    /// Re-executed nodes
    pub recomputed: Vec<NodeId>,
}

fn invalid(step: usize, what: impl fmt::Display) -> Error {
    Error::Validation(format!("step {}: {}", step, what))
}

/// Execute a schedule symbolically.
///
/// A node's data outputs are allocated when it executes, unless nothing
/// reads or evicts them before they are produced again. A buffer is freed
/// right after the step that reads it, if its next use is another
/// production or nothing at all. Usage is sampled after each step.
pub fn replay(graph: &Graph<Normalized>, schedule: &Schedule) -> Result<Replay> {
    let steps = schedule.steps();
    let edges = graph.edges();

    let mut touches: Vec<Vec<(usize, Touch)>> = vec![Vec::new(); edges.len()];
    for (t, step) in steps.iter().enumerate() {
        match *step {
            ScheduleStep::Compute(v) | ScheduleStep::Recompute(v) => {
                let node = graph.node(v).ok_or_else(|| invalid(t, format!("unknown node {}", v)))?;
                for e in &node.fanin {
                    if !edges[e.0].is_control() {
                        touches[e.0].push((t, Touch::Read));
                    }
                }
                for e in &node.fanout {
                    if !edges[e.0].is_control() {
                        touches[e.0].push((t, Touch::Produce));
                    }
                }
            }
            ScheduleStep::SpillOut(e) | ScheduleStep::Discard(e) => {
                if graph.edge(e).is_none() {
                    return Err(invalid(t, format!("unknown edge {}", e)));
                }
                touches[e.0].push((t, Touch::Release));
            }
            ScheduleStep::SpillIn(e) => {
                if graph.edge(e).is_none() {
                    return Err(invalid(t, format!("unknown edge {}", e)));
                }
                touches[e.0].push((t, Touch::Restore));
            }
        }
    }

    // Whether the buffer must stay resident after step `t`.
    let kept_after = |e: EdgeId, t: usize| -> bool {
        let list = &touches[e.0];
        let i = list.partition_point(|(s, _)| *s <= t);
        matches!(list.get(i), Some((_, Touch::Read)) | Some((_, Touch::Release)))
    };

    let mut state = vec![Residency::Pending; edges.len()];
    let mut instances = vec![0u32; edges.len()];
    let mut computed = vec![false; graph.num_nodes()];
    let mut result = Replay::default();
    let mut usage: u64 = 0;

    let mut open = |e: EdgeId, t: usize, state: &mut Vec<Residency>, usage: &mut u64| {
        state[e.0] = Residency::Resident { instance: instances[e.0], since: t };
        instances[e.0] += 1;
        *usage += edges[e.0].size;
    };
    let close = |e: EdgeId, t: usize, state: &mut Vec<Residency>, usage: &mut u64, ranges: &mut Vec<LiveRange>| {
        if let Residency::Resident { instance, since } = state[e.0] {
            ranges.push(LiveRange {
                buffer: BufferId { edge: e, instance },
                size: edges[e.0].size,
                start: since,
                end: t,
            });
            *usage -= edges[e.0].size;
        }
        state[e.0] = Residency::Dropped;
    };

    for (t, step) in steps.iter().enumerate() {
        match *step {
            ScheduleStep::Compute(v) | ScheduleStep::Recompute(v) => {
                let node = &graph.nodes()[v.0];
                let first = matches!(step, ScheduleStep::Compute(_));
                if first && computed[v.0] {
                    return Err(invalid(t, format!("node {} is computed twice", v)));
                }
                if !first {
                    if !computed[v.0] {
                        return Err(invalid(t, format!("node {} is recomputed before it is computed", v)));
                    }
                    if !node.kind.is_rematerializable() {
                        return Err(invalid(t, format!("node {} ({}) cannot be recomputed", v, node.kind)));
                    }
                }

                for &e in &node.fanin {
                    let edge = &edges[e.0];
                    if edge.is_control() {
                        if !computed[edge.producer.0] {
                            return Err(invalid(t, format!("node {} runs before its dependency {}", v, edge.producer)));
                        }
                    } else if !matches!(state[e.0], Residency::Resident { .. }) {
                        return Err(invalid(t, format!("input {} of node {} is not resident", e, v)));
                    }
                }

                computed[v.0] = true;
                if !first {
                    result.recomputed.push(v);
                }

                for &e in &node.fanout {
                    if edges[e.0].is_control() || matches!(state[e.0], Residency::Resident { .. }) {
                        continue;
                    }
                    if kept_after(e, t) {
                        open(e, t, &mut state, &mut usage);
                    } else if state[e.0] == Residency::Pending {
                        state[e.0] = Residency::Dropped;
                    }
                }
                for &e in &node.fanin {
                    if !edges[e.0].is_control() && !kept_after(e, t) {
                        close(e, t, &mut state, &mut usage, &mut result.ranges);
                    }
                }
            }
            ScheduleStep::SpillOut(e) => {
                if !matches!(state[e.0], Residency::Resident { .. }) {
                    return Err(invalid(t, format!("spilled buffer {} is not resident", e)));
                }
                close(e, t, &mut state, &mut usage, &mut result.ranges);
                state[e.0] = Residency::Spilled;
                result.bytes_swapped += edges[e.0].size;
                result.spill_outs += 1;
            }
            ScheduleStep::SpillIn(e) => {
                if state[e.0] != Residency::Spilled {
                    return Err(invalid(t, format!("restored buffer {} was not spilled", e)));
                }
                result.bytes_swapped += edges[e.0].size;
                if kept_after(e, t) {
                    open(e, t, &mut state, &mut usage);
                } else {
                    state[e.0] = Residency::Dropped;
                }
            }
            ScheduleStep::Discard(e) => {
                if !matches!(state[e.0], Residency::Resident { .. }) {
                    return Err(invalid(t, format!("discarded buffer {} is not resident", e)));
                }
                close(e, t, &mut state, &mut usage, &mut result.ranges);
            }
        }

        result.peak = result.peak.max(usage);
        result.usage.push(usage);
    }

    if let Some(missing) = computed.iter().position(|done| !done) {
        return Err(Error::Validation(format!("node {} is never computed", NodeId(missing))));
    }

    let end = steps.len();
    for e in 0..edges.len() {
        close(EdgeId(e), end, &mut state, &mut usage, &mut result.ranges);
    }

    result.ranges.sort_by_key(|r| (r.start, r.buffer));
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GraphMode, OpKind};

    /// in -(10)-> a -(20)-> b -(5)-> output, plus in -(10)-> b
    fn chain() -> Graph<Normalized> {
        let mut g = Graph::new("chain", GraphMode::Inference);
        let input = g.add_node("in", OpKind::Input, None).unwrap();
        let a = g.add_node("a", OpKind::Compute, Some(1.0)).unwrap();
        let b = g.add_node("b", OpKind::Compute, Some(1.0)).unwrap();
        g.add_edge(input, &[a, b], 10, "x").unwrap();
        g.add_edge(a, &[b], 20, "y").unwrap();
        g.add_edge(b, &[], 5, "z").unwrap();
        g.into_normalized().unwrap()
    }

    #[test]
    fn test_plain_replay_frees_after_last_read() {
        let g = chain();
        let order = g.topological_order().unwrap();
        let schedule = Schedule::from_order(&g, &order).unwrap();
        let replay = replay(&g, &schedule).unwrap();
        assert_eq!(replay.usage, vec![10, 30, 5, 0]);
        assert_eq!(replay.peak, 30);
        assert_eq!(replay.ranges.len(), 3);
        assert_eq!(replay.bytes_swapped, 0);
    }

    #[test]
    fn test_spill_round_trip_is_counted_both_ways() {
        let g = chain();
        let x = EdgeId(0);
        let steps = vec![
            ScheduleStep::Compute(NodeId(0)),
            ScheduleStep::Compute(NodeId(1)),
            ScheduleStep::SpillOut(x),
            ScheduleStep::SpillIn(x),
            ScheduleStep::Compute(NodeId(2)),
            ScheduleStep::Compute(NodeId(3)),
        ];
        let replay = replay(&g, &Schedule::new(steps)).unwrap();
        assert_eq!(replay.usage, vec![10, 30, 20, 30, 5, 0]);
        assert_eq!(replay.bytes_swapped, 20);
        assert_eq!(replay.spill_outs, 1);
        let instances: Vec<u32> = replay
            .ranges
            .iter()
            .filter(|r| r.buffer.edge == x)
            .map(|r| r.buffer.instance)
            .collect();
        assert_eq!(instances, vec![0, 1]);
    }

    #[test]
    fn test_recompute_after_discard() {
        let g = chain();
        let y = EdgeId(1);
        let steps = vec![
            ScheduleStep::Compute(NodeId(0)),
            ScheduleStep::Compute(NodeId(1)),
            ScheduleStep::Discard(y),
            ScheduleStep::Recompute(NodeId(1)),
            ScheduleStep::Compute(NodeId(2)),
            ScheduleStep::Compute(NodeId(3)),
        ];
        let replay = replay(&g, &Schedule::new(steps)).unwrap();
        assert_eq!(replay.usage, vec![10, 30, 10, 30, 5, 0]);
        assert_eq!(replay.recomputed, vec![NodeId(1)]);
    }

    #[test]
    fn test_reading_a_discarded_buffer_fails() {
        let g = chain();
        let steps = vec![
            ScheduleStep::Compute(NodeId(0)),
            ScheduleStep::Compute(NodeId(1)),
            ScheduleStep::Discard(EdgeId(1)),
            ScheduleStep::Compute(NodeId(2)),
            ScheduleStep::Compute(NodeId(3)),
        ];
        assert!(replay(&g, &Schedule::new(steps)).is_err());
    }

    #[test]
    fn test_inputs_cannot_be_recomputed() {
        let g = chain();
        let steps = vec![
            ScheduleStep::Compute(NodeId(0)),
            ScheduleStep::Recompute(NodeId(0)),
            ScheduleStep::Compute(NodeId(1)),
            ScheduleStep::Compute(NodeId(2)),
            ScheduleStep::Compute(NodeId(3)),
        ];
        assert!(replay(&g, &Schedule::new(steps)).is_err());
    }

    #[test]
    fn test_missing_node_fails() {
        let g = chain();
        let steps = vec![ScheduleStep::Compute(NodeId(0)), ScheduleStep::Compute(NodeId(1))];
        assert!(replay(&g, &Schedule::new(steps)).is_err());
    }

    #[test]
    fn test_schedule_accessors() {
        let schedule = Schedule::new(vec![
            ScheduleStep::Compute(NodeId(0)),
            ScheduleStep::Discard(EdgeId(0)),
            ScheduleStep::Recompute(NodeId(0)),
        ]);
        assert_eq!(schedule.node_order(), vec![NodeId(0)]);
        assert_eq!(schedule.recomputed_nodes(), vec![NodeId(0)]);
        assert!(!schedule.is_plain());
        assert_eq!(schedule.len(), 3);
    }
}
