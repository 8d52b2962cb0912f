//! Independent checks for plans produced by the scheduler or supplied by
//! callers. Every check returns `Error::Validation` describing the first
//! problem found.

use std::collections::HashMap;

use crate::error::{Error, Result};
use crate::memory::liveness::BufferId;
use crate::memory::planner::AddressAssignment;
use crate::model::{Graph, Normalized, NodeId};
use crate::schedule::{replay, Schedule};

/// Check that `order` lists every node exactly once, dependencies first
pub fn validate_topological_order(graph: &Graph<Normalized>, order: &[NodeId]) -> Result<()> {
    let n = graph.num_nodes();
    if order.len() != n {
        return Err(Error::Validation(format!(
            "ordering has {} nodes, graph has {}",
            order.len(),
            n
        )));
    }

    let mut position = vec![usize::MAX; n];
    for (i, node) in order.iter().enumerate() {
        if node.0 >= n {
            return Err(Error::Validation(format!("ordering contains unknown node {}", node)));
        }
        if position[node.0] != usize::MAX {
            return Err(Error::Validation(format!("node {} appears twice in ordering", node)));
        }
        position[node.0] = i;
    }

    for edge in graph.edges() {
        for sink in &edge.sinks {
            if position[edge.producer.0] > position[sink.0] {
                return Err(Error::Validation(format!(
                    "node {} is scheduled before its dependency {}",
                    sink, edge.producer
                )));
            }
        }
    }

    Ok(())
}

/// First-execution order of a schedule
pub fn extract_node_ordering(graph: &Graph<Normalized>, schedule: &Schedule) -> Result<Vec<NodeId>> {
    let order = schedule.node_order();
    if let Some(unknown) = order.iter().find(|n| graph.node(**n).is_none()) {
        return Err(Error::Validation(format!("schedule references unknown node {}", unknown)));
    }
    Ok(order)
}

/// Check that the first executions of a schedule form a topological order
pub fn validate_node_ordering(graph: &Graph<Normalized>, schedule: &Schedule) -> Result<()> {
    let order = extract_node_ordering(graph, schedule)?;
    validate_topological_order(graph, &order)
}

/// Check that every step finds its inputs resident and every node runs
pub fn validate_timeline(graph: &Graph<Normalized>, schedule: &Schedule) -> Result<()> {
    replay(graph, schedule).map(|_| ())
}

/// Check that no two buffers that are live at the same time share bytes
pub fn validate_address_allocation(assignment: &AddressAssignment) -> Result<()> {
    let alignment = assignment.alignment.max(1);
    for alloc in &assignment.allocations {
        if alloc.offset % alignment != 0 {
            return Err(Error::Validation(format!(
                "buffer {:?} at offset {} violates alignment {}",
                alloc.buffer, alloc.offset, alignment
            )));
        }
        if alloc.start >= alloc.end {
            return Err(Error::Validation(format!(
                "buffer {:?} has an empty lifetime [{}, {})",
                alloc.buffer, alloc.start, alloc.end
            )));
        }
    }

    // Sweep over time; within a step, frees come before allocations.
    let mut events: Vec<(usize, bool, usize)> = Vec::with_capacity(assignment.allocations.len() * 2);
    for (i, alloc) in assignment.allocations.iter().enumerate() {
        events.push((alloc.start, true, i));
        events.push((alloc.end, false, i));
    }
    events.sort_by_key(|&(time, is_alloc, i)| (time, is_alloc, i));

    let mut live: Vec<usize> = Vec::new();
    for (_, is_alloc, i) in events {
        if !is_alloc {
            live.retain(|&j| j != i);
            continue;
        }
        let a = &assignment.allocations[i];
        for &j in &live {
            let b = &assignment.allocations[j];
            if a.offset < b.offset + b.size && b.offset < a.offset + a.size {
                return Err(Error::Validation(format!(
                    "buffers {:?} and {:?} overlap in address and time",
                    a.buffer, b.buffer
                )));
            }
        }
        live.push(i);
    }

    Ok(())
}

/// Check that every buffer instance resident under `schedule` received an
/// address for exactly its lifetime
pub fn validate_address_coverage(
    graph: &Graph<Normalized>,
    schedule: &Schedule,
    assignment: &AddressAssignment,
) -> Result<()> {
    let replayed = replay(graph, schedule)?;
    let placed: HashMap<BufferId, _> = assignment
        .allocations
        .iter()
        .map(|a| (a.buffer, a))
        .collect();
    if placed.len() != assignment.allocations.len() {
        return Err(Error::Validation("a buffer is assigned more than one address".to_string()));
    }

    for range in &replayed.ranges {
        if range.size == 0 || range.start == range.end {
            continue;
        }
        let alloc = placed.get(&range.buffer).ok_or_else(|| {
            Error::Validation(format!("buffer {:?} has no address", range.buffer))
        })?;
        if alloc.size < range.size || alloc.start != range.start || alloc.end != range.end {
            return Err(Error::Validation(format!(
                "buffer {:?} is placed for [{}, {}) with {} bytes, but lives over [{}, {}) with {} bytes",
                range.buffer, alloc.start, alloc.end, alloc.size, range.start, range.end, range.size
            )));
        }
    }

    Ok(())
}
