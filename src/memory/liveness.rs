use serde::{Deserialize, Serialize};

use crate::model::{EdgeId, Graph, Normalized, NodeId};

/// One resident instance of an edge. An edge spilled and restored, or
/// discarded and recomputed, gets a new instance each time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId {
    pub edge: EdgeId,
    pub instance: u32,
}

/// Half-open interval of steps `[start, end)` during which a buffer is
/// counted as resident
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveRange {
    pub buffer: BufferId,
    pub size: u64,
    pub start: usize,
    pub end: usize,
}

impl LiveRange {
    pub fn overlaps(&self, other: &LiveRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn duration(&self) -> usize {
        self.end.saturating_sub(self.start)
    }
}

/// Round `value` up to a multiple of `alignment` (a power of two)
pub fn align_up(value: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return value;
    }
    (value + alignment - 1) & !(alignment - 1)
}

/// Live ranges of every data edge under a plain execution order.
///
/// `order` must be a valid topological order of `graph`.
pub fn live_ranges(graph: &Graph<Normalized>, order: &[NodeId]) -> Vec<LiveRange> {
    let mut position = vec![0usize; graph.num_nodes()];
    for (i, node) in order.iter().enumerate() {
        position[node.0] = i;
    }

    let mut ranges: Vec<LiveRange> = graph
        .edges()
        .iter()
        .filter(|e| !e.is_control())
        .filter_map(|e| {
            let start = position[e.producer.0];
            let end = e.sinks.iter().map(|s| position[s.0]).max()?;
            Some(LiveRange {
                buffer: BufferId { edge: e.id, instance: 0 },
                size: e.size,
                start,
                end,
            })
        })
        .filter(|r| r.end > r.start)
        .collect();
    ranges.sort_by_key(|r| (r.start, r.buffer));
    ranges
}

/// Maximum over time of the summed sizes of live ranges
pub fn max_load(ranges: &[LiveRange]) -> u64 {
    let mut events: Vec<(usize, i128)> = Vec::with_capacity(ranges.len() * 2);
    for range in ranges {
        events.push((range.start, range.size as i128));
        events.push((range.end, -(range.size as i128)));
    }
    // Ends sort before starts at the same step.
    events.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));

    let mut load: i128 = 0;
    let mut peak: i128 = 0;
    for (_, delta) in events {
        load += delta;
        peak = peak.max(load);
    }
    peak as u64
}
