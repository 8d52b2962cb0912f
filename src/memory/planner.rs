use std::cmp;

use log::debug;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter};

use crate::memory::liveness::{align_up, max_load, BufferId, LiveRange};
use crate::scheduler::solver::{relative_gap, Deadline, SolveStatus};

/// Address placement of one buffer instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferAllocation {
    pub buffer: BufferId,
    /// Byte offset in the arena
    pub offset: u64,
    /// Size in bytes
    pub size: u64,
    /// First step the buffer is resident
    pub start: usize,
    /// First step the buffer is no longer resident
    pub end: usize,
}

/// Address layout of every buffer in a plan
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddressAssignment {
    pub allocations: Vec<BufferAllocation>,
    pub alignment: u64,
}

impl AddressAssignment {
    /// Arena size needed by the layout
    pub fn extent(&self) -> u64 {
        self.allocations
            .iter()
            .map(|a| a.offset + a.size)
            .max()
            .unwrap_or(0)
    }

    pub fn get(&self, buffer: BufferId) -> Option<&BufferAllocation> {
        self.allocations.iter().find(|a| a.buffer == buffer)
    }

    pub fn len(&self) -> usize {
        self.allocations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty()
    }
}

/// Order in which buffers are handed to the first-fit packer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, EnumIter)]
pub enum PlacementOrder {
    ByStart,
    BySizeDescending,
    ByLifetimeDescending,
    ByAreaDescending,
}

impl PlacementOrder {
    fn arrange(self, ranges: &[LiveRange]) -> Vec<usize> {
        let mut order: Vec<usize> = (0..ranges.len()).collect();
        match self {
            PlacementOrder::ByStart => order.sort_by_key(|&i| (ranges[i].start, ranges[i].buffer)),
            PlacementOrder::BySizeDescending => {
                order.sort_by_key(|&i| (cmp::Reverse(ranges[i].size), ranges[i].start))
            }
            PlacementOrder::ByLifetimeDescending => order.sort_by_key(|&i| {
                (cmp::Reverse(ranges[i].duration()), cmp::Reverse(ranges[i].size))
            }),
            PlacementOrder::ByAreaDescending => order.sort_by_key(|&i| {
                cmp::Reverse(ranges[i].size as u128 * ranges[i].duration() as u128)
            }),
        }
        order
    }
}

/// Outcome of [`AddressPlanner::pack`]
#[derive(Debug, Clone)]
pub struct PackingReport {
    pub assignment: AddressAssignment,
    /// Largest total size of simultaneously live buffers
    pub lower_bound: u64,
    pub status: SolveStatus,
    pub iterations: usize,
}

impl PackingReport {
    pub fn gap(&self) -> f64 {
        relative_gap(self.assignment.extent(), self.lower_bound)
    }
}

/// Assigns arena offsets to buffers so that buffers live at the same time
/// never share bytes
pub struct AddressPlanner {
    alignment: u64,
    seed: u64,
    max_iterations: usize,
}

impl AddressPlanner {
    pub fn new(alignment: u64) -> Self {
        Self {
            alignment: alignment.max(1),
            seed: 0,
            max_iterations: 20_000,
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    /// Place buffers one by one at the lowest aligned offset that does not
    /// collide with an already placed buffer of overlapping lifetime
    pub fn first_fit(&self, ranges: &[LiveRange], order: &[usize]) -> AddressAssignment {
        let mut placed: Vec<BufferAllocation> = Vec::with_capacity(order.len());

        for &i in order {
            let range = &ranges[i];
            let mut busy: Vec<(u64, u64)> = placed
                .iter()
                .filter(|p| p.start < range.end && range.start < p.end)
                .map(|p| (p.offset, p.offset + p.size))
                .collect();
            busy.sort_unstable();

            let mut offset = 0;
            for (lo, hi) in busy {
                if align_up(offset, self.alignment) + range.size <= lo {
                    break;
                }
                offset = cmp::max(offset, hi);
            }

            placed.push(BufferAllocation {
                buffer: range.buffer,
                offset: align_up(offset, self.alignment),
                size: range.size,
                start: range.start,
                end: range.end,
            });
        }

        placed.sort_by_key(|a| (a.start, a.buffer));
        AddressAssignment {
            allocations: placed,
            alignment: self.alignment,
        }
    }

    /// Single first-fit pass in order of first use
    pub fn pack_simple(&self, ranges: &[LiveRange]) -> AddressAssignment {
        self.first_fit(ranges, &PlacementOrder::ByStart.arrange(ranges))
    }

    /// Search for a compact layout until the extent reaches the lower bound,
    /// the relative gap drops below `rel_stop`, or time runs out
    pub fn pack(&self, ranges: &[LiveRange], rel_stop: f64, deadline: &Deadline) -> PackingReport {
        let lower_bound = max_load(ranges);

        let (mut best_order, mut best) = PlacementOrder::iter()
            .collect::<Vec<_>>()
            .into_par_iter()
            .map(|heuristic| {
                let order = heuristic.arrange(ranges);
                let assignment = self.first_fit(ranges, &order);
                (order, assignment)
            })
            .min_by_key(|(_, a)| a.extent())
            .unwrap_or_else(|| (Vec::new(), AddressAssignment { allocations: Vec::new(), alignment: self.alignment }));

        let mut rng = StdRng::seed_from_u64(self.seed);
        let mut iterations = 0;
        let status = loop {
            let extent = best.extent();
            if extent <= lower_bound {
                break SolveStatus::Optimal;
            }
            if relative_gap(extent, lower_bound) <= rel_stop {
                break SolveStatus::WithinTolerance;
            }
            if deadline.expired() {
                break SolveStatus::TimedOut;
            }
            if iterations >= self.max_iterations || best_order.len() < 2 {
                break SolveStatus::Unproven;
            }
            iterations += 1;

            let mut candidate = best_order.clone();
            let i = rng.gen_range(0..candidate.len());
            let j = rng.gen_range(0..candidate.len());
            if rng.gen_bool(0.5) {
                candidate.swap(i, j);
            } else {
                let moved = candidate.remove(i);
                candidate.insert(j, moved);
            }

            let assignment = self.first_fit(ranges, &candidate);
            if assignment.extent() <= extent {
                best_order = candidate;
                best = assignment;
            }
        };

        debug!(
            "packed {} buffers into {} bytes (lower bound {}, {} iterations, {})",
            ranges.len(),
            best.extent(),
            lower_bound,
            iterations,
            status
        );

        PackingReport {
            assignment: best,
            lower_bound,
            status,
            iterations,
        }
    }
}
