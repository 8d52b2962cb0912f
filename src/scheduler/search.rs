use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use fixedbitset::FixedBitSet;
use log::{debug, info};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::error::{Error, Result};
use crate::model::NodeId;
use crate::scheduler::solver::{
    fixed_order_report, relative_gap, Deadline, OrderingModel, OrderingSolver, SolveStatus, SolverReport,
};

/// Graphs up to this many nodes get the ancestor/descendant lower bound
const BITSET_BOUND_LIMIT: usize = 4096;
/// Memory allowed for stored search states
const STATE_MEMORY_BUDGET: usize = 256 << 20;

/// Randomized greedy runs per restart round
const RESTART_BATCH: usize = 8;

/// Flattened view of an ordering model used by the search routines.
///
/// Memory after scheduling a downset X is the total size of data edges
/// produced inside X that still have a consumer outside X, so it only
/// depends on X and not on the order X was executed in.
pub(crate) struct SearchContext {
    pub(crate) n: usize,
    preds: Vec<Vec<usize>>,
    succs: Vec<Vec<usize>>,
    fanout_bytes: Vec<u64>,
    sized_fanin: Vec<Vec<usize>>,
    edge_size: Vec<u64>,
    edge_producer: Vec<usize>,
    edge_sinks: Vec<Vec<usize>>,
}

impl SearchContext {
    pub(crate) fn new(model: &OrderingModel<'_>) -> Self {
        let graph = model.graph();
        let n = graph.num_nodes();
        let preds = model.predecessor_lists();
        let mut succs = vec![Vec::new(); n];
        for (v, list) in preds.iter().enumerate() {
            for &p in list {
                succs[p].push(v);
            }
        }

        let edges = graph.edges();
        let fanout_bytes = graph
            .nodes()
            .iter()
            .map(|node| node.fanout.iter().map(|e| edges[e.0].size).sum())
            .collect();
        let sized_fanin = graph
            .nodes()
            .iter()
            .map(|node| {
                node.fanin
                    .iter()
                    .filter(|e| !edges[e.0].is_control())
                    .map(|e| e.0)
                    .collect()
            })
            .collect();

        Self {
            n,
            preds,
            succs,
            fanout_bytes,
            sized_fanin,
            edge_size: edges.iter().map(|e| e.size).collect(),
            edge_producer: edges.iter().map(|e| e.producer.0).collect(),
            edge_sinks: edges
                .iter()
                .map(|e| e.sinks.iter().map(|s| s.0).collect())
                .collect(),
        }
    }

    fn is_ready(&self, scheduled: &FixedBitSet, v: usize) -> bool {
        !scheduled.contains(v) && self.preds[v].iter().all(|&p| scheduled.contains(p))
    }

    /// Change in resident bytes when `v` runs after `scheduled`
    fn delta(&self, scheduled: &FixedBitSet, v: usize) -> i64 {
        let freed: u64 = self.sized_fanin[v]
            .iter()
            .filter(|&&e| self.edge_sinks[e].iter().all(|&s| s == v || scheduled.contains(s)))
            .map(|&e| self.edge_size[e])
            .sum();
        self.fanout_bytes[v] as i64 - freed as i64
    }

    fn ready_nodes(&self, scheduled: &FixedBitSet) -> Vec<usize> {
        scheduled
            .zeroes()
            .filter(|&v| self.is_ready(scheduled, v))
            .collect()
    }

    /// Run every ready node that does not grow memory, smallest id first,
    /// until none is left. Such a node can always be moved to the front of
    /// any completion without raising its peak.
    fn close(&self, scheduled: &mut FixedBitSet, mem: &mut u64, added: &mut Vec<usize>) {
        let mut ready = self.ready_nodes(scheduled);
        loop {
            let next = ready
                .iter()
                .position(|&v| self.delta(scheduled, v) <= 0);
            let Some(i) = next else {
                break;
            };
            let v = ready.remove(i);
            *mem = apply_delta(*mem, self.delta(scheduled, v));
            scheduled.insert(v);
            added.push(v);
            for &s in &self.succs[v] {
                if self.is_ready(scheduled, s) && !ready.contains(&s) {
                    ready.push(s);
                }
            }
            ready.sort_unstable();
        }
    }

    /// Bound valid for every order: the checkpoint right after a node holds
    /// all edges produced by its ancestors that feed one of its descendants
    pub(crate) fn static_lower_bound(&self) -> u64 {
        let mut bound = (0..self.n)
            .map(|v| {
                let fanin: u64 = self.sized_fanin[v].iter().map(|&e| self.edge_size[e]).sum();
                self.fanout_bytes[v].max(fanin)
            })
            .max()
            .unwrap_or(0);

        if self.n > BITSET_BOUND_LIMIT {
            return bound;
        }
        let Some(topo) = self.topological_order() else {
            return bound;
        };

        let mut ancestors = vec![FixedBitSet::with_capacity(self.n); self.n];
        for &v in &topo {
            ancestors[v].insert(v);
            for &p in &self.preds[v] {
                let (lo, hi) = ancestors.split_at_mut(v.max(p));
                if p < v {
                    hi[0].union_with(&lo[p]);
                } else {
                    lo[v].union_with(&hi[0]);
                }
            }
        }
        let mut descendants = vec![FixedBitSet::with_capacity(self.n); self.n];
        for &v in topo.iter().rev() {
            for &s in &self.succs[v] {
                descendants[v].insert(s);
                let (lo, hi) = descendants.split_at_mut(v.max(s));
                if s < v {
                    hi[0].union_with(&lo[s]);
                } else {
                    lo[v].union_with(&hi[0]);
                }
            }
        }

        for v in 0..self.n {
            let live: u64 = (0..self.edge_size.len())
                .filter(|&e| self.edge_size[e] > 0)
                .filter(|&e| ancestors[v].contains(self.edge_producer[e]))
                .filter(|&e| self.edge_sinks[e].iter().any(|&s| descendants[v].contains(s)))
                .map(|e| self.edge_size[e])
                .sum();
            bound = bound.max(live);
        }
        bound
    }

    fn topological_order(&self) -> Option<Vec<usize>> {
        let mut missing: Vec<usize> = self.preds.iter().map(Vec::len).collect();
        let mut ready: BinaryHeap<Reverse<usize>> =
            (0..self.n).filter(|&v| missing[v] == 0).map(Reverse).collect();
        let mut order = Vec::with_capacity(self.n);
        while let Some(Reverse(v)) = ready.pop() {
            order.push(v);
            for &s in &self.succs[v] {
                missing[s] -= 1;
                if missing[s] == 0 {
                    ready.push(Reverse(s));
                }
            }
        }
        (order.len() == self.n).then_some(order)
    }
}

fn apply_delta(mem: u64, delta: i64) -> u64 {
    (mem as i64 + delta).max(0) as u64
}

/// Incremental schedule state for greedy construction and enumeration
pub(crate) struct Frontier<'c> {
    ctx: &'c SearchContext,
    missing_preds: Vec<usize>,
    pending_sinks: Vec<usize>,
    pub(crate) ready: BTreeSet<usize>,
    pub(crate) order: Vec<usize>,
    pub(crate) mem: u64,
    pub(crate) peak: u64,
}

impl<'c> Frontier<'c> {
    pub(crate) fn new(ctx: &'c SearchContext) -> Self {
        let missing_preds: Vec<usize> = ctx.preds.iter().map(Vec::len).collect();
        let ready = (0..ctx.n).filter(|&v| missing_preds[v] == 0).collect();
        Self {
            ctx,
            missing_preds,
            pending_sinks: ctx.edge_sinks.iter().map(Vec::len).collect(),
            ready,
            order: Vec::with_capacity(ctx.n),
            mem: 0,
            peak: 0,
        }
    }

    pub(crate) fn is_complete(&self) -> bool {
        self.order.len() == self.ctx.n
    }

    pub(crate) fn delta(&self, v: usize) -> i64 {
        let freed: u64 = self.ctx.sized_fanin[v]
            .iter()
            .filter(|&&e| self.pending_sinks[e] == 1)
            .map(|&e| self.ctx.edge_size[e])
            .sum();
        self.ctx.fanout_bytes[v] as i64 - freed as i64
    }

    /// Schedule `v`; returns the previous `(mem, peak)` for [`Frontier::undo`]
    pub(crate) fn push(&mut self, v: usize) -> (u64, u64) {
        let saved = (self.mem, self.peak);
        self.mem = apply_delta(self.mem, self.delta(v));
        self.peak = self.peak.max(self.mem);
        self.ready.remove(&v);
        self.order.push(v);
        for &e in &self.ctx.sized_fanin[v] {
            self.pending_sinks[e] -= 1;
        }
        for &s in &self.ctx.succs[v] {
            self.missing_preds[s] -= 1;
            if self.missing_preds[s] == 0 {
                self.ready.insert(s);
            }
        }
        saved
    }

    /// Revert the last [`Frontier::push`]
    pub(crate) fn undo(&mut self, saved: (u64, u64)) {
        let Some(v) = self.order.pop() else {
            return;
        };
        for &s in &self.ctx.succs[v] {
            if self.missing_preds[s] == 0 {
                self.ready.remove(&s);
            }
            self.missing_preds[s] += 1;
        }
        for &e in &self.ctx.sized_fanin[v] {
            self.pending_sinks[e] += 1;
        }
        self.ready.insert(v);
        self.mem = saved.0;
        self.peak = saved.1;
    }
}

/// Construction rule for a greedy order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GreedyRule {
    /// Smallest ready id; the importer's natural order
    Kahn,
    /// Smallest memory growth
    MinDelta,
    /// Most recently enabled node, finishing chains before starting new ones
    DepthFirst,
    /// Random pick among the `width` smallest growths
    Randomized { seed: u64, width: usize },
}

/// Build one order with `rule`; `None` if the precedences are cyclic
pub(crate) fn greedy_order(ctx: &SearchContext, rule: GreedyRule) -> Option<(Vec<usize>, u64)> {
    let mut frontier = Frontier::new(ctx);
    let mut stack: Vec<usize> = frontier.ready.iter().rev().copied().collect();
    let mut rng = match rule {
        GreedyRule::Randomized { seed, .. } => Some(StdRng::seed_from_u64(seed)),
        _ => None,
    };

    while !frontier.is_complete() {
        if frontier.ready.is_empty() {
            return None;
        }

        let free = match rule {
            GreedyRule::Kahn => None,
            _ => frontier.ready.iter().copied().find(|&v| frontier.delta(v) <= 0),
        };

        let v = match (free, rule) {
            (Some(v), _) => v,
            (None, GreedyRule::Kahn) => *frontier.ready.iter().next()?,
            (None, GreedyRule::MinDelta) => frontier
                .ready
                .iter()
                .copied()
                .min_by_key(|&v| (frontier.delta(v), v))?,
            (None, GreedyRule::DepthFirst) => loop {
                match stack.pop() {
                    Some(v) if frontier.ready.contains(&v) => break v,
                    Some(_) => continue,
                    None => break *frontier.ready.iter().next()?,
                }
            },
            (None, GreedyRule::Randomized { width, .. }) => {
                let mut candidates: Vec<(i64, usize)> = frontier
                    .ready
                    .iter()
                    .map(|&v| (frontier.delta(v), v))
                    .collect();
                candidates.sort_unstable();
                candidates.truncate(width.max(1));
                let pick = match rng.as_mut() {
                    Some(rng) => rng.gen_range(0..candidates.len()),
                    None => 0,
                };
                candidates[pick].1
            }
        };

        let before: Vec<usize> = if rule == GreedyRule::DepthFirst {
            frontier.ready.iter().copied().collect()
        } else {
            Vec::new()
        };
        frontier.push(v);
        if rule == GreedyRule::DepthFirst {
            let mut enabled: Vec<usize> = frontier
                .ready
                .iter()
                .copied()
                .filter(|s| !before.contains(s))
                .collect();
            enabled.sort_unstable_by(|a, b| b.cmp(a));
            stack.extend(enabled);
        }
    }

    Some((frontier.order, frontier.peak))
}

struct SearchState {
    set: FixedBitSet,
    mem: u64,
    bottleneck: u64,
    size: usize,
    parent: usize,
    added: Vec<usize>,
}

struct ExactOutcome {
    improved: Option<(Vec<usize>, u64)>,
    lower_bound: u64,
    proven: bool,
    stopped_by_deadline: bool,
    explored: usize,
}

/// Exact peak-memory ordering search with anytime fallback.
///
/// Runs a portfolio of greedy constructions for an initial upper bound, then
/// a best-first search over downsets ordered by the highest checkpoint on
/// the path so far (a bottleneck shortest path). The first complete downset
/// popped is optimal. When the state budget runs out, the remaining time is
/// spent on randomized greedy restarts.
pub struct BottleneckSearch {
    max_states: usize,
    max_restarts: usize,
    seed: u64,
    report_progress: bool,
}

impl Default for BottleneckSearch {
    fn default() -> Self {
        Self {
            max_states: 200_000,
            max_restarts: 64,
            seed: 0,
            report_progress: false,
        }
    }
}

impl BottleneckSearch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_states(mut self, max_states: usize) -> Self {
        self.max_states = max_states;
        self
    }

    pub fn with_max_restarts(mut self, max_restarts: usize) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_progress(mut self, report_progress: bool) -> Self {
        self.report_progress = report_progress;
        self
    }

    fn portfolio(&self, ctx: &SearchContext, seeds: &[u64]) -> Option<(Vec<usize>, u64)> {
        let mut rules = vec![GreedyRule::MinDelta, GreedyRule::DepthFirst, GreedyRule::Kahn];
        rules.extend(seeds.iter().map(|&seed| GreedyRule::Randomized { seed, width: 3 }));
        rules
            .into_par_iter()
            .filter_map(|rule| greedy_order(ctx, rule))
            .min_by_key(|(_, peak)| *peak)
    }

    fn best_first(
        &self,
        ctx: &SearchContext,
        incumbent: u64,
        static_bound: u64,
        rel_stop: f64,
        deadline: &Deadline,
    ) -> ExactOutcome {
        let per_state = 2 * (ctx.n / 8 + 32) + 64;
        let max_states = self.max_states.min(STATE_MEMORY_BUDGET / per_state).max(1);

        let mut root = SearchState {
            set: FixedBitSet::with_capacity(ctx.n),
            mem: 0,
            bottleneck: 0,
            size: 0,
            parent: usize::MAX,
            added: Vec::new(),
        };
        ctx.close(&mut root.set, &mut root.mem, &mut root.added);
        root.size = root.added.len();

        let mut index: HashMap<FixedBitSet, usize> = HashMap::new();
        index.insert(root.set.clone(), 0);
        let mut states = vec![root];
        let mut heap = BinaryHeap::new();
        heap.push(Reverse((0u64, Reverse(states[0].size), 0usize)));

        let mut outcome = ExactOutcome {
            improved: None,
            lower_bound: static_bound.min(incumbent),
            proven: false,
            stopped_by_deadline: false,
            explored: 0,
        };

        while let Some(Reverse((bottleneck, _, id))) = heap.pop() {
            if bottleneck > states[id].bottleneck {
                continue;
            }
            if bottleneck >= incumbent {
                break;
            }
            outcome.lower_bound = outcome.lower_bound.max(bottleneck).min(incumbent);

            if states[id].size == ctx.n {
                let mut order = Vec::with_capacity(ctx.n);
                let mut cursor = id;
                while cursor != usize::MAX {
                    order.extend(states[cursor].added.iter().rev());
                    cursor = states[cursor].parent;
                }
                order.reverse();
                outcome.improved = Some((order, bottleneck));
                outcome.lower_bound = bottleneck;
                outcome.proven = true;
                return outcome;
            }

            if relative_gap(incumbent, outcome.lower_bound) <= rel_stop {
                return outcome;
            }
            if deadline.expired() {
                outcome.stopped_by_deadline = true;
                return outcome;
            }
            if states.len() >= max_states {
                return outcome;
            }

            outcome.explored += 1;
            if self.report_progress && outcome.explored % 10_000 == 0 {
                info!(
                    "search: {} states expanded, {} stored, bounds [{}, {}]",
                    outcome.explored,
                    states.len(),
                    outcome.lower_bound,
                    incumbent
                );
            }

            let (set, mem) = (states[id].set.clone(), states[id].mem);
            for v in ctx.ready_nodes(&set) {
                let after = apply_delta(mem, ctx.delta(&set, v));
                let next_bottleneck = bottleneck.max(after);
                if next_bottleneck >= incumbent {
                    continue;
                }

                let mut next = set.clone();
                next.insert(v);
                let mut next_mem = after;
                let mut added = vec![v];
                ctx.close(&mut next, &mut next_mem, &mut added);
                let size = states[id].size + added.len();

                match index.get(&next).copied() {
                    Some(existing) if states[existing].bottleneck <= next_bottleneck => {}
                    Some(existing) => {
                        let state = &mut states[existing];
                        state.bottleneck = next_bottleneck;
                        state.parent = id;
                        state.added = added;
                        heap.push(Reverse((next_bottleneck, Reverse(size), existing)));
                    }
                    None => {
                        let new_id = states.len();
                        index.insert(next.clone(), new_id);
                        states.push(SearchState {
                            set: next,
                            mem: next_mem,
                            bottleneck: next_bottleneck,
                            size,
                            parent: id,
                            added,
                        });
                        heap.push(Reverse((next_bottleneck, Reverse(size), new_id)));
                    }
                }
            }
        }

        // Every path below the incumbent was refuted.
        outcome.lower_bound = incumbent;
        outcome.proven = true;
        outcome
    }
}

impl OrderingSolver for BottleneckSearch {
    fn name(&self) -> &str {
        "bottleneck-search"
    }

    fn solve(&self, model: &OrderingModel<'_>, deadline: &Deadline) -> Result<SolverReport> {
        if let Some(report) = fixed_order_report(model)? {
            return Ok(report);
        }

        let ctx = SearchContext::new(model);
        let rel_stop = model.rel_stop();
        let mut rng = StdRng::seed_from_u64(self.seed);
        let batch = RESTART_BATCH;
        let seeds: Vec<u64> = (0..batch).map(|_| rng.gen()).collect();

        let (mut best_order, mut best_peak) = self.portfolio(&ctx, &seeds).ok_or_else(|| {
            Error::InvalidConfiguration("Ordering constraints contain a cycle".to_string())
        })?;
        let static_bound = ctx.static_lower_bound().min(best_peak);
        debug!(
            "greedy portfolio peak {} bytes, static lower bound {} bytes",
            best_peak, static_bound
        );

        let mut lower_bound = static_bound;
        let mut explored = 0;
        let mut proven = best_peak <= lower_bound;
        let mut stopped_by_deadline = false;

        if !proven && relative_gap(best_peak, lower_bound) > rel_stop {
            let outcome = self.best_first(&ctx, best_peak, static_bound, rel_stop, deadline);
            explored = outcome.explored;
            lower_bound = outcome.lower_bound;
            proven = outcome.proven;
            stopped_by_deadline = outcome.stopped_by_deadline;
            if let Some((order, peak)) = outcome.improved {
                best_order = order;
                best_peak = peak;
            }
        }

        let mut rounds = 0;
        while !proven
            && !stopped_by_deadline
            && relative_gap(best_peak, lower_bound) > rel_stop
            && rounds < self.max_restarts
            && !deadline.expired()
        {
            rounds += 1;
            let seeds: Vec<u64> = (0..batch).map(|_| rng.gen()).collect();
            let candidate = seeds
                .into_par_iter()
                .enumerate()
                .filter_map(|(i, seed)| greedy_order(&ctx, GreedyRule::Randomized { seed, width: 2 + i % 4 }))
                .min_by_key(|(_, peak)| *peak);
            if let Some((order, peak)) = candidate {
                if peak < best_peak {
                    best_order = order;
                    best_peak = peak;
                }
            }
        }

        let lower_bound = lower_bound.min(best_peak);
        let status = if proven || best_peak <= lower_bound {
            SolveStatus::Optimal
        } else if relative_gap(best_peak, lower_bound) <= rel_stop {
            SolveStatus::WithinTolerance
        } else if stopped_by_deadline || deadline.expired() {
            SolveStatus::TimedOut
        } else {
            SolveStatus::Unproven
        };

        let order: Vec<NodeId> = best_order.into_iter().map(NodeId).collect();
        let peak = model.evaluate(&order)?;
        if peak != best_peak {
            return Err(Error::Validation(format!(
                "search tracked a peak of {} bytes but the order peaks at {}",
                best_peak, peak
            )));
        }

        debug!(
            "{}: peak {} bytes, lower bound {}, {} states, {} restart rounds, {}",
            self.name(),
            peak,
            lower_bound,
            explored,
            rounds,
            status
        );

        Ok(SolverReport {
            order,
            peak,
            lower_bound,
            status,
            explored,
        })
    }
}
