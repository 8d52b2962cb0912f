use std::collections::BTreeSet;

use log::trace;
use rayon::prelude::*;

use crate::model::{Graph, Normalized, NodeId};
use crate::schedule::ScheduleStep;
use crate::scheduler::options::{CostModel, Mitigations};
use crate::scheduler::solver::{Deadline, SolveStatus};

/// Recompute chains deeper than this are treated as infeasible
const MAX_RECOMPUTE_DEPTH: usize = 1024;

/// Base-order steps between two deadline checks
const DEADLINE_STRIDE: usize = 64;

/// How a victim is chosen when memory has to be freed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EvictionPolicy {
    /// Buffer whose next use is furthest away
    FarthestNextUse,
    /// Buffer that is cheapest to bring back, per byte
    CheapestPerByte,
}

impl EvictionPolicy {
    pub(crate) const ALL: [EvictionPolicy; 2] =
        [EvictionPolicy::FarthestNextUse, EvictionPolicy::CheapestPerByte];
}

/// One way of walking a base order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Strategy {
    pub policy: EvictionPolicy,
    /// Keep the inputs of a recomputable node resident while its outputs
    /// are alive, so those outputs can later be discarded
    pub retain_inputs: bool,
}

impl Strategy {
    pub(crate) fn new(policy: EvictionPolicy) -> Self {
        Self {
            policy,
            retain_inputs: false,
        }
    }

    pub(crate) fn retaining(mut self) -> Self {
        self.retain_inputs = true;
        self
    }
}

/// A plan that keeps resident memory within a budget
#[derive(Debug, Clone, Default)]
pub(crate) struct MitigatedPlan {
    pub steps: Vec<ScheduleStep>,
    pub max_live: u64,
    pub recompute_time: f64,
    pub transfer_time: f64,
    pub bytes_swapped: u64,
    pub spill_outs: usize,
}

impl MitigatedPlan {
    /// Added execution time in seconds
    pub fn overhead(&self) -> f64 {
        self.recompute_time + self.transfer_time
    }
}

/// Smallest budget found for a mitigation mix
#[derive(Debug, Clone)]
pub(crate) struct Floor {
    pub budget: u64,
    pub plan: MitigatedPlan,
    /// `Optimal` when the budget meets the trivial bound, `TimedOut` when
    /// the bisection was cut short
    pub status: SolveStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Absent,
    Resident,
    Spilled,
    /// Evicted; will be recomputed from its producer
    Discarded,
    /// No longer needed
    Gone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eviction {
    Discard,
    Spill,
    /// Free a buffer that was only retained for a possible recomputation
    Release,
}

/// Walks a base order, evicting buffers when the next step would not fit.
///
/// A missing input is restored before its reader runs: spilled buffers are
/// copied back, discarded ones are recomputed from their producer (which may
/// in turn restore its own inputs). A buffer is released as soon as no later
/// step of the base order and no pending recomputation reads it. Discarding
/// a buffer holds its producer's inputs until the buffer is recomputed, and
/// a buffer is only discarded when those inputs can still be brought back.
pub(crate) struct BudgetPlanner<'g> {
    graph: &'g Graph<Normalized>,
    cost: CostModel,
    mitigations: Mitigations,
}

impl<'g> BudgetPlanner<'g> {
    pub(crate) fn new(graph: &'g Graph<Normalized>, cost: CostModel, mitigations: Mitigations) -> Self {
        Self {
            graph,
            cost,
            mitigations,
        }
    }

    /// Plan `order` within `budget` bytes; `None` if no victim can be found
    pub(crate) fn plan(&self, order: &[NodeId], budget: u64, strategy: Strategy) -> Option<MitigatedPlan> {
        self.plan_until(order, budget, strategy, None)
    }

    fn plan_until(
        &self,
        order: &[NodeId],
        budget: u64,
        strategy: Strategy,
        deadline: Option<&Deadline>,
    ) -> Option<MitigatedPlan> {
        let edges = self.graph.edges();
        let mut uses = vec![Vec::new(); edges.len()];
        for (pos, node) in order.iter().enumerate() {
            for e in &self.graph.nodes()[node.0].fanin {
                if !edges[e.0].is_control() {
                    uses[e.0].push(pos);
                }
            }
        }

        let mut run = Run {
            graph: self.graph,
            cost: self.cost,
            mitigations: self.mitigations,
            strategy,
            budget,
            uses,
            cursor: 0,
            slots: vec![Slot::Absent; edges.len()],
            pins: vec![0; edges.len()],
            hard: vec![0; edges.len()],
            soft: vec![0; edges.len()],
            holds_inputs: vec![false; edges.len()],
            resident: BTreeSet::new(),
            usage: 0,
            max_steps: 16 * (order.len() + edges.len()) + 1024,
            plan: MitigatedPlan::default(),
        };

        for (pos, &node) in order.iter().enumerate() {
            if pos % DEADLINE_STRIDE == 0 && deadline.is_some_and(Deadline::expired) {
                return None;
            }
            run.cursor = pos;
            run.execute(node, false, 0)?;
        }
        trace!(
            "{:?} plan within {} bytes: {} steps, peak {}",
            strategy,
            budget,
            run.plan.steps.len(),
            run.plan.max_live
        );
        Some(run.plan)
    }

    fn strategies(&self) -> Vec<Strategy> {
        let mut strategies: Vec<Strategy> = EvictionPolicy::ALL.into_iter().map(Strategy::new).collect();
        if self.mitigations.rematerialize {
            strategies.extend(EvictionPolicy::ALL.into_iter().map(|p| Strategy::new(p).retaining()));
        }
        strategies
    }

    /// Cheapest plan over every base order and strategy. Combinations that
    /// start after `deadline` are skipped.
    pub(crate) fn best_plan(
        &self,
        orders: &[&[NodeId]],
        budget: u64,
        deadline: Option<&Deadline>,
    ) -> Option<MitigatedPlan> {
        let strategies = self.strategies();
        let combos: Vec<(usize, Strategy)> = (0..orders.len())
            .flat_map(|i| strategies.iter().map(move |&s| (i, s)))
            .collect();
        combos
            .into_par_iter()
            .filter(|_| !deadline.is_some_and(Deadline::expired))
            .filter_map(|(i, strategy)| self.plan_until(orders[i], budget, strategy, deadline))
            .min_by(|a, b| a.overhead().total_cmp(&b.overhead()))
    }

    /// Smallest budget (by bisection) for which some plan exists, with
    /// that plan. `upper` must be feasible without any eviction. When
    /// `deadline` passes, the smallest feasible budget seen so far is
    /// returned with `SolveStatus::TimedOut`.
    pub(crate) fn floor(&self, orders: &[&[NodeId]], upper: u64, deadline: &Deadline) -> Option<Floor> {
        let mut hi = upper;
        let mut hi_plan = self.best_plan(orders, hi, None)?;
        if !self.mitigations.any() {
            return Some(Floor {
                budget: hi,
                plan: hi_plan,
                status: SolveStatus::Optimal,
            });
        }

        let timed_out = |budget, plan| Floor {
            budget,
            plan,
            status: SolveStatus::TimedOut,
        };
        let mut lo = self.trivial_bound().min(hi);
        if deadline.expired() {
            return Some(timed_out(hi, hi_plan));
        }
        match self.best_plan(orders, lo, Some(deadline)) {
            Some(plan) => {
                return Some(Floor {
                    budget: lo,
                    plan,
                    status: SolveStatus::Optimal,
                })
            }
            None if deadline.expired() => return Some(timed_out(hi, hi_plan)),
            None => {}
        }
        // Invariant: `lo` infeasible, `hi` feasible.
        while hi - lo > 1 {
            let mid = lo + (hi - lo) / 2;
            match self.best_plan(orders, mid, Some(deadline)) {
                Some(plan) => {
                    hi = mid;
                    hi_plan = plan;
                }
                // An interrupted portfolio proves nothing about `mid`.
                None if deadline.expired() => return Some(timed_out(hi, hi_plan)),
                None => lo = mid,
            }
        }
        Some(Floor {
            budget: hi,
            plan: hi_plan,
            status: SolveStatus::Unproven,
        })
    }

    /// No plan fits below the inputs or the outputs of any single node
    pub(crate) fn trivial_bound(&self) -> u64 {
        let edges = self.graph.edges();
        self.graph
            .nodes()
            .iter()
            .map(|node| {
                let fanin: u64 = node.fanin.iter().map(|e| edges[e.0].size).sum();
                let fanout: u64 = node.fanout.iter().map(|e| edges[e.0].size).sum();
                fanin.max(fanout)
            })
            .max()
            .unwrap_or(0)
    }
}

struct Run<'g> {
    graph: &'g Graph<Normalized>,
    cost: CostModel,
    mitigations: Mitigations,
    strategy: Strategy,
    budget: u64,
    /// Base-order positions reading each edge
    uses: Vec<Vec<usize>>,
    cursor: usize,
    slots: Vec<Slot>,
    /// Reads by the node being executed
    pins: Vec<u32>,
    /// Discarded outputs that will be recomputed from this buffer
    hard: Vec<u32>,
    /// Live outputs that could be recomputed from this buffer
    soft: Vec<u32>,
    /// Whether a live buffer counts towards `soft` of its producer's inputs
    holds_inputs: Vec<bool>,
    resident: BTreeSet<usize>,
    usage: u64,
    max_steps: usize,
    plan: MitigatedPlan,
}

impl<'g> Run<'g> {
    fn size(&self, e: usize) -> u64 {
        self.graph.edges()[e].size
    }

    fn data_inputs(&self, v: NodeId) -> Vec<usize> {
        let edges = self.graph.edges();
        self.graph.nodes()[v.0]
            .fanin
            .iter()
            .filter(|e| !edges[e.0].is_control())
            .map(|e| e.0)
            .collect()
    }

    /// Inputs a recomputation of `e` reads
    fn recompute_inputs(&self, e: usize) -> Vec<usize> {
        self.data_inputs(self.graph.edges()[e].producer)
    }

    fn next_use_from(&self, e: usize, from: usize) -> Option<usize> {
        let uses = &self.uses[e];
        uses.get(uses.partition_point(|&p| p < from)).copied()
    }

    /// Read again by the base order or by a pending recomputation
    fn required_from(&self, e: usize, from: usize) -> bool {
        self.pins[e] > 0 || self.hard[e] > 0 || self.next_use_from(e, from).is_some()
    }

    fn needed_from(&self, e: usize, from: usize) -> bool {
        self.soft[e] > 0 || self.required_from(e, from)
    }

    fn retains_inputs_of(&self, v: NodeId) -> bool {
        self.strategy.retain_inputs
            && self.mitigations.rematerialize
            && self.graph.nodes()[v.0].kind.is_rematerializable()
    }

    fn push_step(&mut self, step: ScheduleStep) -> Option<()> {
        if self.plan.steps.len() >= self.max_steps {
            return None;
        }
        self.plan.steps.push(step);
        Some(())
    }

    fn allocate(&mut self, e: usize) {
        self.usage += self.size(e);
        self.slots[e] = Slot::Resident;
        self.resident.insert(e);
    }

    fn release(&mut self, e: usize, slot: Slot) {
        self.usage -= self.size(e);
        self.slots[e] = slot;
        self.resident.remove(&e);
    }

    /// Free `e` for good, along with retained inputs nothing needs anymore
    fn drop_buffer(&mut self, e: usize, from: usize) {
        let mut stack = vec![e];
        while let Some(e) = stack.pop() {
            self.release(e, Slot::Gone);
            if !std::mem::take(&mut self.holds_inputs[e]) {
                continue;
            }
            for i in self.recompute_inputs(e) {
                self.soft[i] -= 1;
                if self.slots[i] == Slot::Resident && !self.needed_from(i, from) {
                    stack.push(i);
                }
            }
        }
    }

    fn record_usage(&mut self) {
        self.plan.max_live = self.plan.max_live.max(self.usage);
    }

    /// Execute `v`, restoring its inputs first. Recomputations run while the
    /// base-order node at `cursor` is being prepared, so that node's reads
    /// still count as future uses.
    fn execute(&mut self, v: NodeId, recompute: bool, depth: usize) -> Option<()> {
        if depth > MAX_RECOMPUTE_DEPTH {
            return None;
        }
        let graph = self.graph;
        let node = &graph.nodes()[v.0];
        let edges = graph.edges();

        let inputs = self.data_inputs(v);
        for &e in &inputs {
            self.pins[e] += 1;
        }
        for &e in &inputs {
            self.ensure(e, depth)?;
        }

        let after = if recompute { self.cursor } else { self.cursor + 1 };
        let outputs: Vec<usize> = node
            .fanout
            .iter()
            .map(|e| e.0)
            .filter(|&e| !edges[e].is_control() && self.slots[e] != Slot::Resident)
            .filter(|&e| self.required_from(e, after))
            .collect();
        let restored = outputs.iter().filter(|&&e| self.slots[e] == Slot::Discarded).count() as u32;
        let retained = if self.retains_inputs_of(v) {
            outputs.len() as u32
        } else {
            0
        };

        let allocated: u64 = outputs.iter().map(|&e| self.size(e)).sum();
        let freed: u64 = inputs
            .iter()
            .filter(|&&e| {
                self.pins[e] == 1
                    && self.next_use_from(e, after).is_none()
                    && self.hard[e] == restored
                    && self.soft[e] + retained == 0
            })
            .map(|&e| self.size(e))
            .sum();
        if allocated > freed {
            self.make_room(allocated - freed)?;
        }

        self.push_step(if recompute {
            ScheduleStep::Recompute(v)
        } else {
            ScheduleStep::Compute(v)
        })?;
        if recompute {
            self.plan.recompute_time += self.cost.recompute_time(node.runtime());
        }

        for &e in &outputs {
            if self.slots[e] == Slot::Discarded {
                for &i in &inputs {
                    self.hard[i] -= 1;
                }
            }
            self.allocate(e);
            if retained > 0 && !self.holds_inputs[e] {
                self.holds_inputs[e] = true;
                for &i in &inputs {
                    self.soft[i] += 1;
                }
            }
        }
        for &e in &inputs {
            self.pins[e] -= 1;
            if self.slots[e] == Slot::Resident && !self.needed_from(e, after) {
                self.drop_buffer(e, after);
            }
        }
        self.record_usage();
        Some(())
    }

    /// Make the pinned input `e` resident
    fn ensure(&mut self, e: usize, depth: usize) -> Option<()> {
        match self.slots[e] {
            Slot::Resident => Some(()),
            Slot::Spilled => {
                let size = self.size(e);
                self.make_room(size)?;
                self.push_step(ScheduleStep::SpillIn(self.graph.edges()[e].id))?;
                self.plan.bytes_swapped += size;
                self.plan.transfer_time += self.cost.transfer_time(size);
                self.allocate(e);
                self.record_usage();
                Some(())
            }
            Slot::Discarded => {
                self.execute(self.graph.edges()[e].producer, true, depth + 1)?;
                (self.slots[e] == Slot::Resident).then_some(())
            }
            Slot::Absent | Slot::Gone => None,
        }
    }

    fn spill_allowed(&self) -> bool {
        self.mitigations.spill
            && self
                .mitigations
                .max_spills
                .map_or(true, |cap| self.plan.spill_outs < cap)
    }

    /// Every input of the producer is resident or can be brought back
    fn recomputable(&self, e: usize) -> bool {
        self.mitigations.rematerialize
            && self.graph.nodes()[self.graph.edges()[e].producer.0].kind.is_rematerializable()
            && self
                .recompute_inputs(e)
                .into_iter()
                .all(|i| matches!(self.slots[i], Slot::Resident | Slot::Spilled | Slot::Discarded))
    }

    fn eviction_for(&self, e: usize) -> Option<(Eviction, f64)> {
        let edge = &self.graph.edges()[e];
        let discard = self.recomputable(e).then(|| {
            let runtime = self.graph.nodes()[edge.producer.0].runtime();
            (Eviction::Discard, self.cost.recompute_time(runtime))
        });
        let spill = self
            .spill_allowed()
            .then(|| (Eviction::Spill, 2.0 * self.cost.transfer_time(edge.size)));
        match (discard, spill) {
            (Some(d), Some(s)) => Some(if d.1 <= s.1 { d } else { s }),
            (d, s) => d.or(s),
        }
    }

    fn unpinned(&self) -> impl Iterator<Item = usize> + '_ {
        self.resident
            .iter()
            .copied()
            .filter(move |&e| self.pins[e] == 0 && self.size(e) > 0)
    }

    fn choose_victim(&self) -> Option<(usize, Eviction)> {
        let candidates = self
            .unpinned()
            .filter(|&e| self.required_from(e, self.cursor))
            .filter_map(|e| self.eviction_for(e).map(|(action, cost)| (e, action, cost)));

        let next_use = |e: usize| self.next_use_from(e, self.cursor).unwrap_or(usize::MAX);
        let chosen = match self.strategy.policy {
            EvictionPolicy::FarthestNextUse => candidates.max_by(|a, b| {
                (next_use(a.0), self.size(a.0), std::cmp::Reverse(a.0))
                    .cmp(&(next_use(b.0), self.size(b.0), std::cmp::Reverse(b.0)))
            }),
            EvictionPolicy::CheapestPerByte => candidates.min_by(|a, b| {
                let ca = a.2 / self.size(a.0) as f64;
                let cb = b.2 / self.size(b.0) as f64;
                ca.total_cmp(&cb)
                    .then_with(|| next_use(b.0).cmp(&next_use(a.0)))
                    .then_with(|| a.0.cmp(&b.0))
            }),
        };
        if let Some((e, action, _)) = chosen {
            return Some((e, action));
        }

        // Last resort: give up a retained input, making its dependants
        // impossible to discard.
        self.unpinned()
            .filter(|&e| !self.required_from(e, self.cursor))
            .max_by(|&a, &b| (self.size(a), std::cmp::Reverse(a)).cmp(&(self.size(b), std::cmp::Reverse(b))))
            .map(|e| (e, Eviction::Release))
    }

    /// Evict until `extra` more bytes fit in the budget
    fn make_room(&mut self, extra: u64) -> Option<()> {
        while self.usage + extra > self.budget {
            let (e, action) = self.choose_victim()?;
            let id = self.graph.edges()[e].id;
            let size = self.size(e);
            match action {
                Eviction::Discard => {
                    self.push_step(ScheduleStep::Discard(id))?;
                    self.release(e, Slot::Discarded);
                    let held = std::mem::take(&mut self.holds_inputs[e]);
                    for i in self.recompute_inputs(e) {
                        self.hard[i] += 1;
                        if held {
                            self.soft[i] -= 1;
                        }
                    }
                }
                Eviction::Spill => {
                    self.push_step(ScheduleStep::SpillOut(id))?;
                    self.release(e, Slot::Spilled);
                    self.plan.bytes_swapped += size;
                    self.plan.transfer_time += self.cost.transfer_time(size);
                    self.plan.spill_outs += 1;
                }
                Eviction::Release => self.drop_buffer(e, self.cursor),
            }
        }
        Some(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::model::{GraphMode, OpKind};
    use crate::schedule::{replay, Schedule};

    /// Activation `h` is produced first and read again at the very end.
    /// Peak of the base order is 200; f2 keeps `h` and `y` alive together.
    /// With `with_input`, f1 also reads a 10-byte graph input `x`.
    fn activation_reuse(with_input: bool) -> Graph<Normalized> {
        let mut g = Graph::new("reuse", GraphMode::Inference);
        let x = with_input.then(|| g.add_node("x", OpKind::Input, None).unwrap());
        let f1 = g.add_node("f1", OpKind::Compute, Some(0.001)).unwrap();
        let f2 = g.add_node("f2", OpKind::Compute, Some(0.001)).unwrap();
        let f3 = g.add_node("f3", OpKind::Compute, Some(0.001)).unwrap();
        let b2 = g.add_node("b2", OpKind::Compute, Some(0.001)).unwrap();
        let b1 = g.add_node("b1", OpKind::Compute, Some(0.001)).unwrap();
        if let Some(x) = x {
            g.add_edge(x, &[f1], 10, "x").unwrap();
        }
        g.add_edge(f1, &[f2, b1], 100, "h").unwrap();
        g.add_edge(f2, &[f3], 20, "y").unwrap();
        g.add_edge(f3, &[b2], 100, "z").unwrap();
        g.add_edge(b2, &[b1], 10, "dy").unwrap();
        g.add_edge(b1, &[], 1, "dx").unwrap();
        g.into_normalized().unwrap()
    }

    fn mitigations(rematerialize: bool, spill: bool) -> Mitigations {
        Mitigations { rematerialize, spill, max_spills: None }
    }

    fn generous() -> Deadline {
        Deadline::after(Duration::from_secs(60))
    }

    #[test]
    fn test_plain_budget_needs_no_eviction() {
        let g = activation_reuse(false);
        let order = g.topological_order().unwrap();
        let planner = BudgetPlanner::new(&g, CostModel::default(), mitigations(true, true));
        let plan = planner.plan(&order, 200, Strategy::new(EvictionPolicy::FarthestNextUse)).unwrap();
        assert_eq!(plan.max_live, 200);
        assert_eq!(plan.steps.len(), order.len());
        assert_eq!(plan.overhead(), 0.0);
        assert_eq!(planner.trivial_bound(), 110);
    }

    #[test]
    fn test_spilling_fits_a_tighter_budget() {
        let g = activation_reuse(false);
        let order = g.topological_order().unwrap();
        let planner = BudgetPlanner::new(&g, CostModel::default(), mitigations(false, true));
        let plan = planner.plan(&order, 120, Strategy::new(EvictionPolicy::FarthestNextUse)).unwrap();
        assert_eq!(plan.spill_outs, 1);
        assert_eq!(plan.bytes_swapped, 200);
        assert!(plan.max_live <= 120);

        let replayed = replay(&g, &Schedule::new(plan.steps.clone())).unwrap();
        assert!(replayed.peak <= plan.max_live);
        assert_eq!(replayed.bytes_swapped, plan.bytes_swapped);
    }

    #[test]
    fn test_spill_cap_is_respected() {
        let g = activation_reuse(false);
        let order = g.topological_order().unwrap();
        let capped = Mitigations { rematerialize: false, spill: true, max_spills: Some(0) };
        let planner = BudgetPlanner::new(&g, CostModel::default(), capped);
        assert!(planner.plan(&order, 120, Strategy::new(EvictionPolicy::FarthestNextUse)).is_none());
    }

    #[test]
    fn test_rematerialization_fits_a_tighter_budget() {
        let g = activation_reuse(false);
        let order = g.topological_order().unwrap();
        let planner = BudgetPlanner::new(&g, CostModel::default(), mitigations(true, false));
        let plan = planner.plan(&order, 120, Strategy::new(EvictionPolicy::CheapestPerByte)).unwrap();
        assert!(plan.steps.iter().any(|s| matches!(s, ScheduleStep::Recompute(_))));
        assert!(plan.recompute_time > 0.0);

        let replayed = replay(&g, &Schedule::new(plan.steps.clone())).unwrap();
        assert!(replayed.peak <= 120);
    }

    #[test]
    fn test_discard_needs_restorable_inputs() {
        let g = activation_reuse(true);
        let order = g.topological_order().unwrap();
        let planner = BudgetPlanner::new(&g, CostModel::default(), mitigations(true, false));

        // `x` is freed after f1, so `h` can no longer be recomputed.
        let eager = Strategy::new(EvictionPolicy::FarthestNextUse);
        assert!(planner.plan(&order, 130, eager).is_none());

        let plan = planner.plan(&order, 130, eager.retaining()).unwrap();
        let edge = |name: &str| g.edges().iter().find(|e| e.name == name).unwrap().id;
        let (x, h) = (edge("x"), edge("h"));
        let f1 = g.node_id("f1").unwrap();
        assert!(plan.steps.contains(&ScheduleStep::Discard(h)));
        assert!(plan.steps.contains(&ScheduleStep::Recompute(f1)));
        assert!(!plan.steps.contains(&ScheduleStep::Discard(x)));

        let replayed = replay(&g, &Schedule::new(plan.steps.clone())).unwrap();
        assert_eq!(replayed.peak, 130);
        assert!(plan.max_live <= 130);
    }

    #[test]
    fn test_floor_with_retained_inputs() {
        let g = activation_reuse(true);
        let order = g.topological_order().unwrap();
        let planner = BudgetPlanner::new(&g, CostModel::default(), mitigations(true, false));
        let floor = planner.floor(&[&order], 200, &generous()).unwrap();
        assert!(floor.budget <= 130);
        assert_ne!(floor.status, SolveStatus::TimedOut);

        let replayed = replay(&g, &Schedule::new(floor.plan.steps.clone())).unwrap();
        assert!(replayed.peak <= floor.budget);
    }

    #[test]
    fn test_without_mitigations_tight_budgets_fail() {
        let g = activation_reuse(false);
        let order = g.topological_order().unwrap();
        let planner = BudgetPlanner::new(&g, CostModel::default(), Mitigations::NONE);
        assert!(planner.plan(&order, 199, Strategy::new(EvictionPolicy::FarthestNextUse)).is_none());
        let floor = planner.floor(&[&order], 200, &generous()).unwrap();
        assert_eq!(floor.budget, 200);
        assert_eq!(floor.status, SolveStatus::Optimal);
    }

    #[test]
    fn test_floor_with_spilling() {
        let g = activation_reuse(false);
        let order = g.topological_order().unwrap();
        let planner = BudgetPlanner::new(&g, CostModel::default(), mitigations(false, true));
        let floor = planner.floor(&[&order], 200, &generous()).unwrap();
        assert_eq!(floor.budget, 120);
        assert_eq!(floor.status, SolveStatus::Unproven);
        assert!(floor.budget > planner.trivial_bound());
        assert!(floor.plan.max_live <= floor.budget);
        assert!(planner.best_plan(&[&order], floor.budget - 1, None).is_none());
    }

    #[test]
    fn test_expired_deadline_keeps_the_feasible_upper_budget() {
        let g = activation_reuse(false);
        let order = g.topological_order().unwrap();
        let planner = BudgetPlanner::new(&g, CostModel::default(), mitigations(true, true));
        let floor = planner.floor(&[&order], 200, &Deadline::after(Duration::ZERO)).unwrap();
        assert_eq!(floor.budget, 200);
        assert_eq!(floor.status, SolveStatus::TimedOut);
        assert!(floor.plan.max_live <= 200);
        assert!(planner.best_plan(&[&order], 120, Some(&Deadline::after(Duration::ZERO))).is_none());
    }
}
