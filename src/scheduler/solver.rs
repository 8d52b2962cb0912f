use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};

use crate::error::{Error, Result};
use crate::model::{Graph, Normalized, NodeId};
use crate::validation::validate_topological_order;

/// How far a result is proven
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, AsRefStr)]
pub enum SolveStatus {
    /// Matches a proven lower bound
    Optimal,
    /// Relative gap to the lower bound is below the requested tolerance
    WithinTolerance,
    /// Best solution found before the deadline, not proven
    TimedOut,
    /// Search gave up on a work limit without proof
    Unproven,
}

impl SolveStatus {
    /// Optimal or within the requested tolerance
    pub fn is_certified(self) -> bool {
        matches!(self, SolveStatus::Optimal | SolveStatus::WithinTolerance)
    }

    fn rank(self) -> u8 {
        match self {
            SolveStatus::Optimal => 0,
            SolveStatus::WithinTolerance => 1,
            SolveStatus::Unproven => 2,
            SolveStatus::TimedOut => 3,
        }
    }

    /// The less proven of two statuses
    pub fn weakest(self, other: SolveStatus) -> SolveStatus {
        if other.rank() > self.rank() {
            other
        } else {
            self
        }
    }
}

/// Wall-clock limit shared by a solve
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    budget: Duration,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            start: Instant::now(),
            budget,
        }
    }

    pub fn expired(&self) -> bool {
        self.start.elapsed() >= self.budget
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.budget.saturating_sub(self.start.elapsed())
    }

    /// A deadline ending after `fraction` of the remaining time
    pub fn fraction(&self, fraction: f64) -> Deadline {
        let share = self.remaining().mul_f64(fraction.clamp(0.0, 1.0));
        Deadline::after(share)
    }
}

/// `(upper - lower) / upper`, zero when `upper` is zero
pub fn relative_gap(upper: u64, lower: u64) -> f64 {
    if upper == 0 {
        return 0.0;
    }
    upper.saturating_sub(lower) as f64 / upper as f64
}

/// What the ordering solver minimizes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
pub enum Objective {
    /// Peak of the bytes resident after each step
    PeakMemory,
}

/// Ordering problem handed to an [`OrderingSolver`]: the graph's own
/// dependencies plus optional extra precedences and a pinned order
#[derive(Debug, Clone)]
pub struct OrderingModel<'g> {
    graph: &'g Graph<Normalized>,
    precedences: Vec<(NodeId, NodeId)>,
    objective: Objective,
    fixed_order: Option<Vec<NodeId>>,
    rel_stop: f64,
}

impl<'g> OrderingModel<'g> {
    pub fn new(graph: &'g Graph<Normalized>) -> Self {
        Self {
            graph,
            precedences: Vec::new(),
            objective: Objective::PeakMemory,
            fixed_order: None,
            rel_stop: 0.0,
        }
    }

    /// Require `before` to run before `after`
    pub fn add_precedence(&mut self, before: NodeId, after: NodeId) -> Result<()> {
        for node in [before, after] {
            if self.graph.node(node).is_none() {
                return Err(Error::UnknownNode(node.0));
            }
        }
        if before == after {
            return Err(Error::InvalidConfiguration(format!(
                "Node {} cannot precede itself",
                before
            )));
        }
        self.precedences.push((before, after));
        Ok(())
    }

    pub fn set_objective(&mut self, objective: Objective) {
        self.objective = objective;
    }

    /// Pin the order; solvers only evaluate it
    pub fn fix_order(&mut self, order: Vec<NodeId>) -> Result<()> {
        validate_topological_order(self.graph, &order)?;
        self.fixed_order = Some(order);
        Ok(())
    }

    /// Stop once the relative gap to the lower bound is at most `rel_stop`
    pub fn set_relative_stop(&mut self, rel_stop: f64) {
        self.rel_stop = rel_stop.max(0.0);
    }

    pub fn graph(&self) -> &'g Graph<Normalized> {
        self.graph
    }

    pub fn precedences(&self) -> &[(NodeId, NodeId)] {
        &self.precedences
    }

    pub fn objective(&self) -> Objective {
        self.objective
    }

    pub fn fixed_order(&self) -> Option<&[NodeId]> {
        self.fixed_order.as_deref()
    }

    pub fn rel_stop(&self) -> f64 {
        self.rel_stop
    }

    /// Distinct predecessors of every node, extra precedences included
    pub(crate) fn predecessor_lists(&self) -> Vec<Vec<usize>> {
        let n = self.graph.num_nodes();
        let mut preds: Vec<Vec<usize>> = (0..n)
            .map(|i| {
                self.graph
                    .predecessors(NodeId(i))
                    .into_iter()
                    .map(|p| p.0)
                    .collect()
            })
            .collect();
        for &(before, after) in &self.precedences {
            if !preds[after.0].contains(&before.0) {
                preds[after.0].push(before.0);
            }
        }
        preds
    }

    /// Objective value of `order`; fails if it breaks a dependency
    pub fn evaluate(&self, order: &[NodeId]) -> Result<u64> {
        validate_topological_order(self.graph, order)?;
        let mut position = vec![0usize; order.len()];
        for (i, node) in order.iter().enumerate() {
            position[node.0] = i;
        }
        if let Some((before, after)) = self
            .precedences
            .iter()
            .find(|(before, after)| position[before.0] > position[after.0])
        {
            return Err(Error::Validation(format!(
                "node {} must run before {}",
                before, after
            )));
        }
        Ok(peak_of_order(self.graph, order))
    }
}

/// Peak resident bytes of a valid topological order
pub(crate) fn peak_of_order(graph: &Graph<Normalized>, order: &[NodeId]) -> u64 {
    let edges = graph.edges();
    let mut remaining: Vec<usize> = edges.iter().map(|e| e.sinks.len()).collect();
    let mut usage: u64 = 0;
    let mut peak: u64 = 0;
    for node in order {
        let node = &graph.nodes()[node.0];
        for e in &node.fanout {
            usage += edges[e.0].size;
        }
        for e in &node.fanin {
            remaining[e.0] -= 1;
            if remaining[e.0] == 0 {
                usage -= edges[e.0].size;
            }
        }
        peak = peak.max(usage);
    }
    peak
}

/// Result of an ordering solve
#[derive(Debug, Clone)]
pub struct SolverReport {
    /// Best order found
    pub order: Vec<NodeId>,
    /// Its peak memory
    pub peak: u64,
    /// Proven lower bound on the optimal peak
    pub lower_bound: u64,
    pub status: SolveStatus,
    /// Search states expanded
    pub explored: usize,
}

impl SolverReport {
    pub fn gap(&self) -> f64 {
        relative_gap(self.peak, self.lower_bound)
    }
}

/// Finds a topological order minimizing the model's objective
pub trait OrderingSolver: Send + Sync {
    fn name(&self) -> &str;

    fn solve(&self, model: &OrderingModel<'_>, deadline: &Deadline) -> Result<SolverReport>;
}

/// Report for a model whose order is pinned
pub(crate) fn fixed_order_report(model: &OrderingModel<'_>) -> Result<Option<SolverReport>> {
    let Some(order) = model.fixed_order() else {
        return Ok(None);
    };
    let peak = model.evaluate(order)?;
    Ok(Some(SolverReport {
        order: order.to_vec(),
        peak,
        lower_bound: peak,
        status: SolveStatus::Optimal,
        explored: 0,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{GraphMode, OpKind};

    #[test]
    fn test_relative_gap() {
        assert_eq!(relative_gap(0, 0), 0.0);
        assert_eq!(relative_gap(100, 100), 0.0);
        assert_eq!(relative_gap(100, 75), 0.25);
        assert_eq!(relative_gap(100, 120), 0.0);
    }

    #[test]
    fn test_weakest_status() {
        assert_eq!(SolveStatus::Optimal.weakest(SolveStatus::TimedOut), SolveStatus::TimedOut);
        assert_eq!(SolveStatus::Unproven.weakest(SolveStatus::WithinTolerance), SolveStatus::Unproven);
        assert_eq!(SolveStatus::Optimal.weakest(SolveStatus::Optimal), SolveStatus::Optimal);
    }

    #[test]
    fn test_deadline() {
        let expired = Deadline::after(Duration::ZERO);
        assert!(expired.expired());
        assert_eq!(expired.remaining(), Duration::ZERO);
        let open = Deadline::after(Duration::from_secs(3600));
        assert!(!open.expired());
        assert!(open.fraction(0.5).remaining() <= Duration::from_secs(1800));
    }

    #[test]
    fn test_model_precedences() {
        let mut g = Graph::new("two", GraphMode::Inference);
        let a = g.add_node("a", OpKind::Input, None).unwrap();
        let b = g.add_node("b", OpKind::Input, None).unwrap();
        let out = g.add_node("out", OpKind::Output, None).unwrap();
        g.add_edge(a, &[out], 4, "a").unwrap();
        g.add_edge(b, &[out], 4, "b").unwrap();
        let g = g.into_normalized().unwrap();

        let mut model = OrderingModel::new(&g);
        model.add_precedence(b, a).unwrap();
        assert!(model.add_precedence(a, a).is_err());
        assert!(model.evaluate(&[a, b, out]).is_err());
        assert_eq!(model.evaluate(&[b, a, out]).unwrap(), 8);
        assert!(model.predecessor_lists()[a.0].contains(&b.0));

        model.fix_order(vec![b, a, out]).unwrap();
        let report = fixed_order_report(&model).unwrap().unwrap();
        assert_eq!(report.peak, 8);
        assert_eq!(report.status, SolveStatus::Optimal);
    }
}
