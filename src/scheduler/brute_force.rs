use crate::error::{Error, Result};
use crate::model::NodeId;
use crate::scheduler::search::{Frontier, SearchContext};
use crate::scheduler::solver::{
    fixed_order_report, Deadline, OrderingModel, OrderingSolver, SolveStatus, SolverReport,
};

/// Enumerates every topological order with branch-and-bound pruning.
/// Only meant for small graphs, mainly as a reference for tests.
pub struct BruteForceSolver {
    max_nodes: usize,
}

impl Default for BruteForceSolver {
    fn default() -> Self {
        Self { max_nodes: 12 }
    }
}

impl BruteForceSolver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_nodes(mut self, max_nodes: usize) -> Self {
        self.max_nodes = max_nodes;
        self
    }
}

struct Enumeration<'d> {
    best: Option<(Vec<usize>, u64)>,
    explored: usize,
    deadline: &'d Deadline,
    timed_out: bool,
}

impl Enumeration<'_> {
    fn visit(&mut self, frontier: &mut Frontier<'_>) {
        if self.timed_out {
            return;
        }
        if let Some((_, best_peak)) = &self.best {
            if frontier.peak >= *best_peak {
                return;
            }
        }
        if frontier.is_complete() {
            self.best = Some((frontier.order.clone(), frontier.peak));
            return;
        }

        self.explored += 1;
        if self.explored % 1024 == 0 && self.deadline.expired() {
            self.timed_out = true;
            return;
        }

        let ready: Vec<usize> = frontier.ready.iter().copied().collect();
        for v in ready {
            let saved = frontier.push(v);
            self.visit(frontier);
            frontier.undo(saved);
        }
    }
}

impl OrderingSolver for BruteForceSolver {
    fn name(&self) -> &str {
        "brute-force"
    }

    fn solve(&self, model: &OrderingModel<'_>, deadline: &Deadline) -> Result<SolverReport> {
        if let Some(report) = fixed_order_report(model)? {
            return Ok(report);
        }
        let n = model.graph().num_nodes();
        if n > self.max_nodes {
            return Err(Error::InvalidConfiguration(format!(
                "Brute force enumeration is limited to {} nodes, graph has {}",
                self.max_nodes, n
            )));
        }

        let ctx = SearchContext::new(model);
        let mut frontier = Frontier::new(&ctx);
        let mut enumeration = Enumeration {
            best: None,
            explored: 0,
            deadline,
            timed_out: false,
        };
        enumeration.visit(&mut frontier);

        let (order, peak) = enumeration.best.ok_or_else(|| {
            Error::InvalidConfiguration("Ordering constraints contain a cycle".to_string())
        })?;
        let status = if enumeration.timed_out {
            SolveStatus::TimedOut
        } else {
            SolveStatus::Optimal
        };

        Ok(SolverReport {
            order: order.into_iter().map(NodeId).collect(),
            peak,
            lower_bound: if enumeration.timed_out { 0 } else { peak },
            status,
            explored: enumeration.explored,
        })
    }
}
