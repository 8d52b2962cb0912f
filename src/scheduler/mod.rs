pub mod brute_force;
pub(crate) mod mitigation;
pub mod options;
pub mod search;
pub mod solver;

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use log::{info, log, Level};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::memory::liveness::LiveRange;
use crate::memory::planner::{AddressAssignment, AddressPlanner};
use crate::model::{Graph, Normalized, NodeId};
use crate::schedule::{replay, Schedule};
use crate::validation::{
    validate_address_allocation, validate_address_coverage, validate_node_ordering, validate_timeline,
};

pub use brute_force::BruteForceSolver;
pub use options::{CostModel, ScheduleRequest, SchedulerOptions};
pub use search::BottleneckSearch;
pub use solver::{Deadline, Objective, OrderingModel, OrderingSolver, SolveStatus, SolverReport};

use mitigation::{BudgetPlanner, MitigatedPlan};
use options::{Mitigations, Mode};

/// Figures reported for every scheduled plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanSummary {
    /// Memory the plan is certified to fit in. Packed extent in
    /// fragmentation mode, the budget in budgeted mode.
    pub peak_mem_usage: u64,
    /// Sum-based requirement of the plan (the budget in budgeted mode)
    pub required_memory: u64,
    /// Bytes spilled plus bytes restored
    pub total_data_swapped: u64,
    /// Seconds spent re-executing nodes
    pub rematerialization_time: f64,
    /// Seconds spent moving spilled bytes
    pub spill_time: f64,
    /// Highest number of bytes actually resident after a step
    pub max_live_bytes: u64,
    /// Arena size of the address assignment. Outside fragmentation mode
    /// this can exceed `peak_mem_usage` when the live ranges cannot be
    /// packed down to their load.
    pub address_extent: u64,
    pub lower_bound: u64,
    pub gap: f64,
    pub status: SolveStatus,
    pub recomputed_nodes: usize,
    pub spills: usize,
    pub solve_time: Duration,
}

impl PlanSummary {
    /// `(peak - required) / required`
    pub fn fragmentation(&self) -> f64 {
        if self.required_memory == 0 {
            return 0.0;
        }
        self.peak_mem_usage.saturating_sub(self.required_memory) as f64 / self.required_memory as f64
    }

    /// Extra execution time caused by recomputation and spilling
    pub fn runtime_overhead(&self) -> f64 {
        self.rematerialization_time + self.spill_time
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleResult {
    pub summary: PlanSummary,
    pub schedule: Schedule,
    pub addresses: AddressAssignment,
}

/// Why a budget cannot be met
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Infeasibility {
    pub mem_limit: u64,
    /// Smallest budget the enabled mitigations can reach
    pub minimum_memory: u64,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ScheduleOutcome {
    Scheduled(ScheduleResult),
    Infeasible(Infeasibility),
}

impl ScheduleOutcome {
    pub fn is_feasible(&self) -> bool {
        matches!(self, ScheduleOutcome::Scheduled(_))
    }

    pub fn scheduled(&self) -> Option<&ScheduleResult> {
        match self {
            ScheduleOutcome::Scheduled(result) => Some(result),
            ScheduleOutcome::Infeasible(_) => None,
        }
    }

    pub fn into_scheduled(self) -> Option<ScheduleResult> {
        match self {
            ScheduleOutcome::Scheduled(result) => Some(result),
            ScheduleOutcome::Infeasible(_) => None,
        }
    }

    pub fn infeasibility(&self) -> Option<&Infeasibility> {
        match self {
            ScheduleOutcome::Infeasible(reason) => Some(reason),
            ScheduleOutcome::Scheduled(_) => None,
        }
    }
}

/// Smallest budgets reachable with each kind of mitigation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinimumMemory {
    /// Peak of the best plain order
    pub no_mitigation: u64,
    pub rematerialization: u64,
    pub spilling: u64,
    pub combined: u64,
    /// Weakest status among the figures; `TimedOut` when a bisection was
    /// cut short and its figure is only an upper bound
    pub status: SolveStatus,
}

struct FloorPlan {
    budget: u64,
    plan: MitigatedPlan,
    status: SolveStatus,
}

/// Plans execution order, addresses and memory mitigations for one graph.
///
/// The best plain order and the minimum budget of each mitigation mix are
/// cached, so repeated queries against the same graph only pay for them
/// once.
pub struct Scheduler<'g> {
    graph: &'g Graph<Normalized>,
    options: SchedulerOptions,
    solver: Box<dyn OrderingSolver>,
    thread_pool: Option<Arc<rayon::ThreadPool>>,
    base_order: RwLock<Option<Arc<SolverReport>>>,
    floors: RwLock<HashMap<Mitigations, Arc<FloorPlan>>>,
}

impl<'g> Scheduler<'g> {
    pub fn new(graph: &'g Graph<Normalized>, options: SchedulerOptions) -> Result<Self> {
        options.validate()?;
        graph.validate()?;

        // Create thread pool if thread count is specified
        let thread_pool = if options.thread_count > 0 {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(options.thread_count)
                .build()
                .map_err(|e| Error::InvalidConfiguration(format!("Failed to create thread pool: {}", e)))?;
            Some(Arc::new(pool))
        } else {
            None
        };

        let solver = BottleneckSearch::new()
            .with_max_states(options.max_search_states)
            .with_max_restarts(options.max_restarts)
            .with_seed(options.seed)
            .with_progress(options.report_progress);

        Ok(Self {
            graph,
            options,
            solver: Box::new(solver),
            thread_pool,
            base_order: RwLock::new(None),
            floors: RwLock::new(HashMap::new()),
        })
    }

    /// Replace the ordering solver; clears every cached result
    pub fn with_solver(mut self, solver: Box<dyn OrderingSolver>) -> Self {
        self.solver = solver;
        self.base_order = RwLock::new(None);
        self.floors = RwLock::new(HashMap::new());
        self
    }

    pub fn graph(&self) -> &'g Graph<Normalized> {
        self.graph
    }

    pub fn options(&self) -> &SchedulerOptions {
        &self.options
    }

    pub fn solver_name(&self) -> &str {
        self.solver.name()
    }

    fn install<R: Send>(&self, f: impl FnOnce() -> R + Send) -> R {
        match &self.thread_pool {
            Some(pool) => pool.install(f),
            None => f(),
        }
    }

    fn progress_level(&self) -> Level {
        if self.options.report_progress {
            Level::Info
        } else {
            Level::Debug
        }
    }

    /// Compute an execution plan for `request`
    pub fn compute_optimal_schedule(&self, request: &ScheduleRequest) -> Result<ScheduleOutcome> {
        let mode = request.mode()?;
        let started = Instant::now();
        let deadline = Deadline::after(self.options.timeout);

        let outcome = self.install(|| match mode {
            Mode::Plain { order } => self.plain(order, &deadline).map(ScheduleOutcome::Scheduled),
            Mode::Fragmentation { order } => {
                self.fragmentation(order, &deadline).map(ScheduleOutcome::Scheduled)
            }
            Mode::Budgeted { limit, mitigations } => self.budgeted(limit, mitigations, &deadline),
        })?;

        Ok(match outcome {
            ScheduleOutcome::Scheduled(mut result) => {
                result.summary.solve_time = started.elapsed();
                log!(
                    self.progress_level(),
                    "graph '{}': {} steps, peak {} bytes, {} ({:.3}s)",
                    self.graph.name(),
                    result.schedule.len(),
                    result.summary.peak_mem_usage,
                    result.summary.status,
                    result.summary.solve_time.as_secs_f64()
                );
                ScheduleOutcome::Scheduled(result)
            }
            infeasible => {
                info!("graph '{}': memory limit cannot be met", self.graph.name());
                infeasible
            }
        })
    }

    /// Smallest budget reachable by each mitigation mix
    pub fn compute_minimum_memory_required(&self) -> Result<MinimumMemory> {
        let deadline = Deadline::after(self.options.timeout);
        self.install(|| {
            let base = self.base_order(&deadline)?;
            let floor = |rematerialize, spill, share: f64| -> Result<Arc<FloorPlan>> {
                let mitigations = Mitigations {
                    rematerialize,
                    spill,
                    max_spills: None,
                };
                self.floor(mitigations, &base, &deadline.fraction(share))
            };
            // Each bisection gets an even share of what is left.
            let rematerialization = floor(true, false, 1.0 / 3.0)?;
            let spilling = floor(false, true, 0.5)?;
            let combined = floor(true, true, 1.0)?;
            let status = [&rematerialization, &spilling, &combined]
                .iter()
                .fold(base.status, |status, floor| status.weakest(floor.status));
            Ok(MinimumMemory {
                no_mitigation: base.peak,
                rematerialization: rematerialization.budget,
                spilling: spilling.budget,
                combined: combined.budget,
                status,
            })
        })
    }

    fn solve_order(&self, fixed: Option<&[NodeId]>, deadline: &Deadline) -> Result<SolverReport> {
        let mut model = OrderingModel::new(self.graph);
        model.set_relative_stop(self.options.rel_stop);
        if let Some(order) = fixed {
            model
                .fix_order(order.to_vec())
                .map_err(|e| Error::InvalidConfiguration(format!("User schedule rejected: {}", e)))?;
        }
        let report = self.solver.solve(&model, deadline)?;
        log!(
            self.progress_level(),
            "{}: peak {} bytes, lower bound {} bytes, {} states, {}",
            self.solver.name(),
            report.peak,
            report.lower_bound,
            report.explored,
            report.status
        );
        Ok(report)
    }

    /// Best plain order, solved once with half of the remaining time
    fn base_order(&self, deadline: &Deadline) -> Result<Arc<SolverReport>> {
        if let Some(report) = self.base_order.read().unwrap_or_else(PoisonError::into_inner).as_ref() {
            return Ok(Arc::clone(report));
        }
        let report = Arc::new(self.solve_order(None, &deadline.fraction(0.5))?);
        *self.base_order.write().unwrap_or_else(PoisonError::into_inner) = Some(Arc::clone(&report));
        Ok(report)
    }

    /// Minimum budget of a mitigation mix. Bisections cut short by the
    /// deadline are not cached.
    fn floor(&self, mitigations: Mitigations, base: &SolverReport, deadline: &Deadline) -> Result<Arc<FloorPlan>> {
        if let Some(floor) = self
            .floors
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&mitigations)
        {
            return Ok(Arc::clone(floor));
        }

        let kahn = self.graph.topological_order()?;
        let orders: [&[NodeId]; 2] = [&base.order, &kahn];
        let planner = BudgetPlanner::new(self.graph, self.options.cost_model, mitigations);
        let found = planner.floor(&orders, base.peak, deadline).ok_or_else(|| {
            Error::Validation(format!(
                "no mitigated plan fits the unmitigated peak of {} bytes",
                base.peak
            ))
        })?;
        let status = if mitigations.any() {
            found.status
        } else {
            base.status
        };
        log!(
            self.progress_level(),
            "minimum memory with {:?}: {} bytes ({})",
            mitigations,
            found.budget,
            status
        );

        let floor = Arc::new(FloorPlan {
            budget: found.budget,
            plan: found.plan,
            status,
        });
        if status != SolveStatus::TimedOut {
            self.floors
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(mitigations, Arc::clone(&floor));
        }
        Ok(floor)
    }

    fn plain(&self, order: Option<&[NodeId]>, deadline: &Deadline) -> Result<ScheduleResult> {
        let report = self.solve_order(order, deadline)?;
        let schedule = Schedule::from_order(self.graph, &report.order)?;
        let replayed = replay(self.graph, &schedule)?;
        if replayed.peak != report.peak {
            return Err(Error::Validation(format!(
                "solver reported a peak of {} bytes, replay found {}",
                report.peak, replayed.peak
            )));
        }

        let addresses = self.layout(&replayed.ranges, deadline);
        self.certify(&schedule, &addresses)?;

        Ok(ScheduleResult {
            summary: PlanSummary {
                peak_mem_usage: report.peak,
                required_memory: report.peak,
                total_data_swapped: 0,
                rematerialization_time: 0.0,
                spill_time: 0.0,
                max_live_bytes: replayed.peak,
                address_extent: addresses.extent(),
                lower_bound: report.lower_bound,
                gap: report.gap(),
                status: report.status,
                recomputed_nodes: 0,
                spills: 0,
                solve_time: Duration::ZERO,
            },
            schedule,
            addresses,
        })
    }

    fn fragmentation(&self, order: &[NodeId], deadline: &Deadline) -> Result<ScheduleResult> {
        let report = self.solve_order(Some(order), deadline)?;
        let schedule = Schedule::from_order(self.graph, &report.order)?;
        let replayed = replay(self.graph, &schedule)?;

        let packing = AddressPlanner::new(self.options.alignment)
            .with_seed(self.options.seed)
            .with_max_iterations(self.options.max_packing_iterations)
            .pack(&replayed.ranges, self.options.rel_stop, deadline);
        self.certify(&schedule, &packing.assignment)?;

        let extent = packing.assignment.extent();
        Ok(ScheduleResult {
            summary: PlanSummary {
                peak_mem_usage: extent,
                required_memory: replayed.peak,
                total_data_swapped: 0,
                rematerialization_time: 0.0,
                spill_time: 0.0,
                max_live_bytes: replayed.peak,
                address_extent: extent,
                lower_bound: packing.lower_bound,
                gap: packing.gap(),
                status: packing.status,
                recomputed_nodes: 0,
                spills: 0,
                solve_time: Duration::ZERO,
            },
            schedule,
            addresses: packing.assignment,
        })
    }

    fn budgeted(&self, limit: u64, mitigations: Mitigations, deadline: &Deadline) -> Result<ScheduleOutcome> {
        let base = self.base_order(deadline)?;
        let floor = self.floor(mitigations, &base, deadline)?;
        if limit < floor.budget {
            let reason = if floor.status == SolveStatus::TimedOut {
                format!("no plan found below {} bytes before the timeout", floor.budget)
            } else if mitigations.any() {
                format!(
                    "no plan found below {} bytes with the enabled mitigations",
                    floor.budget
                )
            } else {
                format!("the best order peaks at {} bytes", floor.budget)
            };
            return Ok(ScheduleOutcome::Infeasible(Infeasibility {
                mem_limit: limit,
                minimum_memory: floor.budget,
                reason,
            }));
        }

        let kahn = self.graph.topological_order()?;
        let orders: [&[NodeId]; 2] = [&base.order, &kahn];
        let planner = BudgetPlanner::new(self.graph, self.options.cost_model, mitigations);
        let plan = match planner.best_plan(&orders, limit, Some(deadline)) {
            Some(plan) if plan.overhead() <= floor.plan.overhead() => plan,
            _ => floor.plan.clone(),
        };

        let schedule = Schedule::new(plan.steps.clone());
        let replayed = replay(self.graph, &schedule)?;
        if replayed.peak > limit {
            return Err(Error::Validation(format!(
                "plan peaks at {} bytes, above the limit of {} bytes",
                replayed.peak, limit
            )));
        }
        let addresses = self.layout(&replayed.ranges, deadline);
        self.certify(&schedule, &addresses)?;

        let overhead = plan.overhead();
        let status = if deadline.expired() {
            SolveStatus::TimedOut
        } else if overhead > 0.0 {
            SolveStatus::Unproven
        } else {
            SolveStatus::Optimal
        };
        Ok(ScheduleOutcome::Scheduled(ScheduleResult {
            summary: PlanSummary {
                peak_mem_usage: limit,
                required_memory: limit,
                total_data_swapped: replayed.bytes_swapped,
                rematerialization_time: plan.recompute_time,
                spill_time: plan.transfer_time,
                max_live_bytes: replayed.peak,
                address_extent: addresses.extent(),
                lower_bound: floor.budget,
                gap: if overhead > 0.0 { 1.0 } else { 0.0 },
                status,
                recomputed_nodes: replayed.recomputed.len(),
                spills: replayed.spill_outs,
                solve_time: Duration::ZERO,
            },
            schedule,
            addresses,
        }))
    }

    /// Packed addresses for a plan whose peak is the sum of live bytes
    fn layout(&self, ranges: &[LiveRange], deadline: &Deadline) -> AddressAssignment {
        AddressPlanner::new(self.options.alignment)
            .with_seed(self.options.seed)
            .with_max_iterations(self.options.max_packing_iterations)
            .pack(ranges, 0.0, deadline)
            .assignment
    }

    /// Every plan passes the independent checks before it is returned
    fn certify(&self, schedule: &Schedule, addresses: &AddressAssignment) -> Result<()> {
        validate_timeline(self.graph, schedule)?;
        validate_node_ordering(self.graph, schedule)?;
        validate_address_allocation(addresses)?;
        validate_address_coverage(self.graph, schedule, addresses)
    }
}
