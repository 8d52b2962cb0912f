pub mod error;
pub mod memory;
pub mod model;
pub mod optimization;
pub mod schedule;
pub mod scheduler;
pub mod simulator;
pub mod tools;
pub mod validation;

// Re-export commonly used types
pub use error::{Error, Result};
pub use memory::{AddressAssignment, AddressPlanner, BufferAllocation, BufferId, LiveRange};
pub use model::{Edge, EdgeId, Graph, GraphMode, GraphState, GraphViolation, Node, NodeId, Normalized, OpKind, Raw};
pub use optimization::graph_optimizer::{GraphOptimizer, NormalizationPass, OptimizationStats, PassResult};
pub use schedule::{replay, Replay, Schedule, ScheduleStep};
pub use scheduler::{
    BottleneckSearch, BruteForceSolver, CostModel, Deadline, Infeasibility, MinimumMemory, OrderingModel,
    OrderingSolver, PlanSummary, ScheduleOutcome, ScheduleRequest, ScheduleResult, Scheduler, SchedulerOptions,
    SolveStatus, SolverReport,
};
pub use simulator::{MemoryEvent, MemoryEventKind, SimulationResult, Simulator};
pub use tools::profile::{NodeProfile, ProfileSummary};
