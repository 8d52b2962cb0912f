pub mod liveness;
pub mod planner;

pub use liveness::{align_up, live_ranges, max_load, BufferId, LiveRange};

pub use planner::{
    AddressAssignment,
    AddressPlanner,
    BufferAllocation,
    PackingReport,
    PlacementOrder,
};
