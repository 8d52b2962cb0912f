use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::NodeId;

/// Prices of the memory-saving actions
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CostModel {
    /// Host/device transfer bandwidth in bytes per second
    pub transfer_bandwidth: f64,
    /// Multiplier applied to node time estimates for re-executions
    pub recompute_time_scale: f64,
}

impl Default for CostModel {
    fn default() -> Self {
        Self {
            transfer_bandwidth: 16e9,
            recompute_time_scale: 1.0,
        }
    }
}

impl CostModel {
    /// Seconds to move `bytes` in one direction
    pub fn transfer_time(&self, bytes: u64) -> f64 {
        bytes as f64 / self.transfer_bandwidth
    }

    /// Seconds to re-execute a node with time estimate `runtime`
    pub fn recompute_time(&self, runtime: f64) -> f64 {
        runtime * self.recompute_time_scale
    }
}

/// Solver settings shared by every request made through one scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerOptions {
    /// Stop once the relative optimality gap is at most this value
    pub rel_stop: f64,
    /// Wall-clock limit per solve
    pub timeout: Duration,
    /// Log solver progress at info level
    pub report_progress: bool,
    /// Number of worker threads (0 = use the global rayon pool)
    pub thread_count: usize,
    /// Stored-state limit of the exact ordering search
    pub max_search_states: usize,
    /// Rounds of randomized restarts after the exact search gives up
    pub max_restarts: usize,
    /// Local search iterations of the address packer
    pub max_packing_iterations: usize,
    /// Byte alignment of buffer offsets (a power of two)
    pub alignment: u64,
    /// Seed for every randomized component
    pub seed: u64,
    pub cost_model: CostModel,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            rel_stop: 0.01,
            timeout: Duration::from_secs(1800),
            report_progress: false,
            thread_count: 0,
            max_search_states: 200_000,
            max_restarts: 64,
            max_packing_iterations: 20_000,
            alignment: 1,
            seed: 0,
            cost_model: CostModel::default(),
        }
    }
}

impl SchedulerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the relative gap at which the solvers stop
    pub fn set_rel_stop(mut self, rel_stop: f64) -> Self {
        self.rel_stop = rel_stop;
        self
    }

    /// Set the wall-clock limit
    pub fn set_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Enable or disable progress logging
    pub fn enable_progress_reporting(mut self, enable: bool) -> Self {
        self.report_progress = enable;
        self
    }

    /// Set the number of threads to use
    pub fn set_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn set_max_search_states(mut self, max_search_states: usize) -> Self {
        self.max_search_states = max_search_states;
        self
    }

    pub fn set_max_restarts(mut self, max_restarts: usize) -> Self {
        self.max_restarts = max_restarts;
        self
    }

    pub fn set_max_packing_iterations(mut self, iterations: usize) -> Self {
        self.max_packing_iterations = iterations;
        self
    }

    /// Set the address alignment in bytes
    pub fn set_alignment(mut self, alignment: u64) -> Self {
        self.alignment = alignment;
        self
    }

    pub fn set_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn set_cost_model(mut self, cost_model: CostModel) -> Self {
        self.cost_model = cost_model;
        self
    }

    /// Load options from JSON; missing fields keep their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let options: Self = serde_json::from_str(json)?;
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        if !(0.0..1.0).contains(&self.rel_stop) {
            return Err(Error::InvalidConfiguration(format!(
                "rel_stop must be in [0, 1), got {}",
                self.rel_stop
            )));
        }
        if self.alignment == 0 || !self.alignment.is_power_of_two() {
            return Err(Error::InvalidConfiguration(format!(
                "alignment must be a power of two, got {}",
                self.alignment
            )));
        }
        if !(self.cost_model.transfer_bandwidth > 0.0) || !self.cost_model.transfer_bandwidth.is_finite() {
            return Err(Error::InvalidConfiguration(format!(
                "transfer bandwidth must be positive, got {}",
                self.cost_model.transfer_bandwidth
            )));
        }
        if !(self.cost_model.recompute_time_scale >= 0.0) {
            return Err(Error::InvalidConfiguration(format!(
                "recompute time scale must be non-negative, got {}",
                self.cost_model.recompute_time_scale
            )));
        }
        if self.max_search_states == 0 {
            return Err(Error::InvalidConfiguration(
                "max_search_states must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// One scheduling query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleRequest {
    /// Permit spilling buffers to host memory
    pub allow_swaps: bool,
    /// Permit discarding and recomputing buffers
    pub allow_rematerialization: bool,
    /// Cap on spill-out operations; `None` is unlimited
    pub max_spills: Option<usize>,
    /// Device memory budget in bytes
    pub mem_limit: Option<u64>,
    /// Pack addresses for a given order and report fragmentation
    pub account_for_fragmentation: bool,
    /// Execution order to use instead of searching for one
    pub user_schedule: Option<Vec<NodeId>>,
}

/// Which objective a request resolves to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct Mitigations {
    pub rematerialize: bool,
    pub spill: bool,
    pub max_spills: Option<usize>,
}

impl Mitigations {
    pub(crate) const NONE: Mitigations = Mitigations {
        rematerialize: false,
        spill: false,
        max_spills: None,
    };

    pub(crate) fn any(&self) -> bool {
        self.rematerialize || self.spill
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Mode<'r> {
    /// Minimize peak memory, optionally over a pinned order
    Plain { order: Option<&'r [NodeId]> },
    /// Pack a pinned order as tightly as possible
    Fragmentation { order: &'r [NodeId] },
    /// Fit a memory budget with the least overhead
    Budgeted { limit: u64, mitigations: Mitigations },
}

impl ScheduleRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allow_swaps(mut self, allow: bool) -> Self {
        self.allow_swaps = allow;
        self
    }

    pub fn allow_rematerialization(mut self, allow: bool) -> Self {
        self.allow_rematerialization = allow;
        self
    }

    pub fn max_spills(mut self, max_spills: usize) -> Self {
        self.max_spills = Some(max_spills);
        self
    }

    pub fn mem_limit(mut self, bytes: u64) -> Self {
        self.mem_limit = Some(bytes);
        self
    }

    pub fn account_for_fragmentation(mut self, enable: bool) -> Self {
        self.account_for_fragmentation = enable;
        self
    }

    pub fn user_schedule(mut self, order: Vec<NodeId>) -> Self {
        self.user_schedule = Some(order);
        self
    }

    /// Resolve the flags into one objective, rejecting unsupported mixes
    pub(crate) fn mode(&self) -> Result<Mode<'_>> {
        let mitigations = Mitigations {
            rematerialize: self.allow_rematerialization,
            spill: self.allow_swaps && self.max_spills != Some(0),
            max_spills: if self.allow_swaps { self.max_spills } else { None },
        };

        if self.account_for_fragmentation {
            if self.allow_swaps || self.allow_rematerialization {
                return Err(Error::InvalidConfiguration(
                    "Fragmentation analysis cannot be combined with swaps or rematerialization".to_string(),
                ));
            }
            if self.mem_limit.is_some() {
                return Err(Error::InvalidConfiguration(
                    "Fragmentation analysis does not take a memory limit".to_string(),
                ));
            }
            let order = self.user_schedule.as_deref().ok_or_else(|| {
                Error::InvalidConfiguration("Fragmentation analysis requires a user schedule".to_string())
            })?;
            return Ok(Mode::Fragmentation { order });
        }

        if self.allow_swaps || self.allow_rematerialization {
            let limit = self.mem_limit.ok_or_else(|| {
                Error::InvalidConfiguration(
                    "Swapping and rematerialization require a memory limit".to_string(),
                )
            })?;
            if self.user_schedule.is_some() {
                return Err(Error::InvalidConfiguration(
                    "A user schedule cannot be combined with swaps or rematerialization; \
                     constrain the relative ordering of the graph instead"
                        .to_string(),
                ));
            }
            return Ok(Mode::Budgeted { limit, mitigations });
        }

        match self.mem_limit {
            Some(limit) if self.user_schedule.is_none() => Ok(Mode::Budgeted {
                limit,
                mitigations: Mitigations::NONE,
            }),
            Some(_) => Err(Error::InvalidConfiguration(
                "A memory limit cannot be combined with a user schedule".to_string(),
            )),
            None => Ok(Mode::Plain {
                order: self.user_schedule.as_deref(),
            }),
        }
    }
}
