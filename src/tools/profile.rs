//! Reduction of measured per-node profiles into the figures the planner
//! consumes: mean runtimes for node time estimates, and the peak reserved
//! memory of the measured run as a fragmentation reference.

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{Graph, Raw};

/// Raw samples recorded for one node over several iterations
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeProfile {
    /// Wall-clock time of each execution in seconds
    pub runtimes_sec: Vec<f64>,
    /// Bytes held by live tensors right after each execution
    pub memory_allocated: Vec<u64>,
    /// Bytes reserved by the device allocator right after each execution
    pub memory_reserved: Vec<u64>,
}

/// Per-node reduction of a [`NodeProfile`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub mean_runtime: Option<f64>,
    /// Largest reserved sample
    pub memory_reserved: u64,
    /// Allocated bytes of the same sample
    pub memory_allocated: u64,
}

impl NodeProfile {
    pub fn summarize(&self, node: &str) -> Result<NodeSummary> {
        if self.memory_allocated.len() != self.memory_reserved.len() {
            return Err(Error::InvalidConfiguration(format!(
                "profile of '{}' has {} allocated samples but {} reserved samples",
                node,
                self.memory_allocated.len(),
                self.memory_reserved.len()
            )));
        }

        let mean_runtime = if self.runtimes_sec.is_empty() {
            None
        } else {
            Some(statistical::mean(&self.runtimes_sec))
        };

        // First sample wins among equal reserved values.
        let peak = self
            .memory_reserved
            .iter()
            .zip(&self.memory_allocated)
            .fold(None, |best: Option<(u64, u64)>, (&reserved, &allocated)| match best {
                Some((r, _)) if r >= reserved => best,
                _ => Some((reserved, allocated)),
            });
        let (memory_reserved, memory_allocated) = peak.unwrap_or((0, 0));

        Ok(NodeSummary {
            mean_runtime,
            memory_reserved,
            memory_allocated,
        })
    }
}

/// Whole-graph reduction of a set of node profiles
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProfileSummary {
    pub nodes: BTreeMap<String, NodeSummary>,
    /// Highest reserved memory over all nodes
    pub peak_reserved_bytes: u64,
    /// Allocated memory when the reservation peaked
    pub allocated_mem_at_peak: u64,
    /// `(peak_reserved_bytes - allocated_mem_at_peak) / peak_reserved_bytes`
    pub max_mem_fragmentation: f64,
}

impl ProfileSummary {
    /// Reduce profiles keyed by node name
    pub fn from_profiles(profiles: &BTreeMap<String, NodeProfile>) -> Result<Self> {
        let mut nodes = BTreeMap::new();
        for (name, profile) in profiles {
            nodes.insert(name.clone(), profile.summarize(name)?);
        }

        let (peak_reserved_bytes, allocated_mem_at_peak) = nodes
            .values()
            .map(|s| (s.memory_reserved, s.memory_allocated))
            .max()
            .unwrap_or((0, 0));
        let max_mem_fragmentation = if peak_reserved_bytes == 0 {
            0.0
        } else {
            peak_reserved_bytes.saturating_sub(allocated_mem_at_peak) as f64 / peak_reserved_bytes as f64
        };

        Ok(Self {
            nodes,
            peak_reserved_bytes,
            allocated_mem_at_peak,
            max_mem_fragmentation,
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let profiles: BTreeMap<String, NodeProfile> = serde_json::from_str(json)?;
        Self::from_profiles(&profiles)
    }

    pub fn mean_runtime(&self, node: &str) -> Option<f64> {
        self.nodes.get(node).and_then(|s| s.mean_runtime)
    }

    /// Store the mean runtimes as node time estimates, matching nodes by
    /// name. Returns how many nodes were updated.
    pub fn apply_runtimes(&self, graph: &mut Graph<Raw>) -> Result<usize> {
        let mut applied = 0;
        for (name, summary) in &self.nodes {
            let Some(runtime) = summary.mean_runtime else {
                continue;
            };
            match graph.node_id(name) {
                Some(id) => {
                    graph.set_time(id, Some(runtime))?;
                    applied += 1;
                }
                None => debug!("profiled node '{}' is not in graph '{}'", name, graph.name()),
            }
        }
        Ok(applied)
    }
}
