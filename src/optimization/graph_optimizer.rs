use std::collections::{HashMap, HashSet};
use std::time::Duration;

use log::debug;

use crate::error::{Error, Result};
use crate::model::{Graph, Raw};

/// Result of running a normalization pass
#[derive(Debug, Clone)]
pub struct PassResult {
    /// Name of the pass
    pub name: String,
    /// Number of rewrites applied
    pub optimizations_applied: usize,
    /// Duration of the pass
    pub duration: Duration,
    /// Whether the pass made any changes
    pub changed: bool,
}

/// Statistics from running normalization passes
#[derive(Debug, Clone, Default)]
pub struct OptimizationStats {
    /// Results from each pass
    pub pass_results: Vec<PassResult>,
    /// Total number of rewrites applied
    pub total_optimizations: usize,
    /// Total time spent in passes
    pub total_duration: Duration,
}

impl OptimizationStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a pass result
    pub fn add_pass_result(&mut self, result: PassResult) {
        self.total_optimizations += result.optimizations_applied;
        self.total_duration += result.duration;
        self.pass_results.push(result);
    }
}

/// A rewrite applied to a raw graph before it is sealed
pub trait NormalizationPass: Send + Sync {
    /// Name of the pass
    fn name(&self) -> &str;

    /// Run the pass on the graph
    fn run(&self, graph: &mut Graph<Raw>) -> Result<PassResult>;

    /// Names of passes that must run before this one
    fn dependencies(&self) -> Vec<&str> {
        Vec::new()
    }
}

/// Runs registered passes in dependency order
pub struct GraphOptimizer {
    passes: Vec<Box<dyn NormalizationPass>>,
}

impl Default for GraphOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

impl GraphOptimizer {
    pub fn new() -> Self {
        Self { passes: Vec::new() }
    }

    /// Register a pass
    pub fn register_pass(&mut self, pass: Box<dyn NormalizationPass>) {
        self.passes.push(pass);
    }

    /// Register canonicalization plus the weight-update and tensor-generator constraints
    pub fn with_default_passes(mut self) -> Self {
        for pass in Self::create_default_passes() {
            self.register_pass(pass);
        }
        self
    }

    pub fn create_default_passes() -> Vec<Box<dyn NormalizationPass>> {
        use crate::optimization::passes::canonicalize::Canonicalize;
        use crate::optimization::passes::tensor_generators::ConstrainTensorGenerators;
        use crate::optimization::passes::weight_updates::ConstrainWeightUpdates;

        vec![
            Box::new(ConstrainWeightUpdates::new()) as Box<dyn NormalizationPass>,
            Box::new(ConstrainTensorGenerators::new()) as Box<dyn NormalizationPass>,
            Box::new(Canonicalize::new()) as Box<dyn NormalizationPass>,
        ]
    }

    /// Run every registered pass
    pub fn run(&self, graph: &mut Graph<Raw>) -> Result<OptimizationStats> {
        self.run_passes(graph, &self.passes)
    }

    /// Run the given passes, dependencies first
    pub fn run_passes(
        &self,
        graph: &mut Graph<Raw>,
        passes: &[Box<dyn NormalizationPass>],
    ) -> Result<OptimizationStats> {
        let mut stats = OptimizationStats::new();

        for pass in self.sort_passes_by_dependencies(passes)? {
            let result = pass.run(graph)?;
            debug!(
                "pass {} applied {} rewrites in {:?}",
                result.name, result.optimizations_applied, result.duration
            );
            stats.add_pass_result(result);
        }

        Ok(stats)
    }

    fn sort_passes_by_dependencies<'a>(
        &self,
        passes: &'a [Box<dyn NormalizationPass>],
    ) -> Result<Vec<&'a dyn NormalizationPass>> {
        let mut sorted_passes = Vec::new();
        let mut visited = HashSet::new();
        let mut visiting = HashSet::new();

        let mut dep_graph: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut pass_map: HashMap<&str, &dyn NormalizationPass> = HashMap::new();

        for pass in passes {
            dep_graph.insert(pass.name(), pass.dependencies());
            pass_map.insert(pass.name(), pass.as_ref());
        }

        for pass in passes {
            if !visited.contains(pass.name()) {
                Self::dfs_sort(
                    pass.name(),
                    &dep_graph,
                    &pass_map,
                    &mut visited,
                    &mut visiting,
                    &mut sorted_passes,
                )?;
            }
        }

        Ok(sorted_passes)
    }

    fn dfs_sort<'a, 'n>(
        pass_name: &'n str,
        dep_graph: &HashMap<&'n str, Vec<&'n str>>,
        pass_map: &HashMap<&'n str, &'a dyn NormalizationPass>,
        visited: &mut HashSet<&'n str>,
        visiting: &mut HashSet<&'n str>,
        sorted_passes: &mut Vec<&'a dyn NormalizationPass>,
    ) -> Result<()> {
        if visited.contains(pass_name) {
            return Ok(());
        }

        if !visiting.insert(pass_name) {
            return Err(Error::InvalidConfiguration(format!(
                "Cycle detected in pass dependencies: {}",
                pass_name
            )));
        }

        if let Some(deps) = dep_graph.get(pass_name) {
            for &dep in deps {
                if !pass_map.contains_key(dep) {
                    return Err(Error::InvalidConfiguration(format!(
                        "Pass '{}' depends on '{}', which is not registered",
                        pass_name, dep
                    )));
                }
                Self::dfs_sort(dep, dep_graph, pass_map, visited, visiting, sorted_passes)?;
            }
        }

        visiting.remove(pass_name);
        visited.insert(pass_name);

        if let Some(&pass) = pass_map.get(pass_name) {
            sorted_passes.push(pass);
        }

        Ok(())
    }
}
