pub mod graph_optimizer;
pub mod passes;

pub use graph_optimizer::{GraphOptimizer, NormalizationPass, OptimizationStats, PassResult};
