use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::marker::PhantomData;
use std::path::Path;

use log::{info, warn};
use petgraph::algo;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error as ThisError;

use crate::error::{Error, Result};
use crate::optimization::graph_optimizer::{GraphOptimizer, NormalizationPass, OptimizationStats, PassResult};
use crate::optimization::passes::canonicalize::Canonicalize;
use crate::optimization::passes::relative_ordering;
use crate::optimization::passes::tensor_generators::ConstrainTensorGenerators;
use crate::optimization::passes::weight_updates::ConstrainWeightUpdates;

/// Unique identifier for a node in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(pub usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Unique identifier for an edge (tensor buffer) in the graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(pub usize);

impl EdgeId {
    pub fn index(self) -> usize {
        self.0
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Classification of an operator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr)]
pub enum OpKind {
    /// Model input (activations, labels)
    Input,
    /// Trainable parameter
    Weight,
    /// Regular operator
    Compute,
    /// Optimizer step writing a new parameter value
    WeightUpdate,
    /// Random number generation or constant
    TensorGenerator,
    /// Terminal sink for graph outputs, added by canonicalization
    Output,
}

impl OpKind {
    /// Whether re-executing the operator reproduces its outputs
    pub fn is_rematerializable(self) -> bool {
        matches!(self, OpKind::Compute | OpKind::TensorGenerator)
    }
}

/// Whether the traced step updates parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum GraphMode {
    Training,
    Inference,
}

/// One operator execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub name: String,
    pub kind: OpKind,
    /// Execution time estimate in seconds
    #[serde(default)]
    pub time: Option<f64>,
    /// Ordered input edges
    #[serde(default)]
    pub fanin: Vec<EdgeId>,
    /// Ordered output edges
    #[serde(default)]
    pub fanout: Vec<EdgeId>,
}

impl Node {
    /// Execution time in seconds, zero for untimed nodes
    pub fn runtime(&self) -> f64 {
        match self.time {
            Some(t) if t.is_finite() && t > 0.0 => t,
            _ => 0.0,
        }
    }
}

/// One tensor buffer, or a control dependency when `size == 0`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub name: String,
    /// Size in bytes
    pub size: u64,
    pub producer: NodeId,
    /// Distinct consuming nodes
    #[serde(default)]
    pub sinks: Vec<NodeId>,
}

impl Edge {
    /// Control edges carry no memory
    pub fn is_control(&self) -> bool {
        self.size == 0
    }
}

mod sealed {
    pub trait Sealed {}
    impl Sealed for super::Raw {}
    impl Sealed for super::Normalized {}
}

/// Lifecycle stage of a [`Graph`]
pub trait GraphState: sealed::Sealed + fmt::Debug + Clone + Send + Sync + 'static {}

/// Freshly imported graph: mutable, not yet validated
#[derive(Debug, Clone, Copy, Default)]
pub struct Raw;

/// Canonicalized, constrained and validated graph
#[derive(Debug, Clone, Copy, Default)]
pub struct Normalized;

impl GraphState for Raw {}
impl GraphState for Normalized {}

/// A structural problem found by [`Graph::violations`]
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum GraphViolation {
    #[error("node {node} is stored at index {index}")]
    MisplacedNode { node: NodeId, index: usize },
    #[error("edge {edge} is stored at index {index}")]
    MisplacedEdge { edge: EdgeId, index: usize },
    #[error("edge {edge} references missing producer {producer}")]
    MissingProducer { edge: EdgeId, producer: NodeId },
    #[error("edge {edge} is missing from the fanout of its producer {producer}")]
    ProducerMismatch { edge: EdgeId, producer: NodeId },
    #[error("edge {edge} references missing sink {sink}")]
    MissingSink { edge: EdgeId, sink: NodeId },
    #[error("edge {edge} is missing from the fanin of its sink {sink}")]
    SinkMismatch { edge: EdgeId, sink: NodeId },
    #[error("node {node} references unknown edge {edge}")]
    DanglingEdge { node: NodeId, edge: EdgeId },
    #[error("node {node} reads edge {edge} without being one of its sinks")]
    FaninMismatch { node: NodeId, edge: EdgeId },
    #[error("node {node} lists edge {edge} as output but the edge is produced by {producer}")]
    FanoutMismatch { node: NodeId, edge: EdgeId, producer: NodeId },
    #[error("edge {edge} has no sinks")]
    NoSinks { edge: EdgeId },
    #[error("edge {edge} lists sink {sink} more than once")]
    DuplicateSink { edge: EdgeId, sink: NodeId },
    #[error("node {node} lists edge {edge} more than once")]
    DuplicateEdgeReference { node: NodeId, edge: EdgeId },
    #[error("edge {edge} is consumed by its own producer {node}")]
    SelfLoop { edge: EdgeId, node: NodeId },
    #[error("graph contains a cycle through node {node}")]
    Cycle { node: NodeId },
}

/// Serialized form of a graph, used by importers
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GraphDocument {
    name: String,
    mode: GraphMode,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
}

/// Dataflow graph of one training step
///
/// Nodes and edges live in dense arenas indexed by their ids. The type
/// parameter tracks normalization: importers build a `Graph<Raw>`, the
/// normalization passes turn it into a read-only `Graph<Normalized>`, and
/// only the latter is accepted by the simulator and the scheduler.
#[derive(Debug, Clone)]
pub struct Graph<S: GraphState = Normalized> {
    name: String,
    mode: GraphMode,
    nodes: Vec<Node>,
    edges: Vec<Edge>,
    name_index: HashMap<String, NodeId>,
    state: PhantomData<S>,
}

impl<S: GraphState> Graph<S> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> GraphMode {
        self.mode
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(id.0)
    }

    /// Look up a node by its name
    pub fn node_id(&self, name: &str) -> Option<NodeId> {
        self.name_index.get(name).copied()
    }

    /// Translate node names into ids
    pub fn resolve<T: AsRef<str>>(&self, names: &[T]) -> Result<Vec<NodeId>> {
        names
            .iter()
            .map(|name| {
                self.node_id(name.as_ref()).ok_or_else(|| {
                    Error::InvalidGraph(format!("No node named '{}'", name.as_ref()))
                })
            })
            .collect()
    }

    /// Nodes producing any fanin edge of `id` (control edges included)
    pub fn predecessors(&self, id: NodeId) -> Vec<NodeId> {
        let mut preds = Vec::new();
        if let Some(node) = self.node(id) {
            for &edge_id in &node.fanin {
                if let Some(edge) = self.edge(edge_id) {
                    if !preds.contains(&edge.producer) {
                        preds.push(edge.producer);
                    }
                }
            }
        }
        preds
    }

    /// Nodes consuming any fanout edge of `id` (control edges included)
    pub fn successors(&self, id: NodeId) -> Vec<NodeId> {
        let mut succs = Vec::new();
        if let Some(node) = self.node(id) {
            for &edge_id in &node.fanout {
                if let Some(edge) = self.edge(edge_id) {
                    for &sink in &edge.sinks {
                        if !succs.contains(&sink) {
                            succs.push(sink);
                        }
                    }
                }
            }
        }
        succs
    }

    /// Sum of the execution time estimates of all nodes
    pub fn total_runtime(&self) -> f64 {
        self.nodes.iter().map(Node::runtime).sum()
    }

    /// Sum of all non-control edge sizes
    pub fn total_edge_bytes(&self) -> u64 {
        self.edges.iter().map(|e| e.size).sum()
    }

    /// Deterministic topological order: Kahn's algorithm, smallest id first
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let n = self.nodes.len();
        let mut in_degree = vec![0usize; n];
        let mut successors: Vec<Vec<usize>> = vec![Vec::new(); n];

        for node in &self.nodes {
            for pred in self.predecessors(node.id) {
                if pred.0 < n && pred != node.id {
                    successors[pred.0].push(node.id.0);
                    in_degree[node.id.0] += 1;
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
            .filter(|&i| in_degree[i] == 0)
            .map(Reverse)
            .collect();
        let mut order = Vec::with_capacity(n);

        while let Some(Reverse(i)) = ready.pop() {
            order.push(NodeId(i));
            for &succ in &successors[i] {
                in_degree[succ] -= 1;
                if in_degree[succ] == 0 {
                    ready.push(Reverse(succ));
                }
            }
        }

        if order.len() != n {
            let stuck = (0..n).find(|&i| in_degree[i] > 0).unwrap_or(0);
            return Err(Error::InvalidGraph(format!(
                "Cycle detected in graph at node {}",
                NodeId(stuck)
            )));
        }

        Ok(order)
    }

    /// Dependency graph over nodes; petgraph index `i` is `NodeId(i)`
    pub(crate) fn dependency_graph(&self) -> DiGraph<NodeId, EdgeId> {
        let mut graph = DiGraph::with_capacity(self.nodes.len(), self.edges.len());
        for node in &self.nodes {
            graph.add_node(node.id);
        }
        for edge in &self.edges {
            if edge.producer.0 >= self.nodes.len() {
                continue;
            }
            for &sink in &edge.sinks {
                if sink.0 < self.nodes.len() {
                    graph.add_edge(NodeIndex::new(edge.producer.0), NodeIndex::new(sink.0), edge.id);
                }
            }
        }
        graph
    }

    /// Collect structural violations; stops at the first when `exhaustive` is false
    pub fn violations(&self, exhaustive: bool) -> Vec<GraphViolation> {
        let mut found = Vec::new();
        macro_rules! report {
            ($violation:expr) => {{
                found.push($violation);
                if !exhaustive {
                    return found;
                }
            }};
        }

        let n = self.nodes.len();
        let m = self.edges.len();

        for (index, node) in self.nodes.iter().enumerate() {
            if node.id.0 != index {
                report!(GraphViolation::MisplacedNode { node: node.id, index });
            }
        }
        for (index, edge) in self.edges.iter().enumerate() {
            if edge.id.0 != index {
                report!(GraphViolation::MisplacedEdge { edge: edge.id, index });
            }
        }

        for edge in &self.edges {
            match self.nodes.get(edge.producer.0) {
                None => report!(GraphViolation::MissingProducer { edge: edge.id, producer: edge.producer }),
                Some(producer) if !producer.fanout.contains(&edge.id) => {
                    report!(GraphViolation::ProducerMismatch { edge: edge.id, producer: edge.producer })
                }
                Some(_) => {}
            }
            if edge.sinks.is_empty() {
                report!(GraphViolation::NoSinks { edge: edge.id });
            }
            let mut seen = HashSet::new();
            for &sink in &edge.sinks {
                if !seen.insert(sink) {
                    report!(GraphViolation::DuplicateSink { edge: edge.id, sink });
                }
                if sink == edge.producer {
                    report!(GraphViolation::SelfLoop { edge: edge.id, node: sink });
                }
                match self.nodes.get(sink.0) {
                    None => report!(GraphViolation::MissingSink { edge: edge.id, sink }),
                    Some(node) if !node.fanin.contains(&edge.id) => {
                        report!(GraphViolation::SinkMismatch { edge: edge.id, sink })
                    }
                    Some(_) => {}
                }
            }
        }

        for node in &self.nodes {
            let mut seen = HashSet::new();
            for &edge_id in &node.fanin {
                if !seen.insert(edge_id) {
                    report!(GraphViolation::DuplicateEdgeReference { node: node.id, edge: edge_id });
                }
                match self.edges.get(edge_id.0) {
                    None => report!(GraphViolation::DanglingEdge { node: node.id, edge: edge_id }),
                    Some(edge) if !edge.sinks.contains(&node.id) => {
                        report!(GraphViolation::FaninMismatch { node: node.id, edge: edge_id })
                    }
                    Some(_) => {}
                }
            }
            let mut seen = HashSet::new();
            for &edge_id in &node.fanout {
                if !seen.insert(edge_id) {
                    report!(GraphViolation::DuplicateEdgeReference { node: node.id, edge: edge_id });
                }
                match self.edges.get(edge_id.0) {
                    None => report!(GraphViolation::DanglingEdge { node: node.id, edge: edge_id }),
                    Some(edge) if edge.producer != node.id => report!(GraphViolation::FanoutMismatch {
                        node: node.id,
                        edge: edge_id,
                        producer: edge.producer,
                    }),
                    Some(_) => {}
                }
            }
        }

        // Self loops are already reported above; toposort would flag them again.
        if n > 0 && m > 0 {
            let deps = self.dependency_graph();
            if let Err(cycle) = algo::toposort(&deps, None) {
                let node = deps[cycle.node_id()];
                if !found.iter().any(|v| matches!(v, GraphViolation::SelfLoop { node: looped, .. } if *looped == node)) {
                    report!(GraphViolation::Cycle { node });
                }
            }
        }

        found
    }

    /// Structural self-check: DAG-ness, reference consistency, no dangling
    /// producers or consumers. In verbose mode every violation is logged.
    pub fn is_valid(&self, verbose: bool) -> bool {
        let violations = self.violations(verbose);
        if verbose {
            for violation in &violations {
                warn!("graph '{}': {}", self.name, violation);
            }
        }
        violations.is_empty()
    }

    /// Like [`Graph::is_valid`] but returns the violations as an error
    pub fn validate(&self) -> Result<()> {
        let violations = self.violations(true);
        if violations.is_empty() {
            return Ok(());
        }
        let shown: Vec<String> = violations.iter().take(8).map(|v| v.to_string()).collect();
        let more = violations.len().saturating_sub(shown.len());
        Err(Error::InvalidGraph(if more > 0 {
            format!("{} (and {} more)", shown.join("; "), more)
        } else {
            shown.join("; ")
        }))
    }

    /// Serialize the graph into the importer JSON format
    pub fn to_json(&self) -> Result<String> {
        let document = GraphDocument {
            name: self.name.clone(),
            mode: self.mode,
            nodes: self.nodes.clone(),
            edges: self.edges.clone(),
        };
        Ok(serde_json::to_string_pretty(&document)?)
    }

    /// Write the graph to a JSON file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.to_json()?)?;
        Ok(())
    }

    pub(crate) fn node_mut(&mut self, id: NodeId) -> Result<&mut Node> {
        self.nodes.get_mut(id.0).ok_or(Error::UnknownNode(id.0))
    }

    pub(crate) fn edge_mut(&mut self, id: EdgeId) -> Result<&mut Edge> {
        self.edges.get_mut(id.0).ok_or(Error::UnknownEdge(id.0))
    }

    /// Control fanout edge of `node`, if it has one
    pub(crate) fn control_fanout(&self, node: NodeId) -> Option<EdgeId> {
        self.node(node)?
            .fanout
            .iter()
            .copied()
            .find(|&e| self.edges.get(e.0).map_or(false, Edge::is_control))
    }

    /// Whether some edge goes directly from `from` to `to`
    pub(crate) fn has_direct_dependency(&self, from: NodeId, to: NodeId) -> bool {
        self.node(from).map_or(false, |node| {
            node.fanout
                .iter()
                .any(|&e| self.edges.get(e.0).map_or(false, |edge| edge.sinks.contains(&to)))
        })
    }

    /// Force `from` to execute before `to`, reusing the control edge of
    /// `from` when it already has one
    pub(crate) fn add_control_dependency(&mut self, from: NodeId, to: NodeId) -> Result<EdgeId> {
        if from == to {
            return Err(Error::InvalidGraph(format!("Cannot order node {} after itself", from)));
        }
        if self.node(to).is_none() {
            return Err(Error::UnknownNode(to.0));
        }
        let edge_id = match self.control_fanout(from) {
            Some(edge_id) => edge_id,
            None => {
                let name = format!("{}:ctrl", self.node(from).ok_or(Error::UnknownNode(from.0))?.name);
                let edge_id = EdgeId(self.edges.len());
                self.edges.push(Edge {
                    id: edge_id,
                    name,
                    size: 0,
                    producer: from,
                    sinks: Vec::new(),
                });
                self.node_mut(from)?.fanout.push(edge_id);
                edge_id
            }
        };
        let edge = self.edge_mut(edge_id)?;
        if !edge.sinks.contains(&to) {
            edge.sinks.push(to);
        }
        let node = self.node_mut(to)?;
        if !node.fanin.contains(&edge_id) {
            node.fanin.push(edge_id);
        }
        Ok(edge_id)
    }

    /// Swap in rebuilt arenas (used by canonicalization)
    pub(crate) fn replace_contents(&mut self, nodes: Vec<Node>, edges: Vec<Edge>) {
        self.nodes = nodes;
        self.edges = edges;
        self.rebuild_name_index();
    }

    fn rebuild_name_index(&mut self) {
        self.name_index = self
            .nodes
            .iter()
            .map(|node| (node.name.clone(), node.id))
            .collect();
    }

    fn with_state<T: GraphState>(self) -> Graph<T> {
        Graph {
            name: self.name,
            mode: self.mode,
            nodes: self.nodes,
            edges: self.edges,
            name_index: self.name_index,
            state: PhantomData,
        }
    }
}

impl Graph<Raw> {
    /// Create an empty graph
    pub fn new(name: impl Into<String>, mode: GraphMode) -> Self {
        Self {
            name: name.into(),
            mode,
            nodes: Vec::new(),
            edges: Vec::new(),
            name_index: HashMap::new(),
            state: PhantomData,
        }
    }

    /// Add an operator; names must be unique
    pub fn add_node(&mut self, name: impl Into<String>, kind: OpKind, time: Option<f64>) -> Result<NodeId> {
        let name = name.into();
        if self.name_index.contains_key(&name) {
            return Err(Error::InvalidGraph(format!("Duplicate node name '{}'", name)));
        }
        let id = NodeId(self.nodes.len());
        self.name_index.insert(name.clone(), id);
        self.nodes.push(Node {
            id,
            name,
            kind,
            time,
            fanin: Vec::new(),
            fanout: Vec::new(),
        });
        Ok(id)
    }

    /// Add a tensor produced by `producer` and read by `sinks`
    pub fn add_edge(
        &mut self,
        producer: NodeId,
        sinks: &[NodeId],
        size: u64,
        name: impl Into<String>,
    ) -> Result<EdgeId> {
        if self.node(producer).is_none() {
            return Err(Error::UnknownNode(producer.0));
        }
        if let Some(missing) = sinks.iter().find(|s| self.node(**s).is_none()) {
            return Err(Error::UnknownNode(missing.0));
        }
        let id = EdgeId(self.edges.len());
        self.edges.push(Edge {
            id,
            name: name.into(),
            size,
            producer,
            sinks: Vec::new(),
        });
        self.node_mut(producer)?.fanout.push(id);
        for &sink in sinks {
            self.add_sink(id, sink)?;
        }
        Ok(id)
    }

    /// Register one more consumer of `edge`
    pub fn add_sink(&mut self, edge: EdgeId, sink: NodeId) -> Result<()> {
        if self.node(sink).is_none() {
            return Err(Error::UnknownNode(sink.0));
        }
        let record = self.edge_mut(edge)?;
        if !record.sinks.contains(&sink) {
            record.sinks.push(sink);
        }
        let node = self.node_mut(sink)?;
        if !node.fanin.contains(&edge) {
            node.fanin.push(edge);
        }
        Ok(())
    }

    /// Set or clear the execution time estimate of a node
    pub fn set_time(&mut self, node: NodeId, time: Option<f64>) -> Result<()> {
        self.node_mut(node)?.time = time;
        Ok(())
    }

    /// Rewrite into the normal form expected by the optimizer. Idempotent.
    pub fn canonicalize(&mut self) -> Result<PassResult> {
        Canonicalize::new().run(self)
    }

    /// Order every weight update after all readers of the old weight value
    pub fn constrain_weight_updates(&mut self) -> Result<PassResult> {
        ConstrainWeightUpdates::new().run(self)
    }

    /// Schedule single-consumer tensor generators right before their consumer
    pub fn constrain_tensor_generators(&mut self) -> Result<PassResult> {
        ConstrainTensorGenerators::new().run(self)
    }

    /// Run the standard normalization pipeline and seal the graph
    pub fn normalize(mut self) -> Result<Graph<Normalized>> {
        let stats: OptimizationStats = GraphOptimizer::new().with_default_passes().run(&mut self)?;
        info!(
            "normalized graph '{}': {} passes, {} rewrites in {:?}",
            self.name,
            stats.pass_results.len(),
            stats.total_optimizations,
            stats.total_duration
        );
        self.into_normalized()
    }

    /// Canonicalize and validate without adding ordering constraints
    pub fn into_normalized(mut self) -> Result<Graph<Normalized>> {
        self.canonicalize()?;
        self.validate()?;
        Ok(self.with_state())
    }

    /// Parse an importer JSON document
    pub fn from_json(json: &str) -> Result<Self> {
        let document: GraphDocument = serde_json::from_str(json)?;
        let mut graph = Self {
            name: document.name,
            mode: document.mode,
            nodes: document.nodes,
            edges: document.edges,
            name_index: HashMap::new(),
            state: PhantomData,
        };
        graph.rebuild_name_index();
        if graph.name_index.len() != graph.nodes.len() {
            return Err(Error::InvalidGraph("Duplicate node names in document".to_string()));
        }
        // Sinkless edges are tolerated here: canonicalization attaches them
        // to the output node. Anything else is a malformed document.
        let broken: Vec<String> = graph
            .violations(true)
            .into_iter()
            .filter(|v| {
                !matches!(
                    v,
                    GraphViolation::NoSinks { .. }
                        | GraphViolation::DuplicateSink { .. }
                        | GraphViolation::DuplicateEdgeReference { .. }
                )
            })
            .map(|v| v.to_string())
            .collect();
        if !broken.is_empty() {
            return Err(Error::InvalidGraph(broken.join("; ")));
        }
        Ok(graph)
    }

    /// Read an importer JSON document from disk
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json(&json)
    }
}

impl Graph<Normalized> {
    /// Freeze the relative order of `node_order` into the graph.
    ///
    /// With `linearize` every consecutive pair gets a direct control edge, so
    /// the listed nodes form a literal chain. Without it an edge is only added
    /// where no path already implies the order.
    pub fn constrain_relative_ordering(mut self, node_order: &[NodeId], linearize: bool) -> Result<Self> {
        let added = relative_ordering::apply(&mut self, node_order, linearize)?;
        self.validate()?;
        info!(
            "constrained relative ordering of {} nodes in '{}' ({} edges added)",
            node_order.len(),
            self.name,
            added
        );
        Ok(self)
    }
}
