use std::collections::HashSet;

use petgraph::algo::{has_path_connecting, DfsSpace};
use petgraph::graph::NodeIndex;

use crate::error::{Error, Result};
use crate::model::{Graph, GraphState, NodeId};

/// Add control edges so that `order` is respected by every topological order
/// of the graph. Returns the number of edges added.
///
/// Fails on unknown or repeated nodes and when the graph already forces a
/// later node of `order` before an earlier one.
pub(crate) fn apply<S: GraphState>(graph: &mut Graph<S>, order: &[NodeId], linearize: bool) -> Result<usize> {
    let mut seen = HashSet::with_capacity(order.len());
    for &node in order {
        if graph.node(node).is_none() {
            return Err(Error::UnknownNode(node.0));
        }
        if !seen.insert(node) {
            return Err(Error::InvalidConfiguration(format!(
                "Node {} appears more than once in the requested ordering",
                node
            )));
        }
    }

    let mut deps = graph.dependency_graph();
    let mut space = DfsSpace::new(&deps);
    let mut added = 0;

    for pair in order.windows(2) {
        let (before, after) = (pair[0], pair[1]);
        let (b, a) = (NodeIndex::new(before.0), NodeIndex::new(after.0));

        if has_path_connecting(&deps, a, b, Some(&mut space)) {
            return Err(Error::InvalidGraph(format!(
                "Requested ordering puts {} before {}, but {} must run first",
                before, after, after
            )));
        }

        let needed = if linearize {
            !graph.has_direct_dependency(before, after)
        } else {
            !has_path_connecting(&deps, b, a, Some(&mut space))
        };
        if needed {
            let edge = graph.add_control_dependency(before, after)?;
            deps.add_edge(b, a, edge);
            added += 1;
        }
    }

    Ok(added)
}
