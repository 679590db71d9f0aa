//! Graph pruning to a set of terminals
//!
//! Marks every node that can reach one of the given terminals by walking
//! `depends()` edges backwards, then removes the unmarked nodes along with
//! every edge touching them.
//!
//! # Example
//! ```text
//! A → B → C → D
//!     B → E
//!
//! prune to {E}  →  A → B → E
//! ```

use crate::graph::Graph;
use crate::graph_node::NodeId;
use crate::processable::Processable;
use std::sync::Arc;
use tracing::debug;

/// Shrink `graph` to the nodes on a path to one of `terminals`
///
/// Returns `false` and leaves the graph untouched when `terminals` is empty
/// (nothing routed to an output is an expected state, not an error).
/// Returns `true` whenever pruning ran, even if nothing was removed.
///
/// The walk uses an explicit stack, so deep chains cannot overflow; the
/// visited marks also make it terminate on graphs that violate the acyclic
/// precondition.
pub fn prune_graph_to_terminals(graph: &mut Graph, terminals: &[NodeId]) -> bool {
    if terminals.is_empty() {
        return false;
    }

    let nodes = graph.nodes();
    let mut visited = vec![false; nodes.len()];
    let mut stack: Vec<usize> = Vec::with_capacity(nodes.len());

    for &terminal in terminals {
        match nodes.index_of(terminal) {
            Some(index) => stack.push(index),
            None => debug_assert!(false, "pruning terminal {terminal} is not part of the graph"),
        }
    }

    while let Some(index) = stack.pop() {
        if visited[index] {
            continue;
        }
        visited[index] = true;
        stack.extend(nodes.node(index).depends().iter().filter(|&&d| !visited[d]));
    }

    let before = nodes.len();
    let graph_nodes = graph.nodes_mut();
    graph_nodes.retain_nodes(&visited);
    graph_nodes.finalize_nodes();

    debug!(
        "Pruned graph from {} to {} nodes ({} terminals requested)",
        before,
        graph_nodes.len(),
        terminals.len()
    );
    true
}

/// Prune to the nodes wrapping `processables`
///
/// Processables that are not part of the graph are skipped; if none of them
/// is, this behaves like an empty terminal set.
pub fn prune_graph_to_processables(graph: &mut Graph, processables: &[Arc<dyn Processable>]) -> bool {
    let terminals: Vec<NodeId> = processables
        .iter()
        .filter_map(|p| graph.find_node_for_processable(p))
        .collect();
    prune_graph_to_terminals(graph, &terminals)
}
