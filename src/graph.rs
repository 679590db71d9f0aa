//! Transient graph builder
//!
//! A [`Graph`] exists only while a processing graph is (re)built: add nodes,
//! connect them, finalize, then hand the node collection over to a scheduler
//! with [`steal_nodes`](Graph::steal_nodes).
//!
//! # Example
//! ```ignore
//! let mut graph = Graph::new();
//! let synth = graph.add_node_for_processable(synth_processable);
//! let out = graph.add_node_for_processable(hw_output_port);
//! graph.connect(synth, out)?;
//! graph.finalize_nodes();
//!
//! scheduler.rechain_from_node_collection(graph.steal_nodes(), 48000, 256);
//! ```

use crate::error::GraphError;
use crate::graph_node::{GraphNode, NodeId};
use crate::node_collection::GraphNodeCollection;
use crate::processable::Processable;
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct Graph {
    nodes: GraphNodeCollection,

    /// Set by `steal_nodes`, cleared when nodes are added again
    stolen: bool,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a node wrapping `processable`
    ///
    /// The returned id stays valid for the lifetime of the node collection,
    /// including after pruning (for surviving nodes).
    pub fn add_node_for_processable(&mut self, processable: Arc<dyn Processable>) -> NodeId {
        self.stolen = false;
        self.nodes.add_node(processable)
    }

    /// `from` feeds `to`; updates both nodes' edge lists
    ///
    /// Self-loops are rejected. Longer cycles are a caller precondition,
    /// checked only by [`is_valid`](Self::is_valid).
    pub fn connect(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        self.nodes.connect(from, to)
    }

    /// Recompute terminal/trigger nodes and latencies after edge changes
    pub fn finalize_nodes(&mut self) {
        self.nodes.finalize_nodes();
    }

    /// Node wrapping `processable`, `None` if it is not part of this graph
    pub fn find_node_for_processable(&self, processable: &Arc<dyn Processable>) -> Option<NodeId> {
        self.nodes
            .find_node_for_processable(processable)
            .map(GraphNode::id)
    }

    pub fn nodes(&self) -> &GraphNodeCollection {
        &self.nodes
    }

    pub(crate) fn nodes_mut(&mut self) -> &mut GraphNodeCollection {
        &mut self.nodes
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn is_valid(&self) -> bool {
        self.nodes.is_valid()
    }

    /// Move the node collection out, leaving this graph empty
    ///
    /// Intended for exactly one transfer per build cycle.
    pub fn steal_nodes(&mut self) -> GraphNodeCollection {
        debug_assert!(!self.stolen, "graph nodes were already stolen");
        self.stolen = true;
        std::mem::take(&mut self.nodes)
    }
}
