//! Node arena of a processing graph
//!
//! Owns every [`GraphNode`], derives which nodes are terminals (no feeds)
//! and triggers (no depends), and aggregates route latencies.
//!
//! # Latency
//! ```text
//! route(n) = single(n) + max(route(f) for f in feeds(n))
//! ```
//! The maximum route latency over all nodes is the longest-path latency to
//! any terminal and sizes the global latency preroll.

use crate::error::GraphError;
use crate::graph_node::{GraphNode, NodeId};
use crate::processable::{same_processable, Processable};
use petgraph::algo::toposort;
use petgraph::dot::{Config, Dot};
use petgraph::graph::DiGraph;
use std::collections::VecDeque;
use std::fmt::Write;
use std::sync::Arc;
use tracing::debug;

#[derive(Default)]
pub struct GraphNodeCollection {
    nodes: Vec<GraphNode>,

    /// Indices of nodes with no feeds
    terminal_nodes: Vec<usize>,

    /// Indices of nodes with no depends
    trigger_nodes: Vec<usize>,

    /// Dependency order (depends before feeds), computed by `finalize_nodes`
    topo_order: Vec<usize>,

    next_id: u32,
}

impl GraphNodeCollection {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    /// Node by arena index
    pub fn node(&self, index: usize) -> &GraphNode {
        &self.nodes[index]
    }

    /// Arena index of `id`
    ///
    /// Nodes are kept sorted by id, so this is a binary search.
    pub fn index_of(&self, id: NodeId) -> Option<usize> {
        self.nodes.binary_search_by_key(&id, GraphNode::id).ok()
    }

    pub fn node_by_id(&self, id: NodeId) -> Option<&GraphNode> {
        self.index_of(id).map(|i| &self.nodes[i])
    }

    pub fn terminal_nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.terminal_nodes.iter().map(|&i| &self.nodes[i])
    }

    pub fn trigger_nodes(&self) -> impl Iterator<Item = &GraphNode> {
        self.trigger_nodes.iter().map(|&i| &self.nodes[i])
    }

    pub(crate) fn terminal_indices(&self) -> &[usize] {
        &self.terminal_nodes
    }

    pub(crate) fn trigger_indices(&self) -> &[usize] {
        &self.trigger_nodes
    }

    /// Node wrapping `processable`, or `None` if it is not part of this graph
    pub fn find_node_for_processable(&self, processable: &Arc<dyn Processable>) -> Option<&GraphNode> {
        self.nodes
            .iter()
            .find(|n| same_processable(n.processable(), processable))
    }

    pub(crate) fn add_node(&mut self, processable: Arc<dyn Processable>) -> NodeId {
        let id = NodeId(self.next_id);
        self.next_id += 1;
        self.nodes.push(GraphNode::new(id, processable));
        id
    }

    /// Add an edge `from` feeds `to`, keeping both edge lists in sync
    ///
    /// Connecting an already connected pair is a no-op. Longer cycles are not
    /// detected here; see [`is_valid`](Self::is_valid).
    pub(crate) fn connect(&mut self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        if from == to {
            return Err(GraphError::SelfLoop(from));
        }
        let src = self.index_of(from).ok_or(GraphError::UnknownNode(from))?;
        let dst = self.index_of(to).ok_or(GraphError::UnknownNode(to))?;

        if self.nodes[src].feeds.contains(&dst) {
            return Ok(());
        }
        self.nodes[src].feeds.push(dst);
        self.nodes[dst].depends.push(src);
        Ok(())
    }

    /// Recompute terminal/trigger classification, dependency order, route
    /// latencies and per-cycle counters
    ///
    /// Must follow any edge mutation and precede scheduling.
    pub fn finalize_nodes(&mut self) {
        self.terminal_nodes.clear();
        self.trigger_nodes.clear();

        for (index, node) in self.nodes.iter_mut().enumerate() {
            node.terminal = node.feeds.is_empty();
            node.trigger = node.depends.is_empty();
            if node.terminal {
                self.terminal_nodes.push(index);
            }
            if node.trigger {
                self.trigger_nodes.push(index);
            }
            node.reset_pending();
        }

        self.topo_order = self.dependency_order();
        debug_assert!(
            self.topo_order.len() == self.nodes.len(),
            "processing graph contains a cycle"
        );
        debug_assert!(self.is_valid(), "processing graph failed validation");

        self.update_latencies();
    }

    /// Kahn's algorithm; nodes caught in a cycle are left out
    fn dependency_order(&self) -> Vec<usize> {
        let mut remaining: Vec<usize> = self.nodes.iter().map(|n| n.depends.len()).collect();
        let mut ready: VecDeque<usize> = self.trigger_nodes.iter().copied().collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(index) = ready.pop_front() {
            order.push(index);
            for &feed in &self.nodes[index].feeds {
                remaining[feed] -= 1;
                if remaining[feed] == 0 {
                    ready.push_back(feed);
                }
            }
        }
        order
    }

    /// Recompute route latencies without touching connectivity
    ///
    /// Cheap and idempotent; used when only a node's own latency changed.
    pub fn update_latencies(&self) {
        for &index in self.topo_order.iter().rev() {
            let node = &self.nodes[index];
            let downstream = node
                .feeds
                .iter()
                .map(|&f| self.nodes[f].route_playback_latency())
                .max()
                .unwrap_or(0);
            node.set_route_playback_latency(node.single_playback_latency() + downstream);
        }
    }

    /// Worst-case accumulated latency to any terminal, in frames
    pub fn max_route_playback_latency(&self) -> u32 {
        self.trigger_nodes()
            .map(GraphNode::route_playback_latency)
            .max()
            .unwrap_or(0)
    }

    /// Length of the next preroll cycle, at most `max_frames`
    ///
    /// A cycle never crosses the frame where a trigger route starts rolling,
    /// i.e. where `remaining_preroll` drops to that route's latency, so the
    /// route runs from exactly that frame on.
    pub fn preroll_block_length(&self, remaining_preroll: u32, max_frames: u32) -> u32 {
        self.trigger_nodes()
            .map(GraphNode::route_playback_latency)
            .filter(|&route| route < remaining_preroll)
            .fold(max_frames.min(remaining_preroll), |nframes, route| {
                nframes.min(remaining_preroll - route)
            })
    }

    /// Keep only nodes whose flag in `keep` is set, dropping every edge that
    /// touches a removed node and remapping the survivors' indices
    pub(crate) fn retain_nodes(&mut self, keep: &[bool]) {
        debug_assert_eq!(keep.len(), self.nodes.len());

        let mut remap = vec![usize::MAX; self.nodes.len()];
        let mut next = 0;
        for (old, &kept) in keep.iter().enumerate() {
            if kept {
                remap[old] = next;
                next += 1;
            }
        }

        let old_nodes = std::mem::take(&mut self.nodes);
        for (old, mut node) in old_nodes.into_iter().enumerate() {
            if !keep[old] {
                continue;
            }
            node.depends.retain(|&d| keep[d]);
            node.feeds.retain(|&f| keep[f]);
            for d in &mut node.depends {
                *d = remap[*d];
            }
            for f in &mut node.feeds {
                *f = remap[*f];
            }
            self.nodes.push(node);
        }
    }

    /// Call `prepare_for_processing` on every processable
    pub(crate) fn prepare_all(&self, sample_rate: u32, max_block_length: u32) {
        for node in &self.nodes {
            node.processable().prepare_for_processing(sample_rate, max_block_length);
        }
        debug!(
            "Prepared {} nodes ({} Hz, {} frames)",
            self.nodes.len(),
            sample_rate,
            max_block_length
        );
    }

    /// Call `release_resources` on every processable
    pub(crate) fn release_all(&self) {
        for node in &self.nodes {
            node.processable().release_resources();
        }
    }

    /// Structural self-check
    ///
    /// Verifies edge symmetry, absence of self-loops and cycles, index bounds
    /// and the terminal/trigger classification. Not meant for the realtime path.
    pub fn is_valid(&self) -> bool {
        let n = self.nodes.len();
        for (index, node) in self.nodes.iter().enumerate() {
            if node.feeds.iter().chain(&node.depends).any(|&i| i >= n || i == index) {
                return false;
            }
            if node.feeds.iter().any(|&f| !self.nodes[f].depends.contains(&index)) {
                return false;
            }
            if node.depends.iter().any(|&d| !self.nodes[d].feeds.contains(&index)) {
                return false;
            }
            if node.terminal != node.feeds.is_empty() || node.trigger != node.depends.is_empty() {
                return false;
            }
        }
        toposort(&self.to_petgraph(), None).is_ok()
    }

    /// Copy of the topology as a petgraph graph, weighted by node label
    pub fn to_petgraph(&self) -> DiGraph<String, ()> {
        let mut graph = DiGraph::with_capacity(self.nodes.len(), 0);
        let indices: Vec<_> = self
            .nodes
            .iter()
            .map(|n| graph.add_node(format!("{} {}", n.id(), n.name())))
            .collect();
        for (index, node) in self.nodes.iter().enumerate() {
            for &feed in &node.feeds {
                graph.add_edge(indices[index], indices[feed], ());
            }
        }
        graph
    }

    /// Textual node/edge listing for logs
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{} nodes, {} triggers, {} terminals, max route latency {}",
            self.nodes.len(),
            self.trigger_nodes.len(),
            self.terminal_nodes.len(),
            self.max_route_playback_latency()
        );
        for node in &self.nodes {
            let ids = |list: &[usize]| {
                list.iter()
                    .map(|&i| self.nodes[i].id().to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            };
            let _ = writeln!(
                out,
                "  {} '{}' latency={} route={} depends=[{}] feeds=[{}]",
                node.id(),
                node.name(),
                node.single_playback_latency(),
                node.route_playback_latency(),
                ids(&node.depends),
                ids(&node.feeds)
            );
        }
        out
    }

    /// Graphviz DOT export
    pub fn to_dot(&self) -> String {
        format!("{:?}", Dot::with_config(&self.to_petgraph(), &[Config::EdgeNoLabel]))
    }
}

impl std::fmt::Debug for GraphNodeCollection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GraphNodeCollection")
            .field("nodes", &self.nodes)
            .field("terminal_nodes", &self.terminal_nodes)
            .field("trigger_nodes", &self.trigger_nodes)
            .finish()
    }
}
