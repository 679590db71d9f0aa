//! Graph node: one processable plus its edges and per-cycle state
//!
//! Nodes live in a [`GraphNodeCollection`](crate::node_collection::GraphNodeCollection)
//! arena. Edges are plain indices into that arena, never shared ownership,
//! so moving the collection between owners and pruning it stay simple.

use crate::processable::{EngineProcessTimeInfo, Processable, TransportSnapshot};
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Stable identifier of a node within the graph it was created in
///
/// Ids are assigned sequentially and survive pruning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub(crate) u32);

impl NodeId {
    /// Returns the raw numeric identifier
    pub fn index(self) -> u32 {
        self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// What happened to a node in one cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeOutcome {
    Processed,
    /// Not audible yet during latency preroll
    Skipped,
    /// `process_block` returned an error or panicked; output was silenced
    Faulted,
}

pub struct GraphNode {
    id: NodeId,
    processable: Arc<dyn Processable>,

    /// Upstream nodes that must finish before this one runs (arena indices)
    pub(crate) depends: Vec<usize>,

    /// Downstream nodes (arena indices)
    pub(crate) feeds: Vec<usize>,

    pub(crate) terminal: bool,
    pub(crate) trigger: bool,

    /// Own latency plus the worst latency downstream of this node
    route_playback_latency: AtomicU32,

    /// Dependencies not yet finished in the current cycle
    pending: AtomicUsize,
}

impl GraphNode {
    pub(crate) fn new(id: NodeId, processable: Arc<dyn Processable>) -> Self {
        Self {
            id,
            processable,
            depends: Vec::new(),
            feeds: Vec::new(),
            terminal: true,
            trigger: true,
            route_playback_latency: AtomicU32::new(0),
            pending: AtomicUsize::new(0),
        }
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn processable(&self) -> &Arc<dyn Processable> {
        &self.processable
    }

    pub fn name(&self) -> String {
        self.processable.node_name()
    }

    /// Arena indices of the nodes this node depends on
    pub fn depends(&self) -> &[usize] {
        &self.depends
    }

    /// Arena indices of the nodes this node feeds
    pub fn feeds(&self) -> &[usize] {
        &self.feeds
    }

    /// No downstream consumers (a sink)
    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    /// No upstream dependencies; kicked off explicitly each cycle
    pub fn is_trigger(&self) -> bool {
        self.trigger
    }

    pub fn single_playback_latency(&self) -> u32 {
        self.processable.single_playback_latency()
    }

    pub fn route_playback_latency(&self) -> u32 {
        self.route_playback_latency.load(Ordering::Acquire)
    }

    pub(crate) fn set_route_playback_latency(&self, latency: u32) {
        self.route_playback_latency.store(latency, Ordering::Release);
    }

    /// Re-arm the dependency counter for the next cycle
    pub(crate) fn reset_pending(&self) {
        self.pending.store(self.depends.len(), Ordering::Release);
    }

    /// Record that one dependency finished; true when this node became ready
    pub(crate) fn dependency_finished(&self) -> bool {
        self.pending.fetch_sub(1, Ordering::AcqRel) == 1
    }

    /// Time info for this node, or `None` when it must sit out the block
    ///
    /// During preroll only nodes whose route latency covers the remaining
    /// preroll run. While rolling, a node runs ahead of the playhead by the
    /// latency still to be compensated downstream of it.
    pub fn compensated_time_info(
        &self,
        time_info: EngineProcessTimeInfo,
        remaining_preroll: u32,
        transport: &TransportSnapshot,
    ) -> Option<EngineProcessTimeInfo> {
        let route_latency = self.route_playback_latency();
        if route_latency < remaining_preroll {
            return None;
        }

        let mut info = time_info;
        if transport.is_rolling() {
            info.start_frame_with_offset += u64::from(route_latency - remaining_preroll);
        }
        Some(info)
    }

    /// Run the processable for one block, isolating failures
    pub(crate) fn process(
        &self,
        time_info: EngineProcessTimeInfo,
        remaining_preroll: u32,
        transport: &TransportSnapshot,
    ) -> NodeOutcome {
        let Some(info) = self.compensated_time_info(time_info, remaining_preroll, transport) else {
            return NodeOutcome::Skipped;
        };

        let result = catch_unwind(AssertUnwindSafe(|| {
            self.processable.process_block(info, transport)
        }));

        match result {
            Ok(Ok(())) => return NodeOutcome::Processed,
            Ok(Err(e)) => warn!("Node {} '{}' failed: {}", self.id, self.name(), e),
            Err(_) => warn!("Node {} '{}' panicked during process_block", self.id, self.name()),
        }

        let silenced = catch_unwind(AssertUnwindSafe(|| self.processable.silence_output(info)));
        if silenced.is_err() {
            warn!("Node {} panicked while silencing its output", self.id);
        }
        NodeOutcome::Faulted
    }
}

impl fmt::Debug for GraphNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GraphNode")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("depends", &self.depends)
            .field("feeds", &self.feeds)
            .field("route_playback_latency", &self.route_playback_latency())
            .finish()
    }
}
