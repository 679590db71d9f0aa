//! Multi-threaded graph scheduler
//!
//! Persistent worker threads execute the nodes of the active
//! [`GraphNodeCollection`] once per audio block, each node as soon as all of
//! its dependencies finished in the current cycle.
//!
//! # Architecture
//!
//! ```text
//! Kickoff thread            Worker 1          Worker 2          Worker N
//!      |                        |                 |                 |
//!      |--[trigger A]---------->|                 |                 |
//!      |--[trigger B]---------------------------->|                 |
//!      |                     process A         process B            |
//!      |                        |--[C ready]------------------------>|
//!      |                        |                 |              process C
//!      |<-----------------------------------------------[terminals done]
//!   return
//! ```
//!
//! Each node carries an atomic counter of unfinished dependencies. A worker
//! that finishes a node re-arms that node's counter, decrements the counters
//! of the nodes it feeds and queues the ones that reach zero. When the last
//! terminal node finishes, the kickoff thread is released. A node therefore
//! runs exactly once per cycle and reads inputs written exactly once by its
//! upstream nodes, so output does not depend on thread interleaving.
//!
//! The active collection is published through an [`ArcSwap`], so a rechain
//! is a single pointer swap and workers never see a half-installed graph.

use crate::error::GraphError;
use crate::graph_node::NodeOutcome;
use crate::node_collection::GraphNodeCollection;
use crate::processable::{EngineProcessTimeInfo, TransportSnapshot};
use arc_swap::ArcSwap;
use crossbeam::channel::{bounded, unbounded, Receiver, RecvError, Sender};
use parking_lot::RwLock;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};
use tracing::{debug, info, trace, warn};

/// Marshals a closure onto a control/UI thread
pub type MainThreadRunner = Arc<dyn Fn(Box<dyn FnOnce() + Send>) + Send + Sync>;

/// Everything a node needs to know about the cycle it runs in
#[derive(Debug, Clone, Copy)]
struct CycleContext {
    time_info: EngineProcessTimeInfo,
    remaining_preroll: u32,
    transport: TransportSnapshot,
}

/// Work item sent to worker threads
enum WorkItem {
    /// Process the node at this arena index
    Process { index: usize, cycle: CycleContext },
    /// Shutdown signal
    Shutdown,
}

/// State shared between the scheduler and its workers
struct SchedulerShared {
    nodes: ArcSwap<GraphNodeCollection>,

    /// Terminal nodes not yet finished in the current cycle
    remaining_terminals: AtomicUsize,

    /// Signalled once per cycle when the last terminal finishes
    done_tx: Sender<()>,

    cycles: AtomicU64,
    faults: AtomicU64,
}

impl SchedulerShared {
    /// Process one node and queue the feeds that became ready
    fn run_node(
        &self,
        nodes: &GraphNodeCollection,
        index: usize,
        cycle: &CycleContext,
        schedule: &mut dyn FnMut(usize),
    ) {
        let node = nodes.node(index);
        // The countdown below must run whatever the node does
        let outcome = catch_unwind(AssertUnwindSafe(|| {
            node.process(cycle.time_info, cycle.remaining_preroll, &cycle.transport)
        }))
        .unwrap_or_else(|_| {
            warn!("Node {} unwound out of its fault handling", node.id());
            NodeOutcome::Faulted
        });
        if outcome == NodeOutcome::Faulted {
            self.faults.fetch_add(1, Ordering::Relaxed);
        }

        // Nobody touches this counter again until the next cycle
        node.reset_pending();

        for &feed in node.feeds() {
            if nodes.node(feed).dependency_finished() {
                schedule(feed);
            }
        }

        if node.is_terminal() && self.remaining_terminals.fetch_sub(1, Ordering::AcqRel) == 1 {
            let _ = self.done_tx.try_send(());
        }
    }
}

/// A single worker thread
struct Worker {
    id: usize,
    thread: Option<JoinHandle<()>>,
}

impl Worker {
    fn spawn(
        id: usize,
        pin_to_core: bool,
        shared: Arc<SchedulerShared>,
        work_rx: Receiver<WorkItem>,
        work_tx: Sender<WorkItem>,
    ) -> Result<Worker, GraphError> {
        let thread = thread::Builder::new()
            .name(format!("rtgraph-worker-{}", id))
            .spawn(move || {
                if pin_to_core {
                    let core_ids = core_affinity::get_core_ids().unwrap_or_default();
                    if let Some(core) = core_ids.get(id % core_ids.len().max(1)) {
                        if !core_affinity::set_for_current(*core) {
                            warn!("Could not set CPU affinity for graph worker {}", id);
                        }
                    }
                }

                Worker::run(&shared, &work_rx, &work_tx);
            })
            .map_err(GraphError::ThreadSpawn)?;

        Ok(Worker {
            id,
            thread: Some(thread),
        })
    }

    fn run(shared: &SchedulerShared, work_rx: &Receiver<WorkItem>, work_tx: &Sender<WorkItem>) {
        loop {
            match work_rx.recv() {
                Ok(WorkItem::Process { index, cycle }) => {
                    let nodes = shared.nodes.load();
                    shared.run_node(&nodes, index, &cycle, &mut |ready| {
                        let _ = work_tx.send(WorkItem::Process { index: ready, cycle });
                    });
                }
                Ok(WorkItem::Shutdown) => break,
                Err(RecvError) => break, // Channel closed
            }
        }
    }
}

/// Long-lived executor of a processing graph
///
/// # Lifecycle
/// ```text
/// new ─rechain─▶ idle ─start_threads─▶ running ─run_cycle*─▶ running
///                  ▲                                            │
///                  └──────────────── terminate_threads ◀────────┘
/// ```
///
/// `rechain_from_node_collection` and `run_cycle` must never overlap; the
/// caller serializes them (see [`GraphDispatcher`](crate::dispatcher::GraphDispatcher)).
/// Without started threads, `run_cycle` executes the graph inline on the
/// calling thread.
pub struct GraphScheduler {
    shared: Arc<SchedulerShared>,
    workers: Vec<Worker>,
    work_tx: Sender<WorkItem>,
    work_rx: Receiver<WorkItem>,
    done_rx: Receiver<()>,
    worker_ids: Arc<RwLock<Vec<ThreadId>>>,
    inline_queue: VecDeque<usize>,
    sample_rate: u32,
    block_length: u32,
    pin_threads: bool,
    run_on_main_thread: Option<MainThreadRunner>,
}

impl GraphScheduler {
    pub fn new() -> Self {
        let (work_tx, work_rx) = unbounded();
        let (done_tx, done_rx) = bounded(1);

        Self {
            shared: Arc::new(SchedulerShared {
                nodes: ArcSwap::from_pointee(GraphNodeCollection::new()),
                remaining_terminals: AtomicUsize::new(0),
                done_tx,
                cycles: AtomicU64::new(0),
                faults: AtomicU64::new(0),
            }),
            workers: Vec::new(),
            work_tx,
            work_rx,
            done_rx,
            worker_ids: Arc::new(RwLock::new(Vec::new())),
            inline_queue: VecDeque::new(),
            sample_rate: 0,
            block_length: 0,
            pin_threads: false,
            run_on_main_thread: None,
        }
    }

    /// Pin worker `i` to core `i` (modulo the core count) when threads start
    pub fn with_thread_pinning(mut self, pin: bool) -> Self {
        self.pin_threads = pin;
        self
    }

    /// Deallocate replaced node collections on the main thread
    pub fn with_main_thread_runner(mut self, runner: MainThreadRunner) -> Self {
        self.run_on_main_thread = Some(runner);
        self
    }

    /// Install a new node set
    ///
    /// Releases the processables of the previous set, then prepares every
    /// processable of the new one. Only safe while no cycle is in flight.
    pub fn rechain_from_node_collection(
        &mut self,
        nodes: GraphNodeCollection,
        sample_rate: u32,
        block_length: u32,
    ) {
        debug_assert!(nodes.is_valid(), "rechaining an invalid node collection");

        let old = self.shared.nodes.load_full();
        old.release_all();

        nodes.prepare_all(sample_rate, block_length);
        self.sample_rate = sample_rate;
        self.block_length = block_length;

        info!(
            "Rechained graph: {} nodes, {} terminals, max route latency {}",
            nodes.len(),
            nodes.terminal_indices().len(),
            nodes.max_route_playback_latency()
        );

        let previous = self.shared.nodes.swap(Arc::new(nodes));
        drop(old);
        if let Some(runner) = &self.run_on_main_thread {
            runner(Box::new(move || drop(previous)));
        }
    }

    /// The active node collection
    pub fn get_nodes(&self) -> Arc<GraphNodeCollection> {
        self.shared.nodes.load_full()
    }

    /// Recompute route latencies without touching connectivity
    pub fn update_latencies(&self) {
        self.shared.nodes.load().update_latencies();
    }

    /// Worst-case accumulated latency to any terminal, in frames
    pub fn get_max_route_playback_latency(&self) -> u32 {
        self.shared.nodes.load().max_route_playback_latency()
    }

    /// Length of the next preroll cycle of the active graph
    ///
    /// See [`GraphNodeCollection::preroll_block_length`].
    pub fn preroll_block_length(&self, remaining_preroll: u32, max_frames: u32) -> u32 {
        self.shared
            .nodes
            .load()
            .preroll_block_length(remaining_preroll, max_frames)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn block_length(&self) -> u32 {
        self.block_length
    }

    /// Spin up the worker pool
    ///
    /// `None` uses one worker per logical CPU.
    pub fn start_threads(&mut self, num_threads: Option<usize>) -> Result<(), GraphError> {
        if !self.workers.is_empty() {
            warn!("Graph worker threads already running");
            return Ok(());
        }

        let num_threads = num_threads.unwrap_or_else(num_cpus::get).max(1);
        for id in 0..num_threads {
            let worker = Worker::spawn(
                id,
                self.pin_threads,
                Arc::clone(&self.shared),
                self.work_rx.clone(),
                self.work_tx.clone(),
            );
            match worker {
                Ok(worker) => self.workers.push(worker),
                Err(e) => {
                    self.terminate_threads();
                    return Err(e);
                }
            }
        }

        *self.worker_ids.write() = self
            .workers
            .iter()
            .filter_map(|w| w.thread.as_ref().map(|t| t.thread().id()))
            .collect();

        info!("Started {} graph worker threads", num_threads);
        Ok(())
    }

    /// Join all workers; `run_cycle` then runs inline until restarted
    pub fn terminate_threads(&mut self) {
        if self.workers.is_empty() {
            return;
        }

        // Send shutdown signal to all workers
        for _ in 0..self.workers.len() {
            let _ = self.work_tx.send(WorkItem::Shutdown);
        }

        // Wait for all workers to finish
        for worker in &mut self.workers {
            if let Some(thread) = worker.thread.take() {
                if thread.join().is_err() {
                    warn!("Graph worker {} terminated abnormally", worker.id);
                }
            }
        }

        debug!("Terminated {} graph worker threads", self.workers.len());
        self.workers.clear();
        self.worker_ids.write().clear();
    }

    pub fn num_threads(&self) -> usize {
        self.workers.len()
    }

    /// Whether the calling thread is one of this scheduler's workers
    pub fn is_worker_thread(&self) -> bool {
        let current = thread::current().id();
        self.worker_ids.read().contains(&current)
    }

    /// Thread ids of the running workers
    pub fn worker_thread_ids(&self) -> Vec<ThreadId> {
        self.worker_ids.read().clone()
    }

    /// Execute the graph for one block
    ///
    /// Kicks off the trigger nodes and blocks until every terminal node has
    /// finished. `remaining_preroll` is the part of the latency preroll still
    /// ahead; nodes whose route latency is below it sit out the block.
    pub fn run_cycle(
        &mut self,
        time_info: EngineProcessTimeInfo,
        remaining_preroll: u32,
        transport: TransportSnapshot,
    ) {
        let nodes = self.shared.nodes.load_full();
        if nodes.is_empty() {
            return;
        }

        let cycle = CycleContext {
            time_info,
            remaining_preroll,
            transport,
        };
        trace!(
            "Cycle at {} ({} frames, preroll {})",
            time_info.start_frame,
            time_info.nframes,
            remaining_preroll
        );

        self.shared
            .remaining_terminals
            .store(nodes.terminal_indices().len(), Ordering::Release);

        if self.workers.is_empty() {
            self.run_inline(&nodes, &cycle);
        } else {
            for &index in nodes.trigger_indices() {
                let _ = self.work_tx.send(WorkItem::Process { index, cycle });
            }
            if self.done_rx.recv().is_err() {
                warn!("Graph cycle completion channel closed");
            }
        }

        self.shared.cycles.fetch_add(1, Ordering::Relaxed);
    }

    fn run_inline(&mut self, nodes: &GraphNodeCollection, cycle: &CycleContext) {
        let queue = &mut self.inline_queue;
        queue.clear();
        queue.extend(nodes.trigger_indices());

        while let Some(index) = queue.pop_front() {
            self.shared
                .run_node(nodes, index, cycle, &mut |ready| queue.push_back(ready));
        }

        let _ = self.done_rx.try_recv();
    }

    /// Number of cycles executed so far
    pub fn cycles_run(&self) -> u64 {
        self.shared.cycles.load(Ordering::Relaxed)
    }

    /// Number of node faults (errors or panics) so far
    pub fn fault_count(&self) -> u64 {
        self.shared.faults.load(Ordering::Relaxed)
    }
}

impl Default for GraphScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for GraphScheduler {
    fn drop(&mut self) {
        self.terminate_threads();
        self.shared.nodes.load().release_all();
    }
}
