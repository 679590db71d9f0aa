//! Binding of the processing graph to the live engine
//!
//! The dispatcher owns the scheduler used for realtime playback. Control
//! threads call [`recalc_graph`](GraphDispatcher::recalc_graph) when the
//! project changes; the audio callback calls
//! [`start_cycle`](GraphDispatcher::start_cycle) once per block.
//!
//! Rebuilds happen in two phases:
//! ```text
//! control thread                          engine lock held
//! ─────────────────────────────────────   ─────────────────────
//! build_graph → finalize → dump
//! prune to terminals → dump
//! steal nodes                        ───▶ rechain scheduler
//!                                         (first build: install)
//! ```
//! Only the rechain runs under the engine lock, so the realtime path is
//! paused for as short as possible. The audio callback never blocks: while a
//! rebuild holds the scheduler, `start_cycle` skips the block.

use crate::error::GraphError;
use crate::graph::Graph;
use crate::node_collection::GraphNodeCollection;
use crate::processable::{EngineProcessTimeInfo, Processable, TransportSnapshot};
use crate::pruner::prune_graph_to_processables;
use crate::scheduler::{GraphScheduler, MainThreadRunner};
use arc_swap::ArcSwapOption;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tracing::{debug, info, trace, warn};

/// Populates a fresh graph from the live project model
pub trait GraphBuilder: Send {
    fn build_graph(&mut self, graph: &mut Graph);
}

impl<F> GraphBuilder for F
where
    F: FnMut(&mut Graph) + Send,
{
    fn build_graph(&mut self, graph: &mut Graph) {
        self(graph)
    }
}

/// Hardware audio interface parameters queried on every rebuild
pub trait AudioInterface: Send + Sync {
    fn sample_rate(&self) -> u32;

    fn block_length(&self) -> u32;

    /// Suggested realtime priority for processing threads, if the backend has one
    fn realtime_priority_hint(&self) -> Option<i32> {
        None
    }
}

/// Audio interface with fixed parameters (offline use, tests)
#[derive(Debug, Clone, Copy)]
pub struct FixedAudioInterface {
    pub sample_rate: u32,
    pub block_length: u32,
}

impl AudioInterface for FixedAudioInterface {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn block_length(&self) -> u32 {
        self.block_length
    }
}

/// Runs a closure while the realtime path is paused
pub type EngineLockRunner = Arc<dyn Fn(&mut dyn FnMut()) + Send + Sync>;

/// Engine lock runner that just calls the closure
///
/// Sufficient when nothing but `start_cycle` touches the scheduler, since
/// the scheduler slot is itself locked.
pub fn direct_engine_lock() -> EngineLockRunner {
    Arc::new(|f: &mut dyn FnMut()| f())
}

/// Who kicked off a cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KickoffContext {
    /// The hardware audio callback
    HardwareCallback,
    /// A manually triggered pass from a control thread
    Manual,
}

impl KickoffContext {
    fn to_u8(self) -> u8 {
        match self {
            KickoffContext::HardwareCallback => 1,
            KickoffContext::Manual => 2,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(KickoffContext::HardwareCallback),
            2 => Some(KickoffContext::Manual),
            _ => None,
        }
    }
}

/// Hook run at the start of every cycle, before dispatch
pub type CyclePreprocessor = Box<dyn Fn(&EngineProcessTimeInfo) + Send + Sync>;

pub struct GraphDispatcher {
    builder: Mutex<Box<dyn GraphBuilder>>,
    audio_interface: Arc<dyn AudioInterface>,
    run_under_engine_lock: EngineLockRunner,
    run_on_main_thread: Option<MainThreadRunner>,
    preprocessor: Option<CyclePreprocessor>,

    scheduler: Mutex<Option<GraphScheduler>>,
    terminal_processables: RwLock<Vec<Arc<dyn Processable>>>,
    num_threads: Option<usize>,
    pin_threads: bool,

    max_latency: AtomicU32,
    global_offset: AtomicU32,
    generation: AtomicU64,
    graph_setup_in_progress: AtomicBool,
    kickoff_thread: ArcSwapOption<ThreadId>,
    kickoff_context: AtomicU8,
    worker_threads: RwLock<Vec<ThreadId>>,
}

impl GraphDispatcher {
    pub fn new(
        builder: Box<dyn GraphBuilder>,
        audio_interface: Arc<dyn AudioInterface>,
        run_under_engine_lock: EngineLockRunner,
    ) -> Self {
        Self {
            builder: Mutex::new(builder),
            audio_interface,
            run_under_engine_lock,
            run_on_main_thread: None,
            preprocessor: None,
            scheduler: Mutex::new(None),
            terminal_processables: RwLock::new(Vec::new()),
            num_threads: None,
            pin_threads: false,
            max_latency: AtomicU32::new(0),
            global_offset: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            graph_setup_in_progress: AtomicBool::new(false),
            kickoff_thread: ArcSwapOption::empty(),
            kickoff_context: AtomicU8::new(0),
            worker_threads: RwLock::new(Vec::new()),
        }
    }

    /// Worker count for the scheduler (`None` = one per CPU) and core pinning
    pub fn with_threads(mut self, num_threads: Option<usize>, pin_threads: bool) -> Self {
        self.num_threads = num_threads;
        self.pin_threads = pin_threads;
        self
    }

    /// Forwarded to the scheduler for deallocating replaced graphs
    pub fn with_main_thread_runner(mut self, runner: MainThreadRunner) -> Self {
        self.run_on_main_thread = Some(runner);
        self
    }

    pub fn with_preprocessor(mut self, preprocessor: CyclePreprocessor) -> Self {
        self.preprocessor = Some(preprocessor);
        self
    }

    /// Processables the graph is pruned to on the next hard rebuild
    pub fn set_terminal_processables(&self, terminals: Vec<Arc<dyn Processable>>) {
        *self.terminal_processables.write() = terminals;
    }

    /// Rebuild the graph, or only refresh latencies when `soft`
    ///
    /// A soft recalc without an installed scheduler falls through to a full
    /// rebuild. On error the previously installed graph stays active.
    pub fn recalc_graph(&self, soft: bool) -> Result<(), GraphError> {
        if soft && self.refresh_latencies() {
            return Ok(());
        }

        info!("Recalculating processing graph");
        let sample_rate = self.audio_interface.sample_rate();
        let block_length = self.audio_interface.block_length();

        let mut graph = Graph::new();
        self.builder.lock().build_graph(&mut graph);
        graph.finalize_nodes();
        debug!("Graph before pruning:\n{}", graph.nodes().dump());

        let terminals = self.terminal_processables.read().clone();
        if prune_graph_to_processables(&mut graph, &terminals) {
            debug!("Graph after pruning:\n{}", graph.nodes().dump());
            debug!("Pruned graph (dot):\n{}", graph.nodes().to_dot());
        } else {
            info!(
                "No terminal processables in graph; keeping all {} nodes",
                graph.len()
            );
        }

        let nodes = graph.steal_nodes();

        // A fresh scheduler is not shared yet, so its threads can start
        // before the engine lock is taken
        let mut fresh = if self.scheduler.lock().is_none() {
            let mut scheduler = GraphScheduler::new().with_thread_pinning(self.pin_threads);
            if let Some(runner) = &self.run_on_main_thread {
                scheduler = scheduler.with_main_thread_runner(Arc::clone(runner));
            }
            if let Some(priority) = self.audio_interface.realtime_priority_hint() {
                debug!("Audio interface suggests realtime priority {}", priority);
            }
            scheduler.start_threads(self.num_threads)?;
            Some(scheduler)
        } else {
            None
        };

        self.graph_setup_in_progress.store(true, Ordering::Release);
        let mut nodes = Some(nodes);
        (self.run_under_engine_lock)(&mut || {
            let Some(nodes) = nodes.take() else {
                return;
            };
            let mut slot = self.scheduler.lock();
            if slot.is_none() {
                *slot = fresh.take();
            }
            if let Some(scheduler) = slot.as_mut() {
                scheduler.rechain_from_node_collection(nodes, sample_rate, block_length);
                self.max_latency
                    .store(scheduler.get_max_route_playback_latency(), Ordering::Release);
                self.generation.fetch_add(1, Ordering::AcqRel);
                *self.worker_threads.write() = scheduler.worker_thread_ids();
            }
        });
        self.graph_setup_in_progress.store(false, Ordering::Release);

        if nodes.is_some() {
            warn!("Engine lock runner did not run the graph installation");
        }

        info!(
            "Processing graph ready (max route latency {} frames)",
            self.get_max_route_playback_latency()
        );
        Ok(())
    }

    fn refresh_latencies(&self) -> bool {
        let mut refreshed = false;
        (self.run_under_engine_lock)(&mut || {
            if let Some(scheduler) = self.scheduler.lock().as_ref() {
                scheduler.update_latencies();
                let latency = scheduler.get_max_route_playback_latency();
                if self.max_latency.swap(latency, Ordering::AcqRel) != latency {
                    self.generation.fetch_add(1, Ordering::AcqRel);
                }
                refreshed = true;
            }
        });
        if refreshed {
            debug!(
                "Refreshed graph latencies (max route latency {} frames)",
                self.get_max_route_playback_latency()
            );
        }
        refreshed
    }

    /// Worst-case latency of the installed graph; 0 before the first build
    pub fn get_max_route_playback_latency(&self) -> u32 {
        self.max_latency.load(Ordering::Acquire)
    }

    /// Hook for merging live input before the cycle is dispatched
    pub fn preprocess_at_start_of_cycle(&self, time_info: &EngineProcessTimeInfo) {
        if let Some(preprocessor) = &self.preprocessor {
            preprocessor(time_info);
        }
    }

    /// Run one cycle on the installed graph
    ///
    /// Returns `false` when no graph is installed or a rebuild currently
    /// holds the scheduler; the block is skipped in that case.
    pub fn start_cycle(
        &self,
        transport: TransportSnapshot,
        time_info: EngineProcessTimeInfo,
        remaining_preroll: u32,
        context: KickoffContext,
    ) -> bool {
        debug_assert!(
            time_info.start_frame_with_offset >= time_info.start_frame,
            "offset start frame {} before start frame {}",
            time_info.start_frame_with_offset,
            time_info.start_frame
        );

        self.record_kickoff(context);

        let Some(mut slot) = self.scheduler.try_lock() else {
            trace!("Skipping cycle at {}: graph is being rebuilt", time_info.start_frame);
            return false;
        };
        let Some(scheduler) = slot.as_mut() else {
            return false;
        };

        let max_latency = scheduler.get_max_route_playback_latency();
        self.global_offset
            .store(max_latency.saturating_sub(remaining_preroll), Ordering::Release);

        scheduler.run_cycle(time_info, remaining_preroll, transport);
        true
    }

    /// Length of the next preroll cycle, at most `max_frames`
    ///
    /// Splits preroll blocks where a shorter-latency route starts rolling.
    /// Never blocks: while a rebuild holds the scheduler the cycle is skipped
    /// anyway, so the plain preroll bound is returned.
    pub fn preroll_block_length(&self, remaining_preroll: u32, max_frames: u32) -> u32 {
        match self.scheduler.try_lock() {
            Some(slot) => slot.as_ref().map_or(max_frames.min(remaining_preroll), |scheduler| {
                scheduler.preroll_block_length(remaining_preroll, max_frames)
            }),
            None => max_frames.min(remaining_preroll),
        }
    }

    /// Bumped whenever a new graph is installed or its max latency changes
    ///
    /// Playback compares it against the last value it saw to re-arm the
    /// latency preroll.
    pub fn graph_generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    fn record_kickoff(&self, context: KickoffContext) {
        self.kickoff_context.store(context.to_u8(), Ordering::Release);

        let current = thread::current().id();
        let known = self.kickoff_thread.load();
        if known.as_deref() != Some(&current) {
            drop(known);
            self.kickoff_thread.store(Some(Arc::new(current)));
        }
    }

    /// Context of the most recent `start_cycle`
    pub fn last_kickoff_context(&self) -> Option<KickoffContext> {
        KickoffContext::from_u8(self.kickoff_context.load(Ordering::Acquire))
    }

    /// Whether the caller is the thread that kicked off the last cycle
    pub fn is_processing_kickoff_thread(&self) -> bool {
        let current = thread::current().id();
        self.kickoff_thread.load().as_deref() == Some(&current)
    }

    /// Whether the caller is the kickoff thread or a graph worker
    pub fn is_processing_thread(&self) -> bool {
        if self.is_processing_kickoff_thread() {
            return true;
        }
        let current = thread::current().id();
        self.worker_threads.read().contains(&current)
    }

    /// Max route latency minus the remaining preroll of the last cycle
    pub fn global_offset(&self) -> u32 {
        self.global_offset.load(Ordering::Acquire)
    }

    /// True while a new node collection is being installed
    pub fn graph_setup_in_progress(&self) -> bool {
        self.graph_setup_in_progress.load(Ordering::Acquire)
    }

    /// Whether a graph has been built and installed
    pub fn has_graph(&self) -> bool {
        self.scheduler.lock().is_some()
    }

    /// The installed node collection
    pub fn nodes(&self) -> Option<Arc<GraphNodeCollection>> {
        self.scheduler.lock().as_ref().map(GraphScheduler::get_nodes)
    }

    /// Cycles run by the installed scheduler
    pub fn cycles_run(&self) -> u64 {
        self.scheduler.lock().as_ref().map_or(0, GraphScheduler::cycles_run)
    }

    /// Node faults seen by the installed scheduler
    pub fn fault_count(&self) -> u64 {
        self.scheduler.lock().as_ref().map_or(0, GraphScheduler::fault_count)
    }

    /// Tear down the scheduler, releasing every installed processable
    pub fn terminate(&self) {
        let mut taken = None;
        (self.run_under_engine_lock)(&mut || {
            taken = self.scheduler.lock().take();
        });
        if let Some(scheduler) = taken {
            info!("Terminating graph scheduler after {} cycles", scheduler.cycles_run());
            drop(scheduler);
        }
        self.max_latency.store(0, Ordering::Release);
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.worker_threads.write().clear();
    }
}

impl Drop for GraphDispatcher {
    fn drop(&mut self) {
        if let Some(scheduler) = self.scheduler.get_mut().take() {
            debug!("Dropping graph scheduler ({} cycles)", scheduler.cycles_run());
        }
    }
}
