//! Block-based processing capability for graph nodes
//!
//! This module defines the Processable trait, the unit of work that is plugged
//! into the processing graph (tracks, buses, plugins, hardware ports), plus the
//! per-cycle timing values handed to every node.

use crate::error::ProcessError;
use crate::port::AudioPort;
use std::sync::Arc;

/// Timing of one processing cycle
///
/// Passed to every node of the cycle. The scheduler only adjusts
/// `start_frame_with_offset` for per-node latency compensation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineProcessTimeInfo {
    /// Absolute start frame of the cycle on the timeline
    pub start_frame: u64,

    /// Start frame including latency/offset adjustments
    ///
    /// Never earlier than `start_frame`.
    pub start_frame_with_offset: u64,

    /// Offset into the block buffers where this cycle starts
    pub local_offset: u32,

    /// Number of frames to process
    pub nframes: u32,
}

impl EngineProcessTimeInfo {
    /// Time info for a block starting at `start_frame` with no offsets
    pub fn new(start_frame: u64, nframes: u32) -> Self {
        Self {
            start_frame,
            start_frame_with_offset: start_frame,
            local_offset: 0,
            nframes,
        }
    }
}

/// Transport play state at the time a cycle was kicked off
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PlayState {
    #[default]
    Stopped,
    Rolling,
}

/// Immutable view of the transport for one cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransportSnapshot {
    pub play_state: PlayState,

    /// Playhead position in frames
    pub playhead: u64,
}

impl TransportSnapshot {
    pub fn rolling_at(playhead: u64) -> Self {
        Self {
            play_state: PlayState::Rolling,
            playhead,
        }
    }

    pub fn stopped_at(playhead: u64) -> Self {
        Self {
            play_state: PlayState::Stopped,
            playhead,
        }
    }

    pub fn is_rolling(&self) -> bool {
        self.play_state == PlayState::Rolling
    }
}

/// Core trait for units of work in the processing graph
///
/// Processables are never owned by the graph machinery: nodes hold an
/// `Arc<dyn Processable>` and the same processable may be installed into a
/// new graph after a rebuild.
///
/// `process_block` is called from worker threads through `&self`, so
/// implementors keep their mutable state behind locks or atomics. Within one
/// cycle a processable is only ever processed once, after every node it
/// depends on has finished.
pub trait Processable: Send + Sync {
    /// Human-readable name for diagnostics and graph dumps
    fn node_name(&self) -> String;

    /// Latency in frames this processable adds to the signal passing through it
    ///
    /// Independent of the node's position in the graph.
    fn single_playback_latency(&self) -> u32 {
        0
    }

    /// Called once when installed into a scheduler, before any `process_block`
    fn prepare_for_processing(&self, _sample_rate: u32, _max_block_length: u32) {}

    /// Called once when removed from a scheduler, after the last `process_block`
    fn release_resources(&self) {}

    /// Process one block
    ///
    /// Reads inputs written this cycle by upstream nodes and writes outputs
    /// at `time_info.local_offset .. local_offset + nframes`.
    fn process_block(
        &self,
        time_info: EngineProcessTimeInfo,
        transport: &TransportSnapshot,
    ) -> Result<(), ProcessError>;

    /// Silence this processable's outputs for the given block
    ///
    /// Called by the scheduler when `process_block` fails or panics, so that
    /// downstream nodes read silence instead of stale data. Processables that
    /// own no output buffers keep the default no-op.
    fn silence_output(&self, _time_info: EngineProcessTimeInfo) {}

    /// Returns the audio port if this processable is one
    ///
    /// Used by the renderer to collect the terminal node's audio.
    fn as_audio_port(&self) -> Option<&AudioPort> {
        None
    }
}

/// Identity comparison of two processables (same allocation)
pub fn same_processable(a: &Arc<dyn Processable>, b: &Arc<dyn Processable>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
