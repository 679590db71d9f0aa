//! Offline rendering of a processing graph
//!
//! Runs a pruned node collection through a private [`GraphScheduler`] as
//! fast as possible, block by block, and collects the terminal audio port
//! into one buffer. Execution semantics are the same as realtime playback,
//! including latency preroll, so a render matches what the engine would
//! play for the same nodes and range.

use crate::error::{GraphError, RenderError};
use crate::node_collection::GraphNodeCollection;
use crate::port::AudioBuffer;
use crate::processable::{EngineProcessTimeInfo, Processable, TransportSnapshot};
use crate::scheduler::GraphScheduler;
use serde::{Deserialize, Serialize};
use std::ops::Range;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info};

const DITHER_SEED: u64 = 0x7274_6772_6170_68;

/// Output sample format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum BitDepth {
    #[serde(rename = "8")]
    Bit8,
    #[default]
    #[serde(rename = "16")]
    Bit16,
    #[serde(rename = "24")]
    Bit24,
    /// 32-bit float, never quantized
    #[serde(rename = "32")]
    Bit32,
}

impl BitDepth {
    pub fn bits(self) -> u16 {
        match self {
            BitDepth::Bit8 => 8,
            BitDepth::Bit16 => 16,
            BitDepth::Bit24 => 24,
            BitDepth::Bit32 => 32,
        }
    }

    pub fn from_bits(bits: u16) -> Option<Self> {
        match bits {
            8 => Some(BitDepth::Bit8),
            16 => Some(BitDepth::Bit16),
            24 => Some(BitDepth::Bit24),
            32 => Some(BitDepth::Bit32),
            _ => None,
        }
    }

    /// Size of one quantization step in the [-1, 1] range, `None` for float
    fn quantization_step(self) -> Option<f32> {
        match self {
            BitDepth::Bit32 => None,
            other => Some(1.0 / (1u32 << (other.bits() - 1)) as f32),
        }
    }
}

/// Configuration for offline renders
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderOptions {
    pub bit_depth: BitDepth,

    /// Add TPDF dither before quantizing to `bit_depth`
    pub dither: bool,

    /// Sample rate in Hz
    pub sample_rate: u32,

    /// Maximum frames per processing cycle
    pub block_length: u32,

    /// Worker threads; 0 renders on the calling thread
    pub num_threads: usize,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            bit_depth: BitDepth::Bit16,
            dither: false,
            sample_rate: 48000,
            block_length: 256,
            num_threads: 2,
        }
    }
}

/// Cooperative cancellation flag shared with a running render
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct GraphRenderer {
    options: RenderOptions,
}

impl GraphRenderer {
    pub fn new(options: RenderOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &RenderOptions {
        &self.options
    }

    /// Render `range` (in frames) through `nodes`
    ///
    /// The result holds `range.len()` frames plus the graph's max route
    /// latency; the leading latency frames are preroll. A cancelled render
    /// returns [`RenderError::Cancelled`] and no audio.
    pub fn render(
        &self,
        nodes: GraphNodeCollection,
        range: Range<u64>,
        cancel: Option<&CancellationToken>,
    ) -> Result<AudioBuffer, RenderError> {
        self.render_with_progress(nodes, range, cancel, None)
    }

    fn render_with_progress(
        &self,
        nodes: GraphNodeCollection,
        range: Range<u64>,
        cancel: Option<&CancellationToken>,
        progress: Option<&AtomicU64>,
    ) -> Result<AudioBuffer, RenderError> {
        let terminal: Arc<dyn Processable> = nodes
            .terminal_nodes()
            .find(|node| node.processable().as_audio_port().is_some())
            .map(|node| Arc::clone(node.processable()))
            .ok_or(RenderError::NoAudioTerminal)?;
        let port = terminal.as_audio_port().ok_or(RenderError::NoAudioTerminal)?;

        let range_len = range.end.saturating_sub(range.start);
        if range_len == 0 {
            debug!("Empty render range, nothing to process");
            return Ok(AudioBuffer::new(port.num_channels(), 0));
        }

        let latency = nodes.max_route_playback_latency();
        let total = range_len + u64::from(latency);
        let block_length = self.options.block_length.max(1);
        let mut output = AudioBuffer::new(port.num_channels(), total as usize);

        info!(
            "Rendering frames {}..{} from '{}' ({} nodes, {} frames preroll)",
            range.start,
            range.end,
            port.name(),
            nodes.len(),
            latency
        );

        let mut scheduler = GraphScheduler::new();
        scheduler.rechain_from_node_collection(nodes, self.options.sample_rate, block_length);
        if self.options.num_threads > 0 {
            scheduler.start_threads(Some(self.options.num_threads))?;
        }

        let mut rng = fastrand::Rng::with_seed(DITHER_SEED);
        let mut remaining_preroll = latency;
        let mut position = range.start;
        let mut written: u64 = 0;

        while written < total {
            if cancel.is_some_and(CancellationToken::is_cancelled) {
                info!("Render cancelled at frame {}", position);
                scheduler.terminate_threads();
                return Err(RenderError::Cancelled);
            }

            let mut nframes = u64::from(block_length).min(total - written) as u32;
            if remaining_preroll > 0 {
                nframes = scheduler.preroll_block_length(remaining_preroll, nframes);
            }

            scheduler.run_cycle(
                EngineProcessTimeInfo::new(position, nframes),
                remaining_preroll,
                TransportSnapshot::rolling_at(position),
            );

            let offset = written as usize;
            port.copy_into(&mut output, 0, offset, nframes as usize);
            if self.options.dither {
                apply_dither(&mut output, offset, nframes as usize, self.options.bit_depth, &mut rng);
            }

            written += u64::from(nframes);
            if remaining_preroll > 0 {
                remaining_preroll -= nframes;
            } else {
                position += u64::from(nframes);
                if let Some(progress) = progress {
                    progress.store(position - range.start, Ordering::Release);
                }
            }
        }

        debug!(
            "Render finished: {} frames in {} cycles",
            total,
            scheduler.cycles_run()
        );
        Ok(output)
    }
}

/// Add TPDF dither and quantize a region of `buffer` to `bit_depth`
///
/// Float output is left untouched.
pub fn apply_dither(
    buffer: &mut AudioBuffer,
    offset: usize,
    nframes: usize,
    bit_depth: BitDepth,
    rng: &mut fastrand::Rng,
) {
    let Some(step) = bit_depth.quantization_step() else {
        return;
    };

    for ch in 0..buffer.num_channels() {
        let channel = buffer.channel_mut(ch);
        let end = (offset + nframes).min(channel.len());
        for sample in &mut channel[offset.min(end)..end] {
            let noise = (rng.f32() - rng.f32()) * step;
            *sample = (((*sample + noise) / step).round() * step).clamp(-1.0, 1.0);
        }
    }
}

/// A render running on its own thread
pub struct RenderHandle {
    cancel: CancellationToken,
    progress: Arc<AtomicU64>,
    total: u64,
    thread: Option<JoinHandle<Result<AudioBuffer, RenderError>>>,
}

impl RenderHandle {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Frames of the requested range rendered so far
    pub fn progress(&self) -> u64 {
        self.progress.load(Ordering::Acquire)
    }

    /// Progress in [0, 1]
    pub fn progress_fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        self.progress() as f64 / self.total as f64
    }

    pub fn is_finished(&self) -> bool {
        self.thread.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Block until the render is done
    ///
    /// Always reports [`RenderError::Cancelled`] once `cancel` was called,
    /// even if the last block completed in the meantime.
    pub fn wait(mut self) -> Result<AudioBuffer, RenderError> {
        let result = match self.thread.take() {
            Some(thread) => thread.join().map_err(|_| RenderError::ThreadPanicked)?,
            None => Err(RenderError::ThreadPanicked),
        };
        if self.cancel.is_cancelled() {
            return Err(RenderError::Cancelled);
        }
        result
    }
}

/// Start a render on a dedicated thread
pub fn render_run_async(
    options: RenderOptions,
    nodes: GraphNodeCollection,
    range: Range<u64>,
) -> Result<RenderHandle, RenderError> {
    let cancel = CancellationToken::new();
    let progress = Arc::new(AtomicU64::new(0));
    let total = range.end.saturating_sub(range.start);

    let thread = {
        let cancel = cancel.clone();
        let progress = Arc::clone(&progress);
        thread::Builder::new()
            .name("rtgraph-render".to_string())
            .spawn(move || {
                GraphRenderer::new(options).render_with_progress(
                    nodes,
                    range,
                    Some(&cancel),
                    Some(&progress),
                )
            })
            .map_err(|e| RenderError::Graph(GraphError::ThreadSpawn(e)))?
    };

    Ok(RenderHandle {
        cancel,
        progress,
        total,
        thread: Some(thread),
    })
}
