//! Audio ports and planar sample buffers
//!
//! An [`AudioPort`] is the buffer-owning node kind of the graph: generators
//! write into their output port, and a port with source ports sums them when
//! it is processed. Hardware outputs and master buses are ports, which makes
//! them the natural terminals of a graph.

use crate::error::{ProcessError, RenderError};
use crate::processable::{EngineProcessTimeInfo, Processable, TransportSnapshot};
use crate::renderer::BitDepth;
use parking_lot::{Mutex, RwLock};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Planar multi-channel sample storage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioBuffer {
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Zeroed buffer with `num_channels` channels of `num_frames` frames
    pub fn new(num_channels: usize, num_frames: usize) -> Self {
        Self {
            channels: vec![vec![0.0; num_frames]; num_channels],
        }
    }

    pub fn num_channels(&self) -> usize {
        self.channels.len()
    }

    pub fn num_frames(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel(&self, channel: usize) -> &[f32] {
        &self.channels[channel]
    }

    pub fn channel_mut(&mut self, channel: usize) -> &mut [f32] {
        &mut self.channels[channel]
    }

    /// Resize every channel, zero-filling new frames
    pub fn resize(&mut self, num_frames: usize) {
        for channel in &mut self.channels {
            channel.resize(num_frames, 0.0);
        }
    }

    /// Drop the sample memory while keeping the channel count
    pub fn free(&mut self) {
        for channel in &mut self.channels {
            *channel = Vec::new();
        }
    }

    /// Zero `nframes` frames starting at `offset` (clamped to the buffer)
    pub fn clear_region(&mut self, offset: usize, nframes: usize) {
        for channel in &mut self.channels {
            let start = offset.min(channel.len());
            let end = (offset + nframes).min(channel.len());
            channel[start..end].fill(0.0);
        }
    }

    /// Copy a region of `src` into this buffer
    ///
    /// Channels missing on either side are skipped.
    pub fn copy_from(&mut self, src: &AudioBuffer, src_offset: usize, dst_offset: usize, nframes: usize) {
        for (dst, src) in self.channels.iter_mut().zip(&src.channels) {
            dst[dst_offset..dst_offset + nframes]
                .copy_from_slice(&src[src_offset..src_offset + nframes]);
        }
    }

    /// Accumulate a region of `src` into this buffer
    pub fn add_from(&mut self, src: &AudioBuffer, src_offset: usize, dst_offset: usize, nframes: usize) {
        for (dst, src) in self.channels.iter_mut().zip(&src.channels) {
            for (d, s) in dst[dst_offset..dst_offset + nframes]
                .iter_mut()
                .zip(&src[src_offset..src_offset + nframes])
            {
                *d += *s;
            }
        }
    }

    /// Peak absolute sample value over all channels
    pub fn peak(&self) -> f32 {
        self.channels
            .iter()
            .flat_map(|c| c.iter())
            .fold(0.0f32, |acc, s| acc.max(s.abs()))
    }

    /// Write the buffer as an interleaved WAV file
    ///
    /// 32-bit depth is written as float, other depths as clamped integers.
    pub fn write_wav(&self, path: &Path, sample_rate: u32, bit_depth: BitDepth) -> Result<(), RenderError> {
        let spec = hound::WavSpec {
            channels: self.num_channels() as u16,
            sample_rate,
            bits_per_sample: bit_depth.bits(),
            sample_format: if bit_depth == BitDepth::Bit32 {
                hound::SampleFormat::Float
            } else {
                hound::SampleFormat::Int
            },
        };

        let mut writer = hound::WavWriter::create(path, spec)?;
        let max = ((1i64 << (bit_depth.bits() - 1)) - 1) as f32;

        for frame in 0..self.num_frames() {
            for channel in &self.channels {
                let sample = channel[frame];
                if bit_depth == BitDepth::Bit32 {
                    writer.write_sample(sample)?;
                } else {
                    let clamped = sample.clamp(-1.0, 1.0);
                    writer.write_sample((clamped * max).round() as i32)?;
                }
            }
        }

        writer.finalize()?;
        debug!("Wrote {} frames to {:?}", self.num_frames(), path);
        Ok(())
    }
}

/// Buffer-owning audio node
///
/// Without sources the port is an output written by its owner (a generator,
/// a plugin). With sources, processing the port clears its block region and
/// sums the sources into it.
pub struct AudioPort {
    name: String,
    num_channels: usize,
    buffer: Mutex<AudioBuffer>,
    sources: RwLock<Vec<Arc<AudioPort>>>,
}

impl AudioPort {
    pub fn new(name: impl Into<String>, num_channels: usize) -> Self {
        Self {
            name: name.into(),
            num_channels,
            buffer: Mutex::new(AudioBuffer::new(num_channels, 0)),
            sources: RwLock::new(Vec::new()),
        }
    }

    /// Stereo port
    pub fn stereo(name: impl Into<String>) -> Self {
        Self::new(name, 2)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_channels(&self) -> usize {
        self.num_channels
    }

    /// Sum `source` into this port when it is processed
    ///
    /// The caller is responsible for the matching graph edge
    /// (source port feeds this port).
    pub fn add_source(&self, source: Arc<AudioPort>) {
        self.sources.write().push(source);
    }

    pub fn num_sources(&self) -> usize {
        self.sources.read().len()
    }

    /// Run `f` with exclusive access to the port buffer
    pub fn with_buffer<R>(&self, f: impl FnOnce(&mut AudioBuffer) -> R) -> R {
        f(&mut self.buffer.lock())
    }

    /// Copy a block region of this port into `dst`
    pub fn copy_into(&self, dst: &mut AudioBuffer, src_offset: usize, dst_offset: usize, nframes: usize) {
        dst.copy_from(&self.buffer.lock(), src_offset, dst_offset, nframes);
    }

    fn check_block(&self, buffer: &AudioBuffer, time_info: &EngineProcessTimeInfo) -> Result<(), ProcessError> {
        if buffer.num_frames() == 0 {
            return Err(ProcessError::NotPrepared);
        }
        let end = time_info.local_offset as usize + time_info.nframes as usize;
        if end > buffer.num_frames() {
            return Err(ProcessError::BlockTooLarge {
                requested: time_info.nframes,
                offset: time_info.local_offset,
                prepared: buffer.num_frames(),
            });
        }
        Ok(())
    }
}

impl Processable for AudioPort {
    fn node_name(&self) -> String {
        self.name.clone()
    }

    fn prepare_for_processing(&self, _sample_rate: u32, max_block_length: u32) {
        let mut buffer = self.buffer.lock();
        buffer.resize(max_block_length as usize);
        buffer.clear_region(0, max_block_length as usize);
    }

    fn release_resources(&self) {
        self.buffer.lock().free();
    }

    fn process_block(
        &self,
        time_info: EngineProcessTimeInfo,
        _transport: &TransportSnapshot,
    ) -> Result<(), ProcessError> {
        let sources = self.sources.read();
        if sources.is_empty() {
            return Ok(());
        }

        let mut buffer = self.buffer.lock();
        self.check_block(&buffer, &time_info)?;

        let offset = time_info.local_offset as usize;
        let nframes = time_info.nframes as usize;
        buffer.clear_region(offset, nframes);
        for source in sources.iter() {
            let src = source.buffer.lock();
            if src.num_frames() < offset + nframes {
                continue;
            }
            buffer.add_from(&src, offset, offset, nframes);
        }
        Ok(())
    }

    fn silence_output(&self, time_info: EngineProcessTimeInfo) {
        self.buffer
            .lock()
            .clear_region(time_info.local_offset as usize, time_info.nframes as usize);
    }

    fn as_audio_port(&self) -> Option<&AudioPort> {
        Some(self)
    }
}
