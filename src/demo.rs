//! Demo processables and graph builder
//!
//! Small but real node kinds used by the CLI, the benchmark and the
//! integration tests: a sine generator, a gain stage with a delay line that
//! reports its latency, and a builder wiring several tracks into a master
//! port.

use crate::dispatcher::GraphBuilder;
use crate::error::ProcessError;
use crate::graph::Graph;
use crate::port::AudioPort;
use crate::processable::{EngineProcessTimeInfo, Processable, TransportSnapshot};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::f64::consts::PI;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Sine oscillator writing into its own output port
///
/// The waveform is a pure function of the absolute frame, so the generator
/// stays phase-correct however the timeline is split into blocks. A reported
/// latency of `L` frames delays the waveform by `L`: output is silent before
/// frame `L` and starts at phase zero there.
pub struct SineGenerator {
    name: String,
    frequency: f32,
    amplitude: f32,
    latency: AtomicU32,
    sample_rate: AtomicU32,
    output: Arc<AudioPort>,
}

impl SineGenerator {
    pub fn new(name: impl Into<String>, frequency: f32, amplitude: f32, num_channels: usize) -> Self {
        let name = name.into();
        let output = Arc::new(AudioPort::new(format!("{} out", name), num_channels));
        Self {
            name,
            frequency,
            amplitude,
            latency: AtomicU32::new(0),
            sample_rate: AtomicU32::new(0),
            output,
        }
    }

    pub fn with_latency(self, latency: u32) -> Self {
        self.set_latency(latency);
        self
    }

    pub fn set_latency(&self, latency: u32) {
        self.latency.store(latency, Ordering::Relaxed);
    }

    pub fn output(&self) -> &Arc<AudioPort> {
        &self.output
    }

    fn sample_at(&self, frame: u64, sample_rate: u32, latency: u32) -> f32 {
        let Some(t) = frame.checked_sub(u64::from(latency)) else {
            return 0.0;
        };
        let phase = t as f64 * f64::from(self.frequency) / f64::from(sample_rate);
        self.amplitude * (2.0 * PI * phase).sin() as f32
    }
}

impl Processable for SineGenerator {
    fn node_name(&self) -> String {
        self.name.clone()
    }

    fn single_playback_latency(&self) -> u32 {
        self.latency.load(Ordering::Relaxed)
    }

    fn prepare_for_processing(&self, sample_rate: u32, max_block_length: u32) {
        self.sample_rate.store(sample_rate, Ordering::Relaxed);
        self.output.prepare_for_processing(sample_rate, max_block_length);
    }

    fn release_resources(&self) {
        self.output.release_resources();
    }

    fn process_block(
        &self,
        time_info: EngineProcessTimeInfo,
        _transport: &TransportSnapshot,
    ) -> Result<(), ProcessError> {
        let sample_rate = self.sample_rate.load(Ordering::Relaxed);
        if sample_rate == 0 {
            return Err(ProcessError::NotPrepared);
        }
        let latency = self.single_playback_latency();
        let offset = time_info.local_offset as usize;
        let nframes = time_info.nframes as usize;

        self.output.with_buffer(|buf| {
            if offset + nframes > buf.num_frames() {
                return Err(ProcessError::BlockTooLarge {
                    requested: time_info.nframes,
                    offset: time_info.local_offset,
                    prepared: buf.num_frames(),
                });
            }
            for i in 0..nframes {
                let value = self.sample_at(time_info.start_frame_with_offset + i as u64, sample_rate, latency);
                for ch in 0..buf.num_channels() {
                    buf.channel_mut(ch)[offset + i] = value;
                }
            }
            Ok(())
        })
    }

    fn silence_output(&self, time_info: EngineProcessTimeInfo) {
        self.output.silence_output(time_info);
    }
}

/// Gain stage whose output is delayed by its reported latency
///
/// Stands in for a plugin with lookahead: it reads an upstream port and
/// writes the scaled, delayed signal into its own output port.
pub struct Gain {
    name: String,
    gain: f32,
    latency: u32,
    input: Arc<AudioPort>,
    output: Arc<AudioPort>,
    delay_lines: Mutex<Vec<VecDeque<f32>>>,
}

impl Gain {
    pub fn new(name: impl Into<String>, gain: f32, latency: u32, input: Arc<AudioPort>) -> Self {
        let name = name.into();
        let output = Arc::new(AudioPort::new(format!("{} out", name), input.num_channels()));
        Self {
            name,
            gain,
            latency,
            input,
            output,
            delay_lines: Mutex::new(Vec::new()),
        }
    }

    pub fn output(&self) -> &Arc<AudioPort> {
        &self.output
    }
}

impl Processable for Gain {
    fn node_name(&self) -> String {
        self.name.clone()
    }

    fn single_playback_latency(&self) -> u32 {
        self.latency
    }

    fn prepare_for_processing(&self, sample_rate: u32, max_block_length: u32) {
        self.output.prepare_for_processing(sample_rate, max_block_length);
        let line: VecDeque<f32> = std::iter::repeat(0.0).take(self.latency as usize).collect();
        *self.delay_lines.lock() = vec![line; self.output.num_channels()];
    }

    fn release_resources(&self) {
        self.output.release_resources();
        self.delay_lines.lock().clear();
    }

    fn process_block(
        &self,
        time_info: EngineProcessTimeInfo,
        _transport: &TransportSnapshot,
    ) -> Result<(), ProcessError> {
        let offset = time_info.local_offset as usize;
        let nframes = time_info.nframes as usize;
        let mut lines = self.delay_lines.lock();
        if lines.is_empty() {
            return Err(ProcessError::NotPrepared);
        }

        self.input.with_buffer(|input| {
            self.output.with_buffer(|output| {
                if offset + nframes > input.num_frames() || offset + nframes > output.num_frames() {
                    return Err(ProcessError::BlockTooLarge {
                        requested: time_info.nframes,
                        offset: time_info.local_offset,
                        prepared: output.num_frames(),
                    });
                }
                for (ch, line) in lines.iter_mut().enumerate() {
                    let src = input.channel(ch.min(input.num_channels().saturating_sub(1)));
                    let dst = output.channel_mut(ch);
                    for i in offset..offset + nframes {
                        line.push_back(src[i] * self.gain);
                        dst[i] = line.pop_front().unwrap_or(0.0);
                    }
                }
                Ok(())
            })
        })
    }

    fn silence_output(&self, time_info: EngineProcessTimeInfo) {
        self.output.silence_output(time_info);
    }
}

/// One demo track: a generator, optionally through a latent gain stage
struct DemoTrack {
    generator: Arc<SineGenerator>,
    fx: Option<Arc<Gain>>,
}

/// Builds `tracks → master` plus one generator routed nowhere
///
/// Odd tracks go through a [`Gain`] reporting `fx_latency` frames, so the
/// graph exercises latency compensation. The unrouted generator is removed
/// when the graph is pruned to [`terminals`](Self::terminals).
pub struct DemoGraphBuilder {
    tracks: Vec<DemoTrack>,
    unrouted: Arc<SineGenerator>,
    master: Arc<AudioPort>,
}

impl DemoGraphBuilder {
    pub fn new(num_tracks: usize, fx_latency: u32) -> Self {
        let master = Arc::new(AudioPort::stereo("master"));
        let amplitude = 0.5 / num_tracks.max(1) as f32;

        let tracks = (0..num_tracks)
            .map(|i| {
                let generator = Arc::new(SineGenerator::new(
                    format!("track {}", i + 1),
                    220.0 * (i + 1) as f32,
                    amplitude,
                    2,
                ));
                let fx = (i % 2 == 1).then(|| {
                    Arc::new(Gain::new(
                        format!("track {} fx", i + 1),
                        1.0,
                        fx_latency,
                        Arc::clone(generator.output()),
                    ))
                });
                let track_out = fx.as_ref().map_or(generator.output(), |fx| fx.output());
                master.add_source(Arc::clone(track_out));
                DemoTrack { generator, fx }
            })
            .collect();

        Self {
            tracks,
            unrouted: Arc::new(SineGenerator::new("unrouted", 1000.0, 0.5, 2)),
            master,
        }
    }

    pub fn master(&self) -> &Arc<AudioPort> {
        &self.master
    }

    /// Processables to prune the built graph to
    pub fn terminals(&self) -> Vec<Arc<dyn Processable>> {
        vec![Arc::clone(&self.master) as Arc<dyn Processable>]
    }

    pub fn num_tracks(&self) -> usize {
        self.tracks.len()
    }
}

impl GraphBuilder for DemoGraphBuilder {
    fn build_graph(&mut self, graph: &mut Graph) {
        let master = graph.add_node_for_processable(Arc::clone(&self.master) as Arc<dyn Processable>);

        for track in &self.tracks {
            let generator = graph.add_node_for_processable(Arc::clone(&track.generator) as Arc<dyn Processable>);
            let track_end = match &track.fx {
                Some(fx) => {
                    let fx = graph.add_node_for_processable(Arc::clone(fx) as Arc<dyn Processable>);
                    graph
                        .connect(generator, fx)
                        .expect("demo track nodes were just added");
                    fx
                }
                None => generator,
            };
            graph
                .connect(track_end, master)
                .expect("demo track and master nodes were just added");
        }

        graph.add_node_for_processable(Arc::clone(&self.unrouted) as Arc<dyn Processable>);
    }
}
