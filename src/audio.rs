//! Real-time audio output using cpal
//!
//! The output callback is the kickoff thread of the processing graph: it
//! splits every hardware buffer into engine-sized blocks, runs one
//! dispatcher cycle per block and interleaves the master port into the
//! device buffer.

use crate::dispatcher::{FixedAudioInterface, GraphDispatcher, KickoffContext};
use crate::port::AudioPort;
use crate::processable::{EngineProcessTimeInfo, TransportSnapshot};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{error, info};

/// Default output device and its stream configuration
pub struct AudioOutput {
    device: cpal::Device,
    config: cpal::SupportedStreamConfig,
    block_length: u32,
}

impl AudioOutput {
    pub fn open_default(block_length: u32) -> Result<Self, Box<dyn std::error::Error>> {
        // Get the default audio host (JACK/ALSA/CoreAudio/etc)
        let host = cpal::default_host();
        info!("Audio host: {:?}", host.id());

        let device = host
            .default_output_device()
            .ok_or("No audio output device found")?;
        info!("Audio device: {}", device.name()?);

        let config = device.default_output_config()?;
        info!("Audio config: {:?}", config);

        Ok(Self {
            device,
            config,
            block_length,
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.config.sample_rate().0
    }

    pub fn channels(&self) -> usize {
        self.config.channels() as usize
    }

    /// Parameters for a dispatcher driving this device
    pub fn audio_interface(&self) -> FixedAudioInterface {
        FixedAudioInterface {
            sample_rate: self.sample_rate(),
            block_length: self.block_length,
        }
    }

    /// Start the stream; audio runs until the returned engine is dropped
    pub fn start(
        self,
        dispatcher: Arc<GraphDispatcher>,
        master: Arc<AudioPort>,
    ) -> Result<PlaybackEngine, Box<dyn std::error::Error>> {
        let position = Arc::new(AtomicU64::new(0));
        let state = PlaybackState {
            dispatcher,
            master,
            channels: self.channels(),
            block_length: self.block_length.max(1),
            position: 0,
            remaining_preroll: 0,
            seen_generation: 0,
            shared_position: Arc::clone(&position),
        };

        let stream_config: cpal::StreamConfig = self.config.config();
        let stream = match self.config.sample_format() {
            cpal::SampleFormat::F32 => build_stream::<f32>(&self.device, &stream_config, state),
            cpal::SampleFormat::I16 => build_stream::<i16>(&self.device, &stream_config, state),
            cpal::SampleFormat::U16 => build_stream::<u16>(&self.device, &stream_config, state),
            _ => return Err("Unsupported sample format".into()),
        }?;

        stream.play()?;
        info!("Audio stream started at {} Hz", self.sample_rate());

        Ok(PlaybackEngine {
            sample_rate: self.sample_rate(),
            position,
            _stream: stream,
        })
    }
}

fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut state: PlaybackState,
) -> Result<cpal::Stream, Box<dyn std::error::Error>>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
{
    let stream = device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            state.process_audio(data);
        },
        |err| error!("Audio stream error: {}", err),
        None,
    )?;

    Ok(stream)
}

/// A running output stream
pub struct PlaybackEngine {
    sample_rate: u32,
    position: Arc<AtomicU64>,
    _stream: cpal::Stream,
}

impl PlaybackEngine {
    /// Playhead in frames (stays at 0 during latency preroll)
    pub fn position(&self) -> u64 {
        self.position.load(Ordering::Relaxed)
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }
}

/// Callback-side state, owned by the audio thread
struct PlaybackState {
    dispatcher: Arc<GraphDispatcher>,
    master: Arc<AudioPort>,
    channels: usize,
    block_length: u32,
    position: u64,

    remaining_preroll: u32,

    /// Dispatcher graph generation the preroll was armed for
    seen_generation: u64,
    shared_position: Arc<AtomicU64>,
}

impl PlaybackState {
    fn process_audio<T>(&mut self, output: &mut [T])
    where
        T: cpal::SizedSample + cpal::FromSample<f32>,
    {
        let channels = self.channels.max(1);
        let total_frames = output.len() / channels;
        let generation = self.dispatcher.graph_generation();
        if generation != self.seen_generation {
            self.seen_generation = generation;
            self.remaining_preroll = self.dispatcher.get_max_route_playback_latency();
        }
        let mut remaining_preroll = self.remaining_preroll;

        let mut done = 0;
        while done < total_frames {
            let mut nframes = self.block_length.min((total_frames - done) as u32);
            if remaining_preroll > 0 {
                nframes = self.dispatcher.preroll_block_length(remaining_preroll, nframes);
            }

            let time_info = EngineProcessTimeInfo::new(self.position, nframes);
            self.dispatcher.preprocess_at_start_of_cycle(&time_info);
            let ran = self.dispatcher.start_cycle(
                TransportSnapshot::rolling_at(self.position),
                time_info,
                remaining_preroll,
                KickoffContext::HardwareCallback,
            );

            let region = &mut output[done * channels..(done + nframes as usize) * channels];
            if ran && remaining_preroll == 0 {
                self.master.with_buffer(|buf| {
                    let src_channels = buf.num_channels();
                    for (i, frame) in region.chunks_mut(channels).enumerate() {
                        for (ch, sample) in frame.iter_mut().enumerate() {
                            let value = if src_channels == 0 || i >= buf.num_frames() {
                                0.0
                            } else {
                                buf.channel(ch.min(src_channels - 1))[i]
                            };
                            *sample = T::from_sample(value);
                        }
                    }
                });
            } else {
                for sample in region.iter_mut() {
                    *sample = T::from_sample(0.0);
                }
            }

            if remaining_preroll > 0 {
                if ran {
                    remaining_preroll -= nframes;
                }
            } else {
                self.position += u64::from(nframes);
            }
            done += nframes as usize;
        }

        self.remaining_preroll = remaining_preroll;
        self.shared_position.store(self.position, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::demo::{Gain, SineGenerator};
    use crate::dispatcher::{direct_engine_lock, FixedAudioInterface};
    use crate::graph::Graph;
    use crate::processable::Processable;
    use crate::test_utils::expected_sine;

    fn dispatcher_for(builder: impl FnMut(&mut Graph) + Send + 'static) -> Arc<GraphDispatcher> {
        Arc::new(
            GraphDispatcher::new(
                Box::new(builder),
                Arc::new(FixedAudioInterface {
                    sample_rate: 48000,
                    block_length: 256,
                }),
                direct_engine_lock(),
            )
            .with_threads(Some(2), false),
        )
    }

    fn playback(dispatcher: &Arc<GraphDispatcher>, master: &Arc<AudioPort>) -> PlaybackState {
        PlaybackState {
            dispatcher: Arc::clone(dispatcher),
            master: Arc::clone(master),
            channels: 2,
            block_length: 256,
            position: 0,
            remaining_preroll: 0,
            seen_generation: 0,
            shared_position: Arc::new(AtomicU64::new(0)),
        }
    }

    #[test]
    fn test_preroll_rearmed_when_latency_changes() {
        let sine = Arc::new(SineGenerator::new("sine", 440.0, 0.5, 2));
        let master = Arc::new(AudioPort::stereo("master"));
        master.add_source(Arc::clone(sine.output()));

        let (for_sine, for_master) = (Arc::clone(&sine), Arc::clone(&master));
        let dispatcher = dispatcher_for(move |graph: &mut Graph| {
            let s = graph.add_node_for_processable(Arc::clone(&for_sine) as Arc<dyn Processable>);
            let m = graph.add_node_for_processable(Arc::clone(&for_master) as Arc<dyn Processable>);
            graph.connect(s, m).expect("fresh nodes");
        });
        let mut state = playback(&dispatcher, &master);
        let mut out = vec![0.0f32; 512];

        // Stream running before any graph exists
        state.process_audio(&mut out);
        assert_eq!(state.position, 256);

        sine.set_latency(128);
        dispatcher.recalc_graph(false).unwrap();
        state.process_audio(&mut out);
        assert_eq!(state.position, 256 + 128);
        assert!(out[..256].iter().all(|&s| s == 0.0));

        // Unchanged latency keeps playing
        dispatcher.recalc_graph(true).unwrap();
        state.process_audio(&mut out);
        assert_eq!(state.position, 256 + 128 + 256);

        sine.set_latency(64);
        dispatcher.recalc_graph(true).unwrap();
        state.process_audio(&mut out);
        assert_eq!(state.position, 256 + 128 + 256 + 192);
        assert_eq!(state.remaining_preroll, 0);
    }

    #[test]
    fn test_routes_of_different_latency_are_aligned() {
        let slow = Arc::new(SineGenerator::new("slow", 440.0, 0.25, 2));
        let fast = Arc::new(SineGenerator::new("fast", 440.0, 0.25, 2));
        let slow_fx = Arc::new(Gain::new("slow fx", 1.0, 128, Arc::clone(slow.output())));
        let fast_fx = Arc::new(Gain::new("fast fx", 1.0, 64, Arc::clone(fast.output())));
        let master = Arc::new(AudioPort::stereo("master"));
        master.add_source(Arc::clone(slow_fx.output()));
        master.add_source(Arc::clone(fast_fx.output()));

        let chains = vec![
            (slow.clone() as Arc<dyn Processable>, slow_fx.clone() as Arc<dyn Processable>),
            (fast.clone() as Arc<dyn Processable>, fast_fx.clone() as Arc<dyn Processable>),
        ];
        let for_master = Arc::clone(&master);
        let dispatcher = dispatcher_for(move |graph: &mut Graph| {
            let m = graph.add_node_for_processable(Arc::clone(&for_master) as Arc<dyn Processable>);
            for (generator, fx) in &chains {
                let g = graph.add_node_for_processable(Arc::clone(generator));
                let f = graph.add_node_for_processable(Arc::clone(fx));
                graph.connect(g, f).expect("fresh nodes");
                graph.connect(f, m).expect("fresh nodes");
            }
        });
        dispatcher.recalc_graph(false).unwrap();
        assert_eq!(dispatcher.get_max_route_playback_latency(), 128);

        let mut state = playback(&dispatcher, &master);
        let mut out = vec![0.0f32; 384 * 2];
        state.process_audio(&mut out);

        assert_eq!(state.position, 256);
        assert!(out[..128 * 2].iter().all(|&s| s == 0.0));
        for i in 0..256 {
            let expected = 2.0 * expected_sine(i as u64, 440.0, 0.25, 48000, 0);
            let got = out[(128 + i) * 2];
            assert!((got - expected).abs() < 1e-5, "frame {}: expected {} got {}", i, expected, got);
        }
    }
}
