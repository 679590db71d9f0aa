//! Test utilities: instrumented processables and audio comparison helpers

use crate::error::ProcessError;
use crate::port::AudioPort;
use crate::processable::{EngineProcessTimeInfo, Processable, TransportSnapshot};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

/// Compare two audio buffers with a tolerance
pub fn compare_audio(actual: &[f32], expected: &[f32], tolerance: f32) -> bool {
    if actual.len() != expected.len() {
        return false;
    }

    for (a, e) in actual.iter().zip(expected.iter()) {
        if (a - e).abs() > tolerance {
            return false;
        }
    }

    true
}

/// Calculate RMS energy of audio buffer
pub fn calculate_rms(audio: &[f32]) -> f32 {
    if audio.is_empty() {
        return 0.0;
    }
    let sum: f32 = audio.iter().map(|x| x * x).sum();
    (sum / audio.len() as f32).sqrt()
}

/// No-op processable with a configurable latency
pub struct FixedLatency {
    name: String,
    latency: AtomicU32,
}

impl FixedLatency {
    pub fn new(name: impl Into<String>, latency: u32) -> Self {
        Self {
            name: name.into(),
            latency: AtomicU32::new(latency),
        }
    }

    pub fn set_latency(&self, latency: u32) {
        self.latency.store(latency, Ordering::Relaxed);
    }
}

impl Processable for FixedLatency {
    fn node_name(&self) -> String {
        self.name.clone()
    }

    fn single_playback_latency(&self) -> u32 {
        self.latency.load(Ordering::Relaxed)
    }

    fn process_block(
        &self,
        _time_info: EngineProcessTimeInfo,
        _transport: &TransportSnapshot,
    ) -> Result<(), ProcessError> {
        Ok(())
    }
}

/// Shared log of node names in processing order
#[derive(Default)]
pub struct OrderLog {
    entries: Mutex<Vec<String>>,
}

impl OrderLog {
    pub fn record(&self, name: &str) {
        self.entries.lock().push(name.to_string());
    }

    pub fn names(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Index of the first entry for `name`
    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries.lock().iter().position(|n| n == name)
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Processable that counts lifecycle calls and remembers every time info
pub struct CountingProcessable {
    name: String,
    latency: AtomicU32,
    log: Option<Arc<OrderLog>>,
    processed: AtomicUsize,
    prepared: AtomicUsize,
    released: AtomicUsize,
    seen: Mutex<Vec<EngineProcessTimeInfo>>,
}

impl CountingProcessable {
    pub fn new(name: impl Into<String>, latency: u32) -> Self {
        Self {
            name: name.into(),
            latency: AtomicU32::new(latency),
            log: None,
            processed: AtomicUsize::new(0),
            prepared: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn with_log(name: impl Into<String>, latency: u32, log: Arc<OrderLog>) -> Self {
        let mut p = Self::new(name, latency);
        p.log = Some(log);
        p
    }

    pub fn set_latency(&self, latency: u32) {
        self.latency.store(latency, Ordering::Relaxed);
    }

    pub fn process_count(&self) -> usize {
        self.processed.load(Ordering::SeqCst)
    }

    pub fn prepare_count(&self) -> usize {
        self.prepared.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn time_infos(&self) -> Vec<EngineProcessTimeInfo> {
        self.seen.lock().clone()
    }
}

impl Processable for CountingProcessable {
    fn node_name(&self) -> String {
        self.name.clone()
    }

    fn single_playback_latency(&self) -> u32 {
        self.latency.load(Ordering::Relaxed)
    }

    fn prepare_for_processing(&self, _sample_rate: u32, _max_block_length: u32) {
        self.prepared.fetch_add(1, Ordering::SeqCst);
    }

    fn release_resources(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn process_block(
        &self,
        time_info: EngineProcessTimeInfo,
        _transport: &TransportSnapshot,
    ) -> Result<(), ProcessError> {
        if let Some(log) = &self.log {
            log.record(&self.name);
        }
        self.seen.lock().push(time_info);
        self.processed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// How a [`FaultyProcessable`] misbehaves
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultMode {
    Error,
    Panic,
    /// Panics in `process_block` and again in `silence_output`
    PanicWhileSilenced,
}

/// Writes a constant into its output port, or fails while armed
pub struct FaultyProcessable {
    name: String,
    mode: FaultMode,
    armed: AtomicBool,
    value: f32,
    output: Arc<AudioPort>,
}

impl FaultyProcessable {
    pub fn new(name: impl Into<String>, mode: FaultMode, output: Arc<AudioPort>) -> Self {
        Self {
            name: name.into(),
            mode,
            armed: AtomicBool::new(true),
            value: 1.0,
            output,
        }
    }

    pub fn set_armed(&self, armed: bool) {
        self.armed.store(armed, Ordering::SeqCst);
    }

    pub fn output(&self) -> &Arc<AudioPort> {
        &self.output
    }
}

impl Processable for FaultyProcessable {
    fn node_name(&self) -> String {
        self.name.clone()
    }

    fn process_block(
        &self,
        time_info: EngineProcessTimeInfo,
        _transport: &TransportSnapshot,
    ) -> Result<(), ProcessError> {
        let offset = time_info.local_offset as usize;
        let nframes = time_info.nframes as usize;

        // Garbage first, so a missing silence pass would be visible downstream
        self.output.with_buffer(|buf| {
            for ch in 0..buf.num_channels() {
                let channel = buf.channel_mut(ch);
                let end = (offset + nframes).min(channel.len());
                if offset < end {
                    channel[offset..end].fill(self.value);
                }
            }
        });

        if self.armed.load(Ordering::SeqCst) {
            match self.mode {
                FaultMode::Error => return Err(ProcessError::Failed(format!("{} is armed", self.name))),
                FaultMode::Panic | FaultMode::PanicWhileSilenced => panic!("{} is armed", self.name),
            }
        }
        Ok(())
    }

    fn silence_output(&self, time_info: EngineProcessTimeInfo) {
        if self.mode == FaultMode::PanicWhileSilenced {
            panic!("{} cannot be silenced", self.name);
        }
        self.output.with_buffer(|buf| {
            buf.clear_region(time_info.local_offset as usize, time_info.nframes as usize)
        });
    }
}

/// Expected output of a [`SineGenerator`](crate::demo::SineGenerator) at absolute frame `t`
pub fn expected_sine(t: u64, frequency: f32, amplitude: f32, sample_rate: u32, latency: u32) -> f32 {
    if t < u64::from(latency) {
        return 0.0;
    }
    let phase = (t - u64::from(latency)) as f64 * f64::from(frequency) / f64::from(sample_rate);
    amplitude * (2.0 * std::f64::consts::PI * phase).sin() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_audio_comparison() {
        let audio1 = vec![0.0, 0.5, 1.0, 0.5, 0.0];
        let audio2 = vec![0.0, 0.49, 1.01, 0.51, 0.0];
        let audio3 = vec![0.0, 0.3, 1.0, 0.5, 0.0];

        assert!(compare_audio(&audio1, &audio2, 0.02));
        assert!(!compare_audio(&audio1, &audio3, 0.02));
        assert!(!compare_audio(&audio1, &audio1[..4], 0.02));
    }

    #[test]
    fn test_rms() {
        assert_eq!(calculate_rms(&[]), 0.0);
        assert!((calculate_rms(&[1.0, -1.0, 1.0, -1.0]) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_counting_processable() {
        let log = Arc::new(OrderLog::default());
        let p = CountingProcessable::with_log("p", 3, Arc::clone(&log));
        p.prepare_for_processing(48000, 64);
        p.process_block(EngineProcessTimeInfo::new(0, 64), &TransportSnapshot::default())
            .unwrap();
        assert_eq!(p.prepare_count(), 1);
        assert_eq!(p.process_count(), 1);
        assert_eq!(p.single_playback_latency(), 3);
        assert_eq!(log.position("p"), Some(0));
    }

    #[test]
    fn test_expected_sine_silent_during_latency() {
        assert_eq!(expected_sine(10, 440.0, 0.5, 48000, 64), 0.0);
        assert_eq!(expected_sine(64, 440.0, 0.5, 48000, 64), 0.0);
        assert!(expected_sine(70, 440.0, 0.5, 48000, 64).abs() > 0.0);
    }
}
