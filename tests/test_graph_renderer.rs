use rtgraph::demo::{DemoGraphBuilder, Gain, SineGenerator};
use rtgraph::dispatcher::{direct_engine_lock, FixedAudioInterface};
use rtgraph::port::{AudioBuffer, AudioPort};
use rtgraph::renderer::render_run_async;
use rtgraph::test_utils::{compare_audio, expected_sine, CountingProcessable};
use rtgraph::{
    BitDepth, CancellationToken, EngineProcessTimeInfo, Graph, GraphBuilder, GraphDispatcher,
    GraphNodeCollection, GraphRenderer, KickoffContext, ProcessError, Processable, RenderError,
    RenderOptions, TransportSnapshot,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const SAMPLE_RATE: u32 = 48000;
const FREQ: f32 = 440.0;
const AMP: f32 = 0.25;

/// Sine generator that counts its process calls
struct CountingSine {
    inner: SineGenerator,
    calls: AtomicUsize,
}

impl CountingSine {
    fn new(name: &str, latency: u32) -> Self {
        Self {
            inner: SineGenerator::new(name, FREQ, AMP, 2).with_latency(latency),
            calls: AtomicUsize::new(0),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Processable for CountingSine {
    fn node_name(&self) -> String {
        self.inner.node_name()
    }

    fn single_playback_latency(&self) -> u32 {
        self.inner.single_playback_latency()
    }

    fn prepare_for_processing(&self, sample_rate: u32, max_block_length: u32) {
        self.inner.prepare_for_processing(sample_rate, max_block_length);
    }

    fn release_resources(&self) {
        self.inner.release_resources();
    }

    fn process_block(
        &self,
        time_info: EngineProcessTimeInfo,
        transport: &TransportSnapshot,
    ) -> Result<(), ProcessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.process_block(time_info, transport)
    }
}

/// generators -> master, plus a lifecycle counter feeding master
struct Setup {
    generators: Vec<Arc<CountingSine>>,
    master: Arc<AudioPort>,
    lifecycle: Arc<CountingProcessable>,
}

impl Setup {
    fn new(latencies: &[u32]) -> Self {
        let generators: Vec<_> = latencies
            .iter()
            .enumerate()
            .map(|(i, &l)| Arc::new(CountingSine::new(&format!("gen{}", i), l)))
            .collect();
        let master = Arc::new(AudioPort::stereo("master"));
        for g in &generators {
            master.add_source(Arc::clone(g.inner.output()));
        }
        Self {
            generators,
            master,
            lifecycle: Arc::new(CountingProcessable::new("lifecycle", 0)),
        }
    }

    fn nodes(&self) -> GraphNodeCollection {
        let mut graph = Graph::new();
        self.build_graph_into(&mut graph);
        graph.finalize_nodes();
        graph.steal_nodes()
    }

    fn build_graph_into(&self, graph: &mut Graph) {
        let master = graph.add_node_for_processable(self.master.clone());
        for g in &self.generators {
            let id = graph.add_node_for_processable(g.clone());
            graph.connect(id, master).unwrap();
        }
        let lifecycle = graph.add_node_for_processable(self.lifecycle.clone());
        graph.connect(lifecycle, master).unwrap();
    }
}

fn options(num_threads: usize) -> RenderOptions {
    RenderOptions {
        bit_depth: BitDepth::Bit32,
        dither: false,
        sample_rate: SAMPLE_RATE,
        block_length: 256,
        num_threads,
    }
}

#[test]
fn test_single_block_render() {
    let setup = Setup::new(&[0]);
    let audio = GraphRenderer::new(options(2))
        .render(setup.nodes(), 0..256, None)
        .unwrap();

    assert_eq!(audio.num_frames(), 256);
    assert_eq!(audio.num_channels(), 2);
    assert_eq!(setup.generators[0].calls(), 1);

    let expected: Vec<f32> = (0..256).map(|t| expected_sine(t, FREQ, AMP, SAMPLE_RATE, 0)).collect();
    assert!(compare_audio(audio.channel(0), &expected, 1e-5));
    assert!(compare_audio(audio.channel(1), &expected, 1e-5));
}

#[test]
fn test_latency_adds_silent_preroll() {
    let setup = Setup::new(&[128]);
    let audio = GraphRenderer::new(options(2))
        .render(setup.nodes(), 0..256, None)
        .unwrap();

    assert_eq!(audio.num_frames(), 384);
    assert!(audio.channel(0)[..128].iter().all(|&s| s == 0.0), "preroll must be silent");

    let expected: Vec<f32> = (0..256)
        .map(|i| expected_sine(128 + i, FREQ, AMP, SAMPLE_RATE, 128))
        .collect();
    assert!(compare_audio(&audio.channel(0)[128..], &expected, 1e-5));
    assert_eq!(setup.generators[0].calls(), 2, "one preroll block plus one audible block");
}

#[test]
fn test_mixed_latencies_are_aligned() {
    let setup = Setup::new(&[0, 64]);
    let audio = GraphRenderer::new(options(3))
        .render(setup.nodes(), 0..256, None)
        .unwrap();

    assert_eq!(audio.num_frames(), 320);
    assert_eq!(setup.generators[0].calls(), 1);
    assert_eq!(setup.generators[1].calls(), 2);
    assert!(audio.channel(0)[..64].iter().all(|&s| s == 0.0));

    // Both paths start at phase zero on the same output frame
    let expected: Vec<f32> = (0..256)
        .map(|i| 2.0 * expected_sine(i, FREQ, AMP, SAMPLE_RATE, 0))
        .collect();
    assert!(compare_audio(&audio.channel(0)[64..], &expected, 1e-5));
}

#[test]
fn test_long_render_block_count_and_lifecycle() {
    let setup = Setup::new(&[0]);
    let audio = GraphRenderer::new(options(2))
        .render(setup.nodes(), 0..48000, None)
        .unwrap();

    assert_eq!(audio.num_frames(), 48000);
    assert_eq!(setup.generators[0].calls(), 188);
    assert_eq!(setup.lifecycle.process_count(), 188);
    assert_eq!(setup.lifecycle.prepare_count(), 1);
    assert_eq!(setup.lifecycle.release_count(), 1);

    // The last, partial block is 48000 - 187 * 256 = 128 frames
    let last = setup.lifecycle.time_infos().pop().unwrap();
    assert_eq!(last.nframes, 128);
    assert_eq!(last.start_frame, 187 * 256);
}

#[test]
fn test_render_with_offset_range() {
    let setup = Setup::new(&[0]);
    let audio = GraphRenderer::new(options(0))
        .render(setup.nodes(), 1000..1100, None)
        .unwrap();

    let expected: Vec<f32> = (1000..1100).map(|t| expected_sine(t, FREQ, AMP, SAMPLE_RATE, 0)).collect();
    assert!(compare_audio(audio.channel(0), &expected, 1e-5));
}

#[test]
fn test_render_is_independent_of_thread_count() {
    let setup = Setup::new(&[0, 32, 200]);
    let inline = GraphRenderer::new(options(0))
        .render(setup.nodes(), 0..5000, None)
        .unwrap();
    let threaded = GraphRenderer::new(options(4))
        .render(setup.nodes(), 0..5000, None)
        .unwrap();

    assert_eq!(inline.num_frames(), 5200);
    assert_eq!(inline, threaded);
}

#[test]
fn test_empty_range_processes_nothing() {
    let setup = Setup::new(&[128]);
    let audio = GraphRenderer::new(options(2))
        .render(setup.nodes(), 0..0, None)
        .unwrap();

    assert_eq!(audio.num_frames(), 0);
    assert_eq!(audio.num_channels(), 2);
    assert_eq!(setup.generators[0].calls(), 0);
    assert_eq!(setup.lifecycle.prepare_count(), 0);
}

#[test]
fn test_render_without_audio_terminal_fails() {
    let mut graph = Graph::new();
    graph.add_node_for_processable(Arc::new(CountingProcessable::new("lonely", 0)));
    graph.finalize_nodes();

    let result = GraphRenderer::new(options(1)).render(graph.steal_nodes(), 0..256, None);
    assert!(matches!(result, Err(RenderError::NoAudioTerminal)));
}

#[test]
fn test_cancelled_render_yields_no_result() {
    let setup = Setup::new(&[0]);
    let token = CancellationToken::new();
    token.cancel();

    let result = GraphRenderer::new(options(2)).render(setup.nodes(), 0..48000, Some(&token));
    assert!(matches!(result, Err(RenderError::Cancelled)));
    assert_eq!(setup.generators[0].calls(), 0);
    assert_eq!(setup.lifecycle.release_count(), 1);
}

/// Cancels the render from inside its `after`-th block
struct CancelAfter {
    token: CancellationToken,
    after: usize,
    calls: AtomicUsize,
    released: AtomicUsize,
}

impl Processable for CancelAfter {
    fn node_name(&self) -> String {
        "cancel after".to_string()
    }

    fn release_resources(&self) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }

    fn process_block(
        &self,
        _time_info: EngineProcessTimeInfo,
        _transport: &TransportSnapshot,
    ) -> Result<(), ProcessError> {
        if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.after {
            self.token.cancel();
        }
        Ok(())
    }
}

#[test]
fn test_render_cancelled_mid_way() {
    for threads in [0, 2] {
        let token = CancellationToken::new();
        let canceller = Arc::new(CancelAfter {
            token: token.clone(),
            after: 5,
            calls: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        });
        let master = Arc::new(AudioPort::stereo("master"));

        let mut graph = Graph::new();
        let c = graph.add_node_for_processable(canceller.clone());
        let m = graph.add_node_for_processable(master.clone());
        graph.connect(c, m).unwrap();
        graph.finalize_nodes();

        let result = GraphRenderer::new(options(threads)).render(graph.steal_nodes(), 0..48000, Some(&token));
        assert!(matches!(result, Err(RenderError::Cancelled)), "threads {}", threads);
        assert_eq!(canceller.calls.load(Ordering::SeqCst), 5);
        assert_eq!(canceller.released.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn test_async_render_cancel() {
    let setup = Setup::new(&[0]);
    let handle = render_run_async(options(2), setup.nodes(), 0..(SAMPLE_RATE as u64 * 60)).unwrap();
    handle.cancel();

    assert!(matches!(handle.wait(), Err(RenderError::Cancelled)));
}

#[test]
fn test_async_render_reports_progress() {
    let setup = Setup::new(&[64]);
    let handle = render_run_async(options(2), setup.nodes(), 0..10_000).unwrap();
    let audio = handle_wait_with_progress(handle);

    assert_eq!(audio.num_frames(), 10_064);
}

fn handle_wait_with_progress(handle: rtgraph::RenderHandle) -> AudioBuffer {
    while !handle.is_finished() {
        std::thread::yield_now();
    }
    assert_eq!(handle.progress(), 10_000);
    assert_eq!(handle.progress_fraction(), 1.0);
    handle.wait().unwrap()
}

/// slow -> fx(128) -> master, fast -> fx(64) -> master
fn two_latency_routes() -> GraphNodeCollection {
    let master = Arc::new(AudioPort::stereo("master"));
    let mut graph = Graph::new();
    let m = graph.add_node_for_processable(master.clone());
    for (name, latency) in [("slow", 128), ("fast", 64)] {
        let generator = Arc::new(SineGenerator::new(name, FREQ, AMP, 2));
        let fx = Arc::new(Gain::new(format!("{} fx", name), 1.0, latency, Arc::clone(generator.output())));
        master.add_source(Arc::clone(fx.output()));

        let g = graph.add_node_for_processable(generator);
        let f = graph.add_node_for_processable(fx);
        graph.connect(g, f).unwrap();
        graph.connect(f, m).unwrap();
    }
    graph.finalize_nodes();
    graph.steal_nodes()
}

#[test]
fn test_routes_of_different_latency_are_aligned() {
    let expected: Vec<f32> = (0..256)
        .map(|i| 2.0 * expected_sine(i, FREQ, AMP, SAMPLE_RATE, 0))
        .collect();

    for threads in [0, 2] {
        let audio = GraphRenderer::new(options(threads))
            .render(two_latency_routes(), 0..256, None)
            .unwrap();
        assert_eq!(audio.num_frames(), 384);

        assert!(audio.channel(0)[..128].iter().all(|&s| s == 0.0));
        assert!(
            compare_audio(&audio.channel(0)[128..], &expected, 1e-5),
            "threads {}: both routes must be audible from the first frame",
            threads
        );
    }
}

#[test]
fn test_render_matches_realtime_playback() {
    let latencies = [0, 100];
    let render_setup = Setup::new(&latencies);
    let rendered = GraphRenderer::new(options(2))
        .render(render_setup.nodes(), 0..2000, None)
        .unwrap();

    // Same graph driven block by block through the live dispatcher
    let live_setup = Arc::new(Setup::new(&latencies));
    let for_builder = Arc::clone(&live_setup);
    let dispatcher = GraphDispatcher::new(
        Box::new(move |graph: &mut Graph| for_builder.build_graph_into(graph)),
        Arc::new(FixedAudioInterface {
            sample_rate: SAMPLE_RATE,
            block_length: 256,
        }),
        direct_engine_lock(),
    )
    .with_threads(Some(2), false);
    dispatcher.set_terminal_processables(vec![live_setup.master.clone() as Arc<dyn Processable>]);
    dispatcher.recalc_graph(false).unwrap();

    let mut preroll = dispatcher.get_max_route_playback_latency();
    assert_eq!(preroll, 100);
    let mut position = 0u64;
    let mut collected = 0usize;
    let mut live = AudioBuffer::new(2, 2100);
    while collected < 2100 {
        let mut nframes = 256.min(2100 - collected) as u32;
        if preroll > 0 {
            nframes = dispatcher.preroll_block_length(preroll, nframes);
        }
        assert!(dispatcher.start_cycle(
            TransportSnapshot::rolling_at(position),
            EngineProcessTimeInfo::new(position, nframes),
            preroll,
            KickoffContext::Manual,
        ));
        live_setup.master.copy_into(&mut live, 0, collected, nframes as usize);
        collected += nframes as usize;
        if preroll > 0 {
            preroll -= nframes;
        } else {
            position += u64::from(nframes);
        }
    }

    assert_eq!(rendered, live);
}

#[test]
fn test_render_to_wav_file() {
    let mut builder = DemoGraphBuilder::new(2, 32);
    let mut graph = Graph::new();
    builder.build_graph(&mut graph);
    graph.finalize_nodes();
    rtgraph::prune_graph_to_processables(&mut graph, &builder.terminals());

    let mut opts = options(2);
    opts.bit_depth = BitDepth::Bit16;
    opts.dither = true;
    let audio = GraphRenderer::new(opts).render(graph.steal_nodes(), 0..4800, None).unwrap();
    assert_eq!(audio.num_frames(), 4832);
    assert!(audio.peak() > 0.1);

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("demo.wav");
    audio.write_wav(&path, SAMPLE_RATE, BitDepth::Bit16).unwrap();

    let reader = hound::WavReader::open(&path).unwrap();
    let spec = reader.spec();
    assert_eq!(spec.channels, 2);
    assert_eq!(spec.bits_per_sample, 16);
    assert_eq!(spec.sample_rate, SAMPLE_RATE);
    assert_eq!(reader.len(), 4832 * 2);
}
