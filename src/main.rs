//! rtgraph CLI - render, inspect and play the demo processing graph

use clap::{Parser, Subcommand};
use rtgraph::audio::AudioOutput;
use rtgraph::demo::DemoGraphBuilder;
use rtgraph::dispatcher::direct_engine_lock;
use rtgraph::renderer::render_run_async;
use rtgraph::{prune_graph_to_processables, BitDepth, EngineConfig, Graph, GraphBuilder, GraphDispatcher};
use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rtgraph")]
#[command(about = "Realtime audio processing graph engine", long_about = None)]
struct Cli {
    /// Config file (default: <config dir>/rtgraph/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Number of graph worker threads (overrides the config)
    #[arg(short = 't', long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render the demo graph to WAV
    Render {
        /// Output WAV file path
        output: PathBuf,

        /// Duration in seconds (default: 4.0)
        #[arg(short, long, default_value = "4.0")]
        duration: f32,

        /// Number of demo tracks (default: 4)
        #[arg(long, default_value = "4")]
        tracks: usize,

        /// Latency of the track effects in frames (default: 128)
        #[arg(long, default_value = "128")]
        fx_latency: u32,

        /// Bit depth: 8, 16, 24 or 32 (float)
        #[arg(short, long)]
        bit_depth: Option<u16>,

        /// Apply TPDF dither
        #[arg(long)]
        dither: bool,
    },

    /// Print the demo graph before and after pruning
    Dump {
        /// Number of demo tracks (default: 4)
        #[arg(long, default_value = "4")]
        tracks: usize,

        /// Latency of the track effects in frames (default: 128)
        #[arg(long, default_value = "128")]
        fx_latency: u32,

        /// Print Graphviz DOT instead of text
        #[arg(long)]
        dot: bool,
    },

    /// Play the demo graph on the default output device
    Play {
        /// Duration in seconds (default: 4.0)
        #[arg(short, long, default_value = "4.0")]
        duration: f32,

        /// Number of demo tracks (default: 4)
        #[arg(long, default_value = "4")]
        tracks: usize,

        /// Latency of the track effects in frames (default: 128)
        #[arg(long, default_value = "128")]
        fx_latency: u32,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::load_or_default()?,
    };
    if let Some(threads) = cli.threads {
        config.num_threads = threads;
        config.render.num_threads = threads;
    }

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Render {
            output,
            duration,
            tracks,
            fx_latency,
            bit_depth,
            dither,
        } => {
            let mut options = config.render.clone();
            if let Some(bits) = bit_depth {
                options.bit_depth =
                    BitDepth::from_bits(bits).ok_or_else(|| format!("Unsupported bit depth: {}", bits))?;
            }
            options.dither |= dither;

            let mut builder = DemoGraphBuilder::new(tracks, fx_latency);
            let mut graph = Graph::new();
            builder.build_graph(&mut graph);
            graph.finalize_nodes();
            prune_graph_to_processables(&mut graph, &builder.terminals());

            let frames = (duration.max(0.0) * options.sample_rate as f32) as u64;
            println!("Rendering {} frames ({} nodes) to {}", frames, graph.len(), output.display());

            let sample_rate = options.sample_rate;
            let bit_depth = options.bit_depth;
            let handle = render_run_async(options, graph.steal_nodes(), 0..frames)?;
            while !handle.is_finished() {
                std::thread::sleep(Duration::from_millis(100));
                print!("\r{:5.1}%", handle.progress_fraction() * 100.0);
                std::io::stdout().flush()?;
            }
            println!();

            let audio = handle.wait()?;
            audio.write_wav(&output, sample_rate, bit_depth)?;
            println!(
                "Wrote {} frames ({} bit, peak {:.3})",
                audio.num_frames(),
                bit_depth.bits(),
                audio.peak()
            );
        }

        Commands::Dump {
            tracks,
            fx_latency,
            dot,
        } => {
            let mut builder = DemoGraphBuilder::new(tracks, fx_latency);
            let mut graph = Graph::new();
            builder.build_graph(&mut graph);
            graph.finalize_nodes();

            let show = |graph: &Graph| {
                if dot {
                    graph.nodes().to_dot()
                } else {
                    graph.nodes().dump()
                }
            };

            println!("Before pruning:\n{}", show(&graph));
            prune_graph_to_processables(&mut graph, &builder.terminals());
            println!("After pruning:\n{}", show(&graph));
            println!(
                "Max route playback latency: {} frames",
                graph.nodes().max_route_playback_latency()
            );
        }

        Commands::Play {
            duration,
            tracks,
            fx_latency,
        } => {
            let output = AudioOutput::open_default(config.block_length)?;
            let builder = DemoGraphBuilder::new(tracks, fx_latency);
            let master = Arc::clone(builder.master());
            let terminals = builder.terminals();

            let dispatcher = Arc::new(
                GraphDispatcher::new(
                    Box::new(builder),
                    Arc::new(output.audio_interface()),
                    direct_engine_lock(),
                )
                .with_threads(config.worker_threads(), config.pin_threads),
            );
            dispatcher.set_terminal_processables(terminals);
            dispatcher.recalc_graph(false)?;

            let engine = output.start(Arc::clone(&dispatcher), master)?;
            println!(
                "Playing {} tracks for {:.1}s ({} frames latency)",
                tracks,
                duration,
                dispatcher.get_max_route_playback_latency()
            );
            std::thread::sleep(Duration::from_secs_f32(duration.max(0.0)));

            println!(
                "Played {} frames, {} node faults",
                engine.position(),
                dispatcher.fault_count()
            );
            drop(engine);
            dispatcher.terminate();
        }
    }

    Ok(())
}
