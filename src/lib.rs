//! # rtgraph - Realtime Audio Processing Graph
//!
//! rtgraph executes a directed graph of interdependent processing nodes
//! (tracks, buses, plugins, hardware ports) once per audio block across a
//! pool of worker threads. Every node runs after all of its upstream nodes,
//! signal paths of different latency are aligned, and the graph can be
//! replaced from a control thread while audio keeps playing. The same
//! machinery renders a pruned sub-graph offline for export.
//!
//! ## Pieces
//!
//! - [`Processable`]: the unit of work plugged into a graph
//! - [`Graph`]: transient builder producing a [`GraphNodeCollection`]
//! - [`prune_graph_to_terminals`]: drop nodes with no path to an output
//! - [`GraphScheduler`]: worker pool running one cycle per block
//! - [`GraphDispatcher`]: binds a scheduler to the live engine
//! - [`GraphRenderer`]: offline, cancellable batch rendering
//!
//! ## Quick Start
//!
//! ```rust
//! use rtgraph::demo::SineGenerator;
//! use rtgraph::{Graph, GraphRenderer, RenderOptions};
//! use rtgraph::port::AudioPort;
//! use std::sync::Arc;
//!
//! let sine = Arc::new(SineGenerator::new("sine", 440.0, 0.5, 2));
//! let master = Arc::new(AudioPort::stereo("master"));
//! master.add_source(Arc::clone(sine.output()));
//!
//! let mut graph = Graph::new();
//! let s = graph.add_node_for_processable(sine);
//! let m = graph.add_node_for_processable(master);
//! graph.connect(s, m).unwrap();
//! graph.finalize_nodes();
//!
//! let renderer = GraphRenderer::new(RenderOptions::default());
//! let audio = renderer.render(graph.steal_nodes(), 0..48000, None).unwrap();
//! assert_eq!(audio.num_frames(), 48000);
//! ```

pub mod audio;
pub mod config;
pub mod demo;
pub mod dispatcher;
pub mod error;
pub mod graph;
pub mod graph_node;
pub mod node_collection;
pub mod port;
pub mod processable;
pub mod pruner;
pub mod renderer;
pub mod scheduler;
pub mod test_utils;

pub use config::EngineConfig;
pub use dispatcher::{AudioInterface, GraphBuilder, GraphDispatcher, KickoffContext};
pub use error::{ConfigError, GraphError, ProcessError, RenderError};
pub use graph::Graph;
pub use graph_node::{GraphNode, NodeId};
pub use node_collection::GraphNodeCollection;
pub use processable::{EngineProcessTimeInfo, PlayState, Processable, TransportSnapshot};
pub use pruner::{prune_graph_to_processables, prune_graph_to_terminals};
pub use renderer::{BitDepth, CancellationToken, GraphRenderer, RenderHandle, RenderOptions};
pub use scheduler::GraphScheduler;
