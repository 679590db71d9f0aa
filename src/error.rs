//! Error types for graph construction, scheduling, configuration and rendering

use crate::graph_node::NodeId;
use thiserror::Error;

/// Errors raised while building or installing a processing graph
#[derive(Debug, Error)]
pub enum GraphError {
    /// A node was connected to itself
    #[error("node {0} cannot be connected to itself")]
    SelfLoop(NodeId),

    /// A node id that is not part of this graph
    #[error("node {0} is not part of this graph")]
    UnknownNode(NodeId),

    /// Worker thread could not be spawned
    #[error("failed to spawn graph worker thread: {0}")]
    ThreadSpawn(#[source] std::io::Error),
}

/// Failure reported by a processable for one block
///
/// The scheduler isolates these: the failing node's contribution for the
/// cycle is silenced and the rest of the graph keeps running.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The node could not produce output for this block
    #[error("{0}")]
    Failed(String),

    /// The block does not fit into the node's prepared buffers
    #[error("block of {requested} frames at offset {offset} exceeds prepared length {prepared}")]
    BlockTooLarge {
        requested: u32,
        offset: u32,
        prepared: usize,
    },

    /// `process_block` was called without a prior `prepare_for_processing`
    #[error("processable was not prepared")]
    NotPrepared,
}

/// Errors returned by the offline renderer
#[derive(Debug, Error)]
pub enum RenderError {
    /// The render was cancelled; any partial output was discarded
    #[error("render cancelled")]
    Cancelled,

    /// No terminal node of the collection is an audio port
    #[error("node collection has no terminal audio port to collect output from")]
    NoAudioTerminal,

    /// Graph setup failed (worker threads)
    #[error(transparent)]
    Graph(#[from] GraphError),

    /// The render thread panicked
    #[error("render thread panicked")]
    ThreadPanicked,

    /// WAV encoding failed
    #[error("failed to write WAV file: {0}")]
    Wav(#[from] hound::Error),
}

/// Errors loading the engine configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The config file could not be read
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The config file is not valid TOML for [`EngineConfig`](crate::config::EngineConfig)
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// A value is out of range
    #[error("invalid config value: {0}")]
    Invalid(String),
}
