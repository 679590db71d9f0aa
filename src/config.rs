//! Engine configuration
//!
//! Read from TOML, by default at `<config dir>/rtgraph/config.toml`:
//!
//! ```toml
//! sample_rate = 48000
//! block_length = 256
//! num_threads = 0        # 0 = one worker per CPU
//! pin_threads = false
//! log_filter = "info"
//!
//! [render]
//! bit_depth = "24"
//! dither = true
//! ```

use crate::error::ConfigError;
use crate::renderer::RenderOptions;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Sample rate in Hz for realtime playback
    pub sample_rate: u32,

    /// Frames per processing cycle
    pub block_length: u32,

    /// Graph worker threads, 0 for one per CPU
    pub num_threads: usize,

    /// Pin worker threads to CPU cores
    pub pin_threads: bool,

    /// Default `tracing` filter when `RUST_LOG` is unset
    pub log_filter: String,

    pub render: RenderOptions,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            block_length: 256,
            num_threads: 0,
            pin_threads: false,
            log_filter: "info".to_string(),
            render: RenderOptions::default(),
        }
    }
}

impl EngineConfig {
    /// Default config file location, if the platform has a config dir
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("rtgraph").join("config.toml"))
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        debug!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Load the file at [`default_path`](Self::default_path), or defaults if absent
    pub fn load_or_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.exists() => Self::load(&path),
            _ => Ok(Self::default()),
        }
    }

    /// Parse and validate TOML content
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_rate == 0 || self.render.sample_rate == 0 {
            return Err(ConfigError::Invalid("sample_rate must be positive".to_string()));
        }
        if self.block_length == 0 || self.render.block_length == 0 {
            return Err(ConfigError::Invalid("block_length must be positive".to_string()));
        }
        if self.block_length > 8192 {
            return Err(ConfigError::Invalid(format!(
                "block_length {} exceeds 8192",
                self.block_length
            )));
        }
        Ok(())
    }

    /// Worker count for the scheduler (`None` = one per CPU)
    pub fn worker_threads(&self) -> Option<usize> {
        (self.num_threads > 0).then_some(self.num_threads)
    }
}
