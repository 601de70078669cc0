//! Configuration of the streaming pipeline.

use crate::error::ConfigError;
use log::{info, warn};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that may point to a JSON settings file.
pub const SETTINGS_ENV: &str = "STREAMING_SETTINGS";

const MIB: u64 = 1024 * 1024;

/// Which transfer backend the context should create.
#[derive(Deserialize, Debug, Copy, Clone, Eq, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Submit straight to a DMA-offload storage queue. Falls back to
    /// `Fallback` when no storage queue is provided.
    Direct,
    /// Dedicated worker thread with blocking reads and a staging ring.
    Fallback,
}

/// Configuration of frame ring, backpressure and transfer sizes.
#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct StreamingConfig {
    /// Number of frame slots in the ring (replay depth).
    pub ring_depth: usize,
    /// Default number of frames of load latency `wake()` may hide.
    pub max_delay_frames: u64,
    /// Capacity of the staging arena of every frame slot in bytes.
    pub frame_arena_size: u64,
    /// Largest single request the backend is given. Bigger commands are split.
    pub max_request_size: u64,
    /// Capacity of the fallback backend staging ring in bytes.
    pub staging_size: u64,
    /// Commands up to this size are batched as fragments.
    pub fragment_size: u64,
    pub backend: BackendKind,
    /// Period of the housekeeping timer. Zero disables the timer thread.
    pub housekeeping_interval_ms: u64,
    /// How many times `wait()` yields before it falls back to a blocking wait.
    pub spin_limit: u32,
}

// default development configuration
impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            ring_depth: 3,
            max_delay_frames: 2,
            frame_arena_size: 8 * MIB,
            max_request_size: 4 * MIB,
            staging_size: 4 * MIB,
            fragment_size: 64 * 1024,
            backend: BackendKind::Fallback,
            housekeeping_interval_ms: 2,
            spin_limit: 64,
        }
    }
}

impl StreamingConfig {
    /// Reads and validates configuration from a JSON file. Missing keys
    /// take their default values.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        let config: StreamingConfig = serde_json::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads the configuration from the file named by `STREAMING_SETTINGS`
    /// or returns the default configuration if the variable is not set.
    pub fn from_env() -> Result<Self, ConfigError> {
        match std::env::var_os(SETTINGS_ENV) {
            Some(path) => {
                let path = PathBuf::from(path);
                info!("Loading streaming settings from {:?}", path);
                Self::load(&path)
            }
            None => {
                info!("{} is not set, using default streaming settings", SETTINGS_ENV);
                Ok(Self::default())
            }
        }
    }

    /// Checks relations between the values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.ring_depth == 0 {
            return Err(ConfigError::Invalid("ring_depth must be at least 1"));
        }
        if self.max_delay_frames == 0 {
            return Err(ConfigError::Invalid("max_delay_frames must be at least 1"));
        }
        if self.max_request_size == 0 || self.staging_size == 0 {
            return Err(ConfigError::Invalid("transfer sizes must not be zero"));
        }
        if self.fragment_size > self.staging_size {
            return Err(ConfigError::Invalid("fragment_size must fit into staging_size"));
        }
        if self.max_delay_frames > self.ring_depth as u64 {
            warn!(
                "max_delay_frames={} exceeds ring_depth={}, the loader will stall on slot fences",
                self.max_delay_frames, self.ring_depth
            );
        }
        Ok(())
    }

    /// Largest request handed to the fallback backend. Requests must fit
    /// into its staging ring.
    pub fn fallback_request_size(&self) -> u64 {
        self.max_request_size.min(self.staging_size)
    }

    pub fn housekeeping_interval(&self) -> Option<Duration> {
        match self.housekeeping_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }
}
