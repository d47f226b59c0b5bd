//! # Streamer Configuration
//!
//! Configuration is loaded from the first file found:
//! 1. Path in the `R4W_XTRX_CONFIG` environment variable
//! 2. `./xtrx.yaml`
//! 3. `~/.config/r4w/xtrx.yaml`
//! 4. `/etc/r4w/xtrx.yaml`
//!
//! Defaults are used when none exists.
//!
//! ```yaml
//! device_path: /dev/litepcie0
//! target: host
//! detect_every_overflow: false
//! detect_every_underflow: true
//! default_channels: [0, 1]
//! logging:
//!   level: info
//!   format: compact
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{StreamError, StreamResult};
use crate::layout::DmaTarget;
use crate::logging::LogConfig;
use crate::types::DMA_CHANNELS;

/// Environment variable naming an explicit config file
pub const CONFIG_ENV: &str = "R4W_XTRX_CONFIG";

/// Streamer configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    /// LitePCIe character device
    pub device_path: PathBuf,
    /// Where the DMA buffers live; fixed for the lifetime of the streamer
    pub target: DmaTarget,
    /// Query the kernel on every RX acquire so overflow is never missed
    pub detect_every_overflow: bool,
    /// Query the kernel on every TX acquire so underflow is never missed
    pub detect_every_underflow: bool,
    /// Channels subscribed when `open` is given none
    pub default_channels: Vec<usize>,
    pub logging: LogConfig,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            device_path: PathBuf::from("/dev/litepcie0"),
            target: DmaTarget::Host,
            detect_every_overflow: false,
            detect_every_underflow: true,
            default_channels: vec![0, 1],
            logging: LogConfig::default(),
        }
    }
}

impl StreamerConfig {
    /// Load from the search path, falling back to defaults
    pub fn load() -> StreamResult<Self> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            let path = PathBuf::from(path);
            if path.exists() {
                return Self::load_from(&path);
            }
        }

        for path in Self::config_search_paths() {
            if path.exists() {
                return Self::load_from(&path);
            }
        }

        Ok(Self::default())
    }

    /// Load from a specific file
    pub fn load_from(path: &Path) -> StreamResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| StreamError::Config(format!("{}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    /// Parse and validate a YAML document
    pub fn parse(yaml: &str) -> StreamResult<Self> {
        let config: Self =
            serde_yaml::from_str(yaml).map_err(|e| StreamError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Write the configuration as YAML
    pub fn save(&self, path: &Path) -> StreamResult<()> {
        let content =
            serde_yaml::to_string(self).map_err(|e| StreamError::Config(e.to_string()))?;
        std::fs::write(path, content)
            .map_err(|e| StreamError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Files checked by [`load`](Self::load), in order
    pub fn config_search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("./xtrx.yaml")];
        if let Some(dirs) = directories::ProjectDirs::from("", "", "r4w") {
            paths.push(dirs.config_dir().join("xtrx.yaml"));
        }
        paths.push(PathBuf::from("/etc/r4w/xtrx.yaml"));
        paths
    }

    pub fn validate(&self) -> StreamResult<()> {
        if self.device_path.as_os_str().is_empty() {
            return Err(StreamError::Config("device_path must not be empty".to_string()));
        }
        validate_channels(&self.default_channels)
    }

    /// Example configuration document
    pub fn example_yaml() -> String {
        let config = Self {
            logging: LogConfig::production(),
            ..Default::default()
        };
        serde_yaml::to_string(&config).unwrap_or_default()
    }
}

/// Check a channel subscription against the hardware
pub(crate) fn validate_channels(channels: &[usize]) -> StreamResult<()> {
    if channels.is_empty() {
        return Err(StreamError::Config("at least one channel is required".to_string()));
    }
    for (i, &channel) in channels.iter().enumerate() {
        if channel >= DMA_CHANNELS {
            return Err(StreamError::InvalidChannel {
                channel,
                available: DMA_CHANNELS,
            });
        }
        if channels[..i].contains(&channel) {
            return Err(StreamError::Config(format!("channel {} listed twice", channel)));
        }
    }
    Ok(())
}
