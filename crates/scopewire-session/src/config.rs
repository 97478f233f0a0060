//! Session configuration, parsed from TOML.

use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    #[serde(default)]
    pub channel: ChannelSection,
    #[serde(default)]
    pub reconnect: ReconnectSection,
    #[serde(default)]
    pub queue: QueueSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelSection {
    /// Bottom of the channel range; the system band sits directly above it.
    #[serde(default = "default_floor")]
    pub floor: u16,
    /// Total channels managed, system band included.
    #[serde(default = "default_capacity")]
    pub capacity: u16,
}

impl Default for ChannelSection {
    fn default() -> Self {
        Self {
            floor: default_floor(),
            capacity: default_capacity(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectSection {
    /// Reconnect automatically after an unexpected disconnect.
    #[serde(default)]
    pub auto: bool,
    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
    /// Random extra delay added on top of `delay_ms`.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            auto: false,
            delay_ms: default_delay_ms(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    /// Application command queue depth.
    #[serde(default = "default_command_depth")]
    pub command_depth: usize,
    /// Transport event/command queue depth.
    #[serde(default = "default_transport_depth")]
    pub transport_depth: usize,
    /// Broadcast event buffer per subscriber.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            command_depth: default_command_depth(),
            transport_depth: default_transport_depth(),
            event_capacity: default_event_capacity(),
        }
    }
}

// Default value functions
fn default_floor() -> u16 {
    100
}
fn default_capacity() -> u16 {
    900
}
fn default_delay_ms() -> u64 {
    1000
}
fn default_jitter_ms() -> u64 {
    250
}
fn default_command_depth() -> usize {
    64
}
fn default_transport_depth() -> usize {
    256
}
fn default_event_capacity() -> usize {
    256
}

impl SessionConfig {
    /// Load config from file, or fall back to defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: SessionConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}
