use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

use crate::backend::StreamBackend;

pub const DEFAULT_WPA_CONFIG: &str = "/etc/wpa_supplicant/wpa_supplicant.conf";
pub const DEFAULT_STREAM_PORT: u16 = 8554;
pub const DEFAULT_FPS: u32 = 30;
pub const DEFAULT_BITRATE: u32 = 8192;

#[derive(Debug, Serialize, Deserialize, Default, Clone)]
pub struct Config {
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub stream: StreamConfig,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct SessionConfig {
    /// Directory holding session records. Defaults to the system temp dir.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default = "default_wpa_config")]
    pub default_wpa_config: PathBuf,
    #[serde(default = "default_settle_ms")]
    pub reconnect_settle_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct StreamConfig {
    #[serde(default)]
    pub backend: Option<StreamBackend>,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_fps")]
    pub fps: u32,
    #[serde(default = "default_bitrate")]
    pub bitrate: u32,
    #[serde(default = "default_audio")]
    pub audio: bool,
}

fn default_wpa_config() -> PathBuf {
    PathBuf::from(DEFAULT_WPA_CONFIG)
}

fn default_settle_ms() -> u64 {
    3000
}

fn default_port() -> u16 {
    DEFAULT_STREAM_PORT
}

fn default_fps() -> u32 {
    DEFAULT_FPS
}

fn default_bitrate() -> u32 {
    DEFAULT_BITRATE
}

fn default_audio() -> bool {
    true
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            dir: None,
            default_wpa_config: default_wpa_config(),
            reconnect_settle_ms: default_settle_ms(),
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            backend: None,
            port: default_port(),
            fps: default_fps(),
            bitrate: default_bitrate(),
            audio: default_audio(),
        }
    }
}

impl SessionConfig {
    pub fn record_dir(&self) -> PathBuf {
        self.dir.clone().unwrap_or_else(std::env::temp_dir)
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let path = config_path()?;
        if !path.exists() {
            return Ok(Config::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn parse(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize config")
    }
}

pub fn config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .context("Could not determine config directory")?;
    Ok(config_dir.join("wfd-session").join("config.toml"))
}
