// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Configuration store (I): loads and persists stream definitions and the
//! operational knobs named in the external-interfaces section. Unknown keys
//! are rejected at load time.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{NvrError, Result};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Stream descriptors (one per camera).
    #[serde(default, rename = "streams", alias = "cameras")]
    pub streams: Vec<StreamDescriptor>,
    /// HTTP API configuration.
    #[serde(default)]
    pub api: ApiConfig,
    /// Detection collaborator configuration.
    #[serde(default)]
    pub detection: DetectionConfig,
    /// Embedded RTSP-proxy helper process configuration.
    #[serde(default)]
    pub go2rtc_api_port: u16,
    /// Force native HLS path even when the proxy collaborator is present.
    #[serde(default)]
    pub force_native_hls: bool,
}

/// HTTP API configuration.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct ApiConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_web_port")]
    pub web_port: u16,
    #[serde(default)]
    pub web_auth_enabled: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            web_port: default_web_port(),
            web_auth_enabled: false,
        }
    }
}

fn default_true() -> bool {
    true
}
fn default_web_port() -> u16 {
    8080
}

/// Detection collaborator configuration (§6, §4.4).
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct DetectionConfig {
    #[serde(default)]
    pub detection_enabled: bool,
    #[serde(default = "default_cooldown_ms")]
    pub detection_cooldown_ms: u64,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            detection_enabled: false,
            detection_cooldown_ms: default_cooldown_ms(),
        }
    }
}

fn default_cooldown_ms() -> u64 {
    10_000
}

/// Storage parameters shared by all streams.
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Storage root (`storage_path`). Recordings, HLS segments and the
    /// catalog all live under this directory (§6 on-disk layout).
    #[serde(alias = "base_path")]
    pub storage_path: PathBuf,
    /// 0 = unlimited.
    #[serde(default)]
    pub max_storage_bytes: u64,
    /// Retention window in days; 0 = no age-based eviction.
    #[serde(default = "default_retention_days")]
    pub retention_days: u32,
    /// Ring buffer capacity per stream, in slots.
    #[serde(default = "default_buffer_size_kb")]
    pub buffer_size_kb: usize,
    /// MP4 segment rotation duration.
    #[serde(default = "default_segment_duration")]
    pub segment_duration_seconds: u64,
    /// HLS sliding-window segment count.
    #[serde(default = "default_hls_window")]
    pub hls_window_segments: usize,
    /// Retention loop interval.
    #[serde(default = "default_retention_interval")]
    pub retention_interval_secs: u64,
    /// Bounded channel capacity for the segment-write queue.
    #[serde(default = "default_writer_queue")]
    pub writer_queue_size: usize,
}

fn default_retention_days() -> u32 {
    30
}
fn default_buffer_size_kb() -> usize {
    4096
}
fn default_segment_duration() -> u64 {
    900
}
fn default_hls_window() -> usize {
    6
}
fn default_retention_interval() -> u64 {
    300
}
fn default_writer_queue() -> usize {
    256
}

/// Per-stream configuration + static runtime hints (§3 Stream Descriptor).
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(deny_unknown_fields)]
pub struct StreamDescriptor {
    /// Unique identifier, `[A-Za-z0-9_-]+`. Primary key across the
    /// Catalog, the Lifecycle Manager and the HLS namespace.
    pub id: String,
    /// Human-readable label.
    #[serde(default)]
    pub name: String,
    /// RTSP (or HTTP) source URI.
    pub url: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_true")]
    pub record: bool,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub fps: Option<u32>,
    /// 1 (lowest) – 10 (highest); used as the eviction weight in retention.
    #[serde(default = "default_priority")]
    pub priority: u8,
    /// Reconnection attempt limit (0 = unlimited).
    #[serde(default)]
    pub max_reconnect_attempts: u32,
    #[serde(default)]
    pub detection_enabled: bool,
}

fn default_priority() -> u8 {
    5
}

impl Config {
    /// Load configuration from a TOML file at `path`, rejecting unknown
    /// options (§6).
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| NvrError::Config(format!("Cannot read config file: {e}")))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| NvrError::Config(format!("Invalid TOML: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Persist the current configuration back to `path` (used after
    /// `add_stream`/`remove_stream` hot-reconfiguration via the API).
    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| NvrError::Config(format!("Cannot serialize config: {e}")))?;
        std::fs::write(path, content)
            .map_err(|e| NvrError::Config(format!("Cannot write config file: {e}")))?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.streams.is_empty() {
            return Err(NvrError::Config("No streams defined".into()));
        }
        if self.storage.segment_duration_seconds == 0 {
            return Err(NvrError::Config("segment_duration_seconds must be > 0".into()));
        }
        if self.storage.buffer_size_kb == 0 {
            return Err(NvrError::Config("buffer_size_kb must be > 0".into()));
        }
        if self.storage.hls_window_segments == 0 {
            return Err(NvrError::Config("hls_window_segments must be > 0".into()));
        }
        let mut seen = std::collections::HashSet::new();
        for s in &self.streams {
            if !s.id.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') {
                return Err(NvrError::Config(format!(
                    "Stream id '{}' must match [A-Za-z0-9_-]+",
                    s.id
                )));
            }
            if !seen.insert(s.id.clone()) {
                return Err(NvrError::Config(format!("Duplicate stream id '{}'", s.id)));
            }
            if s.priority == 0 || s.priority > 10 {
                return Err(NvrError::Config(format!(
                    "Stream '{}' priority must be in 1..=10",
                    s.id
                )));
            }
        }
        Ok(())
    }

    pub fn stream(&self, id: &str) -> Option<&StreamDescriptor> {
        self.streams.iter().find(|s| s.id == id)
    }
}
