use anyhow::{Context, Result};
use replicator_platform::screen::CaptureRegion;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

use crate::display::DisplaySettings;

/// Where the capture loop runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Isolation {
    /// A worker child process streaming frames over its stdout.
    #[default]
    Process,
    /// A thread inside the viewer process.
    Thread,
}

impl fmt::Display for Isolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Isolation::Process => f.write_str("process"),
            Isolation::Thread => f.write_str("thread"),
        }
    }
}

impl std::str::FromStr for Isolation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "process" => Ok(Isolation::Process),
            "thread" => Ok(Isolation::Thread),
            other => Err(format!("unknown isolation {:?}, expected process or thread", other)),
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("target_fps must be at least 1")]
    ZeroFps,
    #[error("fps_window must hold at least one sample")]
    EmptyFpsWindow,
    #[error("label_every must be at least 1")]
    ZeroLabelInterval,
    #[error("region {0} has a negative size")]
    NegativeRegion(CaptureRegion),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Display refresh rate in ticks per second
    #[serde(default = "default_target_fps")]
    pub target_fps: u32,

    /// Number of samples in the moving-average frame rate
    #[serde(default = "default_fps_window")]
    pub fps_window: usize,

    /// Refresh the rate label every n-th tick
    #[serde(default = "default_label_every")]
    pub label_every: u64,

    /// Fixed pacing correction in microseconds
    #[serde(default = "default_pacing_correction_us")]
    pub pacing_correction_us: u64,

    /// How long shutdown waits for the capture context, in milliseconds
    #[serde(default = "default_stop_timeout_ms")]
    pub stop_timeout_ms: u64,

    #[serde(default)]
    pub isolation: Isolation,

    /// Window to capture; prompts for one when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_title: Option<String>,

    /// Sub-rectangle of the client area; whole client area when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<CaptureRegion>,
}

fn default_target_fps() -> u32 {
    60
}
fn default_fps_window() -> usize {
    30
}
fn default_label_every() -> u64 {
    10
}
fn default_pacing_correction_us() -> u64 {
    571
}
fn default_stop_timeout_ms() -> u64 {
    2000
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            target_fps: default_target_fps(),
            fps_window: default_fps_window(),
            label_every: default_label_every(),
            pacing_correction_us: default_pacing_correction_us(),
            stop_timeout_ms: default_stop_timeout_ms(),
            isolation: Isolation::default(),
            window_title: None,
            region: None,
        }
    }
}

impl ReplicatorConfig {
    /// Default config file path for this platform
    pub fn default_path() -> PathBuf {
        if let Some(dirs) = directories::ProjectDirs::from("com", "screen-replicator", "replicator") {
            dirs.config_dir().join("config.json")
        } else {
            PathBuf::from("replicator-config.json")
        }
    }

    /// Load and validate config from a file path
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config from {}", path.display()))?;
        let config: Self =
            serde_json::from_str(&data).with_context(|| "failed to parse config JSON")?;
        config
            .validate()
            .with_context(|| format!("invalid config in {}", path.display()))?;
        Ok(config)
    }

    /// Load from `path` if it exists, defaults otherwise.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("loading config from {}", path.display());
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to a file path
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create config dir {}", parent.display()))?;
        }
        let data = serde_json::to_string_pretty(self)?;
        std::fs::write(path, data)
            .with_context(|| format!("failed to write config to {}", path.display()))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.target_fps == 0 {
            return Err(ConfigError::ZeroFps);
        }
        if self.fps_window == 0 {
            return Err(ConfigError::EmptyFpsWindow);
        }
        if self.label_every == 0 {
            return Err(ConfigError::ZeroLabelInterval);
        }
        if let Some(region) = self.region {
            if region.width < 0 || region.height < 0 {
                return Err(ConfigError::NegativeRegion(region));
            }
        }
        Ok(())
    }

    pub fn display_settings(&self) -> DisplaySettings {
        DisplaySettings {
            target_fps: self.target_fps,
            fps_window: self.fps_window,
            label_every: self.label_every,
            pacing_correction: Duration::from_micros(self.pacing_correction_us),
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}
