//! Configuration for the recorder binary.

use std::path::Path;

use serde::{Deserialize, Serialize};

use screenrec_core::types::{FOURCC_XR24, MODIFIER_X_TILED};
use screenrec_core::{Geometry, Preset, RecError, RecorderConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScreenrecConfig {
    /// What and how often to capture.
    pub capture: CaptureConfig,
    /// The bundled synthetic framebuffer.
    pub source: SourceConfig,
    /// Encoder tuning.
    pub encoder: EncoderConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Capture settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Capture rectangle `X,Y[,WxH]`; empty means the whole framebuffer.
    pub geometry: String,
    /// Capture every N vblanks (1..=9).
    pub interval: u32,
    /// Detile threads; 0 = one per online CPU.
    pub workers: usize,
    /// Stop after this many seconds; 0 = until stopped.
    pub max_seconds: f64,
}

/// Synthetic framebuffer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub width: u32,
    pub height: u32,
    pub refresh_hz: u32,
    /// DRM fourcc of the buffer; only `XR24` is readable.
    pub fourcc: u32,
    /// DRM format modifier: 0 for linear, `0x0100000000000001` for X-tiled.
    pub modifier: u64,
}

/// Encoder settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Speed preset: "ultrafast" ... "veryslow".
    pub preset: Preset,
    /// Frames between keyframes.
    pub keyframe_interval: u32,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            geometry: String::new(),
            interval: 1,
            workers: 0,
            max_seconds: 0.0,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            refresh_hz: 60,
            fourcc: FOURCC_XR24,
            modifier: MODIFIER_X_TILED,
        }
    }
}

impl Default for EncoderConfig {
    fn default() -> Self {
        Self {
            preset: Preset::Medium,
            keyframe_interval: 60,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

/// How [`ScreenrecConfig::load`] obtained its result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigOrigin {
    /// Parsed from the file.
    File,
    /// No readable file; defaults.
    Missing,
    /// The file did not parse; defaults.
    Invalid(String),
}

impl ConfigOrigin {
    pub fn report(&self, path: &Path) {
        match self {
            ConfigOrigin::File => tracing::info!("config loaded from {}", path.display()),
            ConfigOrigin::Missing => {
                tracing::info!("no config at {}; using defaults", path.display())
            }
            ConfigOrigin::Invalid(e) => {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display())
            }
        }
    }
}

impl ScreenrecConfig {
    pub const MAX_INTERVAL: u32 = 9;

    /// Load configuration from a TOML file, falling back to defaults.
    ///
    /// Nothing is logged here since this runs before the subscriber
    /// exists; call [`ConfigOrigin::report`] once logging is up.
    pub fn load(path: &Path) -> (Self, ConfigOrigin) {
        match std::fs::read_to_string(path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => (config, ConfigOrigin::File),
                Err(e) => (Self::default(), ConfigOrigin::Invalid(e.to_string())),
            },
            Err(_) => (Self::default(), ConfigOrigin::Missing),
        }
    }

    /// Parsed capture rectangle.
    pub fn geometry(&self) -> Result<Geometry, RecError> {
        match self.capture.geometry.trim() {
            "" => Ok(Geometry::default()),
            text => text.parse(),
        }
    }

    /// Convert into the core's session settings, clamping out-of-range
    /// values.
    pub fn to_recorder_config(&self) -> Result<RecorderConfig, RecError> {
        let interval = self.capture.interval.clamp(1, Self::MAX_INTERVAL);
        if interval != self.capture.interval {
            tracing::warn!(
                requested = self.capture.interval,
                used = interval,
                "capture interval out of range"
            );
        }

        Ok(RecorderConfig {
            geometry: self.geometry()?,
            interval,
            workers: self.capture.workers,
            preset: self.encoder.preset,
            keyframe_interval: self.encoder.keyframe_interval.max(1),
            max_seconds: (self.capture.max_seconds > 0.0).then_some(self.capture.max_seconds),
        })
    }
}

// ── Tests ────────────────────────────────────────────────────────
