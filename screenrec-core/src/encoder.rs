//! Video encoder interface.
//!
//! The recorder treats compression as a black box: an [`Encoder`] is
//! configured once with the capture geometry, reports its parameter sets
//! before the first frame, and turns each [`LinearRaster`] into zero or
//! more [`EncodedUnit`]s. Zero is normal for encoders with look-ahead.
//!
//! Payloads use AVC length-prefixed framing (4-byte big-endian NAL
//! lengths), matching the `lengthSizeMinusOne = 3` the muxer declares.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::RecError;
use crate::types::LinearRaster;

// ── EncodedUnit ──────────────────────────────────────────────────

/// One compressed access unit, consumed exactly once by the muxer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedUnit {
    /// Length-prefixed NAL units.
    pub data: Vec<u8>,
    /// Whether decoding can start at this unit.
    pub keyframe: bool,
    /// Presentation time in frames since session start.
    pub pts: u64,
}

// ── ParameterSets ────────────────────────────────────────────────

/// H.264 sequence and picture parameter sets, as complete NAL units
/// without start codes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParameterSets {
    pub sps: Vec<u8>,
    pub pps: Vec<u8>,
}

// ── EncoderSettings ──────────────────────────────────────────────

/// Speed/quality trade-off requested from the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Ultrafast,
    Superfast,
    Veryfast,
    Faster,
    Fast,
    #[default]
    Medium,
    Slow,
    Slower,
    Veryslow,
}

impl Preset {
    pub const ALL: [Preset; 9] = [
        Preset::Ultrafast,
        Preset::Superfast,
        Preset::Veryfast,
        Preset::Faster,
        Preset::Fast,
        Preset::Medium,
        Preset::Slow,
        Preset::Slower,
        Preset::Veryslow,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Preset::Ultrafast => "ultrafast",
            Preset::Superfast => "superfast",
            Preset::Veryfast => "veryfast",
            Preset::Faster => "faster",
            Preset::Fast => "fast",
            Preset::Medium => "medium",
            Preset::Slow => "slow",
            Preset::Slower => "slower",
            Preset::Veryslow => "veryslow",
        }
    }
}

impl FromStr for Preset {
    type Err = RecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Preset::ALL
            .into_iter()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| RecError::Config(format!("unknown preset {s:?}")))
    }
}

impl fmt::Display for Preset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Colour layout of the rasters handed to the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorFormat {
    /// Packed 8-bit R, G, B.
    Rgb24,
}

/// One-time encoder configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EncoderSettings {
    pub width: u32,
    pub height: u32,
    pub color: ColorFormat,
    pub preset: Preset,
    /// Frames between forced keyframes.
    pub keyframe_interval: u32,
    /// Display refresh rate; one `pts` step is one refresh.
    pub refresh_hz: u32,
    /// Refreshes between captured frames.
    pub interval: u32,
}

// ── Encoder ──────────────────────────────────────────────────────

/// A frame encoder driven synchronously by the capture loop.
pub trait Encoder {
    /// SPS and PPS for the codec-private header. Must be available
    /// before the first call to [`encode`](Self::encode).
    fn parameter_sets(&self) -> Result<ParameterSets, RecError>;

    /// Encode one raster presented at `pts` frames.
    fn encode(&mut self, raster: &LinearRaster, pts: u64) -> Result<Vec<EncodedUnit>, RecError>;

    /// Drain any units still held back at end of stream.
    fn flush(&mut self) -> Result<Vec<EncodedUnit>, RecError> {
        Ok(Vec::new())
    }
}
