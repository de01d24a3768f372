//! # screenrec-core
//!
//! Real-time capture pipeline for recording a GPU framebuffer to a
//! streaming Matroska file.
//!
//! This crate contains:
//! - **Address translation**: `tiled_offset`, `convert_rows`, `detile` for X-tiled scanout buffers
//! - **Worker pool**: `DetilePool`, persistent threads converting row bands in parallel
//! - **Pacing**: `FrameSource`, `VblankClock` for vblank-driven capture with drop detection
//! - **Encoding**: the `Encoder` trait, `X264Encoder` on libx264 (feature `x264`, on by default) and `PcmEncoder`, a lossless reference encoder
//! - **Muxing**: `MatroskaMuxer`, incremental Matroska output with backpatched sizes and cues
//! - **Scheduling**: `CaptureScheduler`, the per-frame state machine tying it all together
//! - **Screenshots**: `write_ppm` for single frames
//! - **Error**: `RecError`, typed, `thiserror`-based error hierarchy

pub mod detile;
pub mod encoder;
pub mod error;
pub mod h264;
pub mod mkv;
pub mod scheduler;
pub mod screenshot;
pub mod source;
pub mod tiling;
pub mod types;
pub mod vblank;
#[cfg(feature = "x264")]
pub mod x264_encoder;
mod yuv;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use detile::{DetilePool, partition_rows};
pub use encoder::{ColorFormat, EncodedUnit, Encoder, EncoderSettings, ParameterSets, Preset};
pub use error::RecError;
pub use h264::PcmEncoder;
pub use mkv::{MatroskaMuxer, MuxSummary, PatchField, Timebase, TrackInfo};
pub use scheduler::{CaptureScheduler, RecorderConfig, RecordingSummary};
pub use screenshot::write_ppm;
pub use source::SyntheticSource;
pub use tiling::{detile, linear_offset, tiled_offset};
pub use types::{CaptureRegion, Geometry, LinearRaster, PixelFormat, PixelLayout, SourceFrame};
pub use vblank::{FrameSource, Tick, VblankClock, VblankTarget};
#[cfg(feature = "x264")]
pub use x264_encoder::X264Encoder;
