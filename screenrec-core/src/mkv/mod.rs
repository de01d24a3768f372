//! Streaming Matroska output.
//!
//! - [`ebml`]: element ids, size fields and the compact header builder
//! - [`cues`]: chunked keyframe index
//! - [`muxer`]: [`MatroskaMuxer`], the incremental writer

pub mod cues;
pub mod ebml;
pub mod muxer;

pub use cues::{CueEntry, CueList};
pub use muxer::{MatroskaMuxer, MuxSummary, PatchField, Timebase, TrackInfo};
