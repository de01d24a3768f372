//! # screenrec: framebuffer recorder
//!
//! Records the configured frame source into a streaming Matroska file,
//! or grabs a single frame as a PPM image.
//!
//! ## Modes
//!
//! - **record**: capture until ENTER, Ctrl-C or the configured time limit.
//! - **screenshot**: write one frame and exit.
//! - **--gen-config**: print the default configuration.

pub mod config;
pub mod session;
