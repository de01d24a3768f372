//! Domain-specific error types for the capture pipeline.
//!
//! All fallible operations return `Result<T, RecError>`.
//! Variants are grouped the way the recorder reacts to them: configuration
//! and device errors end the session, transient capacity errors are logged
//! and skipped, and anything that touches the container's size fields is
//! fatal because a mis-sized element invalidates the whole file.

use thiserror::Error;

use crate::mkv::muxer::PatchField;

/// The canonical error type for the recorder.
#[derive(Debug, Error)]
pub enum RecError {
    // ── Configuration Errors ─────────────────────────────────────
    /// The framebuffer uses a pixel format this recorder cannot read.
    #[error("unsupported pixel format {0:#010x}")]
    UnsupportedFormat(u32),

    /// The framebuffer uses a tiling modifier this recorder cannot read.
    #[error("unsupported pixel layout (modifier {0:#018x})")]
    UnsupportedLayout(u64),

    /// The requested capture rectangle is malformed or out of bounds.
    #[error("invalid geometry: {0}")]
    Geometry(String),

    /// A header element does not fit a single-byte size field.
    #[error("{element} too large: {size} bytes (max {max})")]
    HeaderTooLarge {
        element: &'static str,
        size: usize,
        max: usize,
    },

    /// The encoder did not report SPS and PPS before the header was built.
    #[error("encoder did not supply {0}")]
    MissingParameterSets(&'static str),

    /// A configuration value is outside its accepted range.
    #[error("configuration error: {0}")]
    Config(String),

    // ── Device / Timing Errors ───────────────────────────────────
    /// Waiting for the vertical blank failed.
    #[error("couldn't wait for vblank: {0}")]
    Vblank(String),

    /// The mapped buffer is too small for the requested region.
    #[error("source buffer too small: need {needed} bytes, have {actual}")]
    SourceTooSmall { needed: usize, actual: usize },

    /// A detile worker failed while converting its band.
    #[error("detile worker {0} failed")]
    WorkerFailed(usize),

    // ── Encoder Errors ───────────────────────────────────────────
    /// The encoder rejected a frame or its configuration.
    #[error("encoder error: {0}")]
    Encoder(String),

    // ── Transient Errors ─────────────────────────────────────────
    /// A compressed unit exceeds the container's single-block ceiling.
    #[error("unit too large for a block: {size} bytes (max {max})")]
    UnitTooLarge { size: usize, max: usize },

    /// Writing a block to the output failed; whatever part of it reached
    /// the file has been voided, so the cluster stays consistent.
    #[error("couldn't write block: {0}")]
    BlockWrite(#[source] std::io::Error),

    // ── I/O Errors ───────────────────────────────────────────────
    /// The output file reported an error.
    #[error("output error: {0}")]
    Io(#[from] std::io::Error),

    /// Overwriting a reserved size field failed.
    #[error("couldn't backpatch {field:?}: {source}")]
    Backpatch {
        field: PatchField,
        #[source]
        source: std::io::Error,
    },
}

impl RecError {
    /// Whether the recording may continue after this error.
    ///
    /// Only per-unit conditions qualify; the affected unit is dropped.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, RecError::UnitTooLarge { .. } | RecError::BlockWrite(_))
    }
}
