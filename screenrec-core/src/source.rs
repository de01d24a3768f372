//! In-memory frame source.
//!
//! [`SyntheticSource`] behaves like a scanned-out framebuffer (X-tiled
//! unless another DRM modifier is asked for): it owns the buffer, advances a vblank counter from the wall clock and
//! repaints a moving test pattern on every wake-up. It is the bundled
//! backend of the `screenrec` binary and the fixture used by the tests.

use std::thread;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::RecError;
use crate::tiling::{TILE_HEIGHT, TILE_ROW_BYTES};
use crate::types::{FOURCC_XR24, MODIFIER_X_TILED, PixelFormat, PixelLayout, SourceFrame};
use crate::vblank::{FrameSource, VblankTarget};

// ── Painting ─────────────────────────────────────────────────────

/// Bytes needed for a `height`-row buffer of `pitch` bytes under `layout`.
pub fn buffer_len(layout: PixelLayout, pitch: u32, height: u32) -> usize {
    let rows = match layout {
        PixelLayout::Linear => height,
        PixelLayout::TiledX4Kb => height.div_ceil(TILE_HEIGHT) * TILE_HEIGHT,
    };
    rows as usize * pitch as usize
}

/// Allocate a buffer and fill it with `pattern(x, y) -> [r, g, b]`.
pub fn paint<F>(layout: PixelLayout, pitch: u32, width: u32, height: u32, pattern: F) -> Vec<u8>
where
    F: Fn(u32, u32) -> [u8; 3],
{
    let mut buffer = vec![0; buffer_len(layout, pitch, height)];
    paint_into(&mut buffer, layout, pitch, width, height, pattern);
    buffer
}

/// Fill an existing buffer, storing each pixel as (B, G, R, X).
pub fn paint_into<F>(
    buffer: &mut [u8],
    layout: PixelLayout,
    pitch: u32,
    width: u32,
    height: u32,
    pattern: F,
) where
    F: Fn(u32, u32) -> [u8; 3],
{
    for y in 0..height {
        for x in 0..width {
            let [r, g, b] = pattern(x, y);
            let offset = layout.offset(x, y, pitch);
            buffer[offset..offset + 4].copy_from_slice(&[b, g, r, 0xff]);
        }
    }
}

// ── SyntheticSource ──────────────────────────────────────────────

/// Wall-clock driven tiled framebuffer with a moving test pattern.
pub struct SyntheticSource {
    width: u32,
    height: u32,
    pitch: u32,
    format: PixelFormat,
    layout: PixelLayout,
    buffer: Vec<u8>,
    refresh_hz: u32,
    period: Duration,
    epoch: Instant,
}

impl SyntheticSource {
    /// Create an X-tiled `width × height` source refreshing at `refresh_hz`.
    pub fn new(width: u32, height: u32, refresh_hz: u32) -> Result<Self, RecError> {
        Self::with_drm_format(width, height, refresh_hz, FOURCC_XR24, MODIFIER_X_TILED)
    }

    /// Create a source whose buffer is described by a DRM fourcc and
    /// format modifier, the way a KMS framebuffer reports itself.
    pub fn with_drm_format(
        width: u32,
        height: u32,
        refresh_hz: u32,
        fourcc: u32,
        modifier: u64,
    ) -> Result<Self, RecError> {
        let format = PixelFormat::from_fourcc(fourcc)?;
        let layout = PixelLayout::from_modifier(modifier)?;
        if width == 0 || height == 0 {
            return Err(RecError::Config(format!(
                "synthetic source needs a non-empty size, got {width}x{height}"
            )));
        }
        if refresh_hz == 0 {
            return Err(RecError::Config("synthetic refresh rate must be > 0".into()));
        }

        // Scanout pitch is padded to whole tiles.
        let row_bytes = width * format.bytes_per_pixel() as u32;
        let pitch = row_bytes.div_ceil(TILE_ROW_BYTES as u32) * TILE_ROW_BYTES as u32;
        let mut source = Self {
            width,
            height,
            pitch,
            format,
            layout,
            buffer: vec![0; buffer_len(layout, pitch, height)],
            refresh_hz,
            period: Duration::from_secs(1) / refresh_hz,
            epoch: Instant::now(),
        };
        source.repaint(0);
        Ok(source)
    }

    fn current_sequence(&self) -> u64 {
        (self.epoch.elapsed().as_nanos() / self.period.as_nanos()) as u64
    }

    /// Gradient background with a white bar sweeping to the right.
    fn repaint(&mut self, sequence: u64) {
        let (width, height) = (self.width, self.height);
        let bar = (sequence * 4 % width as u64) as u32;
        paint_into(
            &mut self.buffer,
            self.layout,
            self.pitch,
            width,
            height,
            |x, y| {
                if x >= bar && x < bar + 8 {
                    [0xff, 0xff, 0xff]
                } else {
                    [
                        (x * 255 / width) as u8,
                        (y * 255 / height) as u8,
                        (sequence % 256) as u8,
                    ]
                }
            },
        );
    }
}

impl FrameSource for SyntheticSource {
    fn frame(&self) -> SourceFrame<'_> {
        SourceFrame {
            data: &self.buffer,
            pitch: self.pitch,
            width: self.width,
            height: self.height,
            format: self.format,
            layout: self.layout,
        }
    }

    fn refresh_hz(&self) -> Option<u32> {
        Some(self.refresh_hz)
    }

    fn wait_vblank(&mut self, target: VblankTarget) -> Result<u64, RecError> {
        let now = self.current_sequence();
        let target = match target {
            VblankTarget::Relative(n) => now + n as u64,
            VblankTarget::Absolute(sequence) => sequence,
        };

        if target > now {
            let deadline =
                self.epoch + Duration::from_nanos(self.period.as_nanos() as u64 * target);
            thread::sleep(deadline.saturating_duration_since(Instant::now()));
        }

        let sequence = self.current_sequence().max(target);
        trace!(sequence, "synthetic vblank");
        self.repaint(sequence);
        Ok(sequence)
    }
}

// ── Tests ────────────────────────────────────────────────────────
