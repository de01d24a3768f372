//! Shared frame and geometry types for the capture pipeline.
//!
//! [`SourceFrame`] is a borrowed view over the framebuffer exposed by a
//! [`FrameSource`](crate::vblank::FrameSource); [`LinearRaster`] is the
//! packed RGB buffer handed to the encoder.

use std::fmt;
use std::str::FromStr;

use crate::error::RecError;

// ── PixelFormat ──────────────────────────────────────────────────

/// DRM fourcc `XR24`.
pub const FOURCC_XR24: u32 = u32::from_le_bytes(*b"XR24");

/// Pixel format of the source framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelFormat {
    /// 4 bytes per pixel in memory order Blue, Green, Red, unused.
    Xrgb8888,
}

impl PixelFormat {
    /// Map a DRM fourcc code to a supported format.
    ///
    /// Frame sources that read a KMS framebuffer description go through
    /// this and [`PixelLayout::from_modifier`] so an unsupported buffer is
    /// rejected before capture starts.
    pub fn from_fourcc(fourcc: u32) -> Result<Self, RecError> {
        match fourcc {
            FOURCC_XR24 => Ok(PixelFormat::Xrgb8888),
            other => Err(RecError::UnsupportedFormat(other)),
        }
    }

    /// Bytes consumed by a single pixel in this format.
    pub const fn bytes_per_pixel(self) -> usize {
        match self {
            PixelFormat::Xrgb8888 => 4,
        }
    }
}

// ── PixelLayout ──────────────────────────────────────────────────

/// DRM format modifier for plain linear buffers.
pub const MODIFIER_LINEAR: u64 = 0;
/// DRM format modifier `I915_FORMAT_MOD_X_TILED`.
pub const MODIFIER_X_TILED: u64 = (1 << 56) | 1;

/// Memory arrangement of the source framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PixelLayout {
    /// Plain row-major rows of `pitch` bytes.
    Linear,
    /// 4 KiB X-tiles of 128 × 8 pixels.
    TiledX4Kb,
}

impl PixelLayout {
    /// Map a DRM format modifier to a supported layout.
    ///
    /// The top byte of a modifier is the vendor, the rest the vendor code.
    pub fn from_modifier(modifier: u64) -> Result<Self, RecError> {
        let vendor = (modifier >> 56) & 0xff;
        let value = modifier & 0x00ff_ffff_ffff_ffff;

        match (vendor, value) {
            (0, 0) => Ok(PixelLayout::Linear),
            (1, 1) => Ok(PixelLayout::TiledX4Kb),
            _ => Err(RecError::UnsupportedLayout(modifier)),
        }
    }
}

// ── SourceFrame ──────────────────────────────────────────────────

/// Read-only view over a mapped framebuffer.
///
/// The bytes belong to the frame source and may change between vblanks;
/// the pipeline only borrows them for the duration of one frame.
#[derive(Debug, Clone, Copy)]
pub struct SourceFrame<'a> {
    /// Mapped framebuffer bytes.
    pub data: &'a [u8],
    /// Row pitch in **bytes**.
    pub pitch: u32,
    /// Framebuffer width in pixels.
    pub width: u32,
    /// Framebuffer height in pixels.
    pub height: u32,
    pub format: PixelFormat,
    pub layout: PixelLayout,
}

// ── LinearRaster ─────────────────────────────────────────────────

/// Packed 24-bit RGB image, `width * height * 3` bytes, no row padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinearRaster {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl LinearRaster {
    pub const BYTES_PER_PIXEL: usize = 3;

    /// Allocate a zeroed raster.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * Self::BYTES_PER_PIXEL],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// Bytes in one packed row.
    pub fn row_len(&self) -> usize {
        self.width as usize * Self::BYTES_PER_PIXEL
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Returns row `y` as packed RGB.
    pub fn row(&self, y: u32) -> &[u8] {
        let start = y as usize * self.row_len();
        &self.data[start..start + self.row_len()]
    }

    /// Returns the `(r, g, b)` triple at `(x, y)`.
    ///
    /// # Panics
    ///
    /// Panics if `(x, y)` is out of bounds.
    pub fn pixel(&self, x: u32, y: u32) -> [u8; 3] {
        let offset = y as usize * self.row_len() + x as usize * Self::BYTES_PER_PIXEL;
        [self.data[offset], self.data[offset + 1], self.data[offset + 2]]
    }
}

// ── CaptureRegion ────────────────────────────────────────────────

/// A validated rectangle inside the framebuffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl CaptureRegion {
    /// The whole framebuffer.
    pub fn full(width: u32, height: u32) -> Self {
        Self {
            x: 0,
            y: 0,
            width,
            height,
        }
    }
}

// ── Geometry ─────────────────────────────────────────────────────

/// User-supplied capture rectangle, `X,Y` or `X,Y,WxH`.
///
/// An omitted size extends the rectangle to the framebuffer edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Geometry {
    pub x: u32,
    pub y: u32,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl Geometry {
    /// Clip against a `fb_width × fb_height` framebuffer.
    pub fn resolve(&self, fb_width: u32, fb_height: u32) -> Result<CaptureRegion, RecError> {
        let width = match self.width {
            Some(w) => w,
            None => fb_width.saturating_sub(self.x),
        };
        let height = match self.height {
            Some(h) => h,
            None => fb_height.saturating_sub(self.y),
        };

        let fits_x = self.x.checked_add(width).is_some_and(|end| end <= fb_width);
        let fits_y = self.y.checked_add(height).is_some_and(|end| end <= fb_height);

        if width == 0 || height == 0 || !fits_x || !fits_y {
            return Err(RecError::Geometry(format!(
                "{self} does not fit a {fb_width}x{fb_height} framebuffer"
            )));
        }

        Ok(CaptureRegion {
            x: self.x,
            y: self.y,
            width,
            height,
        })
    }
}

impl FromStr for Geometry {
    type Err = RecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || RecError::Geometry(format!("expected X,Y[,WxH], got {s:?}"));
        let number = |part: &str| part.trim().parse::<u32>().map_err(|_| bad());

        let mut parts = s.split(',');
        let x = number(parts.next().ok_or_else(bad)?)?;
        let y = number(parts.next().ok_or_else(bad)?)?;

        let (width, height) = match parts.next() {
            None => (None, None),
            Some(size) => {
                let (w, h) = size.split_once(['x', 'X']).ok_or_else(bad)?;
                (Some(number(w)?), Some(number(h)?))
            }
        };

        if parts.next().is_some() {
            return Err(bad());
        }

        Ok(Self {
            x,
            y,
            width,
            height,
        })
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{}", self.x, self.y)?;
        if let (Some(w), Some(h)) = (self.width, self.height) {
            write!(f, ",{w}x{h}")?;
        }
        Ok(())
    }
}
