//! Tiled-to-linear pixel address translation.
//!
//! The GPU scans out of buffers stored in 4 KiB X-tiles: each tile holds
//! 128 pixels × 8 rows at 4 bytes per pixel (512 bytes per tile row), and
//! tiles are laid out left-to-right, then top-to-bottom. Reading such a
//! buffer as a raster means translating every `(x, y)` into a byte offset:
//!
//! ```text
//! offset = (y / 8) * 4096 * (pitch / 512)    tile row
//!        + (x / 128) * 4096                  tile column
//!        + (y % 8) * 512                     row inside the tile
//!        + (x % 128) * 4                     pixel inside the row
//! ```
//!
//! [`convert_rows`] is the only per-pixel loop in the crate: the
//! single-threaded [`detile`], the screenshot writer and every
//! [`DetilePool`](crate::detile::DetilePool) worker go through it.

use std::ops::Range;

use crate::error::RecError;
use crate::types::{CaptureRegion, LinearRaster, PixelFormat, PixelLayout, SourceFrame};

// ── Constants ────────────────────────────────────────────────────

/// Tile width in pixels.
pub const TILE_WIDTH: u32 = 128;
/// Tile height in rows.
pub const TILE_HEIGHT: u32 = 8;
/// Bytes per tile.
pub const TILE_BYTES: usize = 4096;
/// Bytes per row inside a tile.
pub const TILE_ROW_BYTES: usize = 512;

const SOURCE_BPP: usize = PixelFormat::Xrgb8888.bytes_per_pixel();

// ── Address translation ──────────────────────────────────────────

/// Byte offset of pixel `(x, y)` inside an X-tiled buffer of row pitch `pitch`.
#[inline]
pub fn tiled_offset(x: u32, y: u32, pitch: u32) -> usize {
    let (x, y, pitch) = (x as usize, y as usize, pitch as usize);
    let tile_row = y / TILE_HEIGHT as usize;
    let tile_col = x / TILE_WIDTH as usize;
    let tiles_per_row = pitch / TILE_ROW_BYTES;

    tile_row * TILE_BYTES * tiles_per_row
        + tile_col * TILE_BYTES
        + (y % TILE_HEIGHT as usize) * TILE_ROW_BYTES
        + (x % TILE_WIDTH as usize) * SOURCE_BPP
}

/// Byte offset of pixel `(x, y)` inside a linear buffer of row pitch `pitch`.
#[inline]
pub fn linear_offset(x: u32, y: u32, pitch: u32) -> usize {
    y as usize * pitch as usize + x as usize * SOURCE_BPP
}

impl PixelLayout {
    /// Byte offset of pixel `(x, y)` under this layout.
    #[inline]
    pub fn offset(self, x: u32, y: u32, pitch: u32) -> usize {
        match self {
            PixelLayout::Linear => linear_offset(x, y, pitch),
            PixelLayout::TiledX4Kb => tiled_offset(x, y, pitch),
        }
    }
}

// ── Region validation ────────────────────────────────────────────

impl SourceFrame<'_> {
    /// Verify that every pixel of `region` can be read from this frame.
    ///
    /// After a successful check [`convert_rows`] cannot index out of bounds.
    pub fn check_region(&self, region: CaptureRegion) -> Result<(), RecError> {
        let x_end = region.x as u64 + region.width as u64;
        let y_end = region.y as u64 + region.height as u64;

        if region.width == 0
            || region.height == 0
            || x_end > self.width as u64
            || y_end > self.height as u64
        {
            return Err(RecError::Geometry(format!(
                "{}x{} at ({}, {}) exceeds the {}x{} framebuffer",
                region.width, region.height, region.x, region.y, self.width, self.height
            )));
        }

        let bpp = self.format.bytes_per_pixel();
        if x_end * bpp as u64 > self.pitch as u64 {
            return Err(RecError::Geometry(format!(
                "region ends at x = {x_end}, beyond pitch {}",
                self.pitch
            )));
        }

        if self.layout == PixelLayout::TiledX4Kb && self.pitch as usize % TILE_ROW_BYTES != 0 {
            return Err(RecError::Config(format!(
                "tiled pitch {} is not a multiple of {TILE_ROW_BYTES}",
                self.pitch
            )));
        }

        // Both layouts place the bottom-right pixel of a rectangle last.
        let last = self
            .layout
            .offset(x_end as u32 - 1, y_end as u32 - 1, self.pitch);
        let needed = last + bpp;
        if needed > self.data.len() {
            return Err(RecError::SourceTooSmall {
                needed,
                actual: self.data.len(),
            });
        }

        Ok(())
    }
}

// ── Conversion ───────────────────────────────────────────────────

/// Convert `rows` (relative to `region.y`) of `region` into packed RGB.
///
/// Source pixels are read as (B, G, R, X) and stored as (R, G, B).
/// `out` must hold exactly `rows.len() * region.width * 3` bytes and
/// `source.check_region(region)` must have succeeded.
pub fn convert_rows(
    source: &SourceFrame<'_>,
    region: CaptureRegion,
    rows: Range<u32>,
    out: &mut [u8],
) {
    match source.layout {
        PixelLayout::Linear => convert_with(source, region, rows, out, linear_offset),
        PixelLayout::TiledX4Kb => convert_with(source, region, rows, out, tiled_offset),
    }
}

#[inline(always)]
fn convert_with<F>(
    source: &SourceFrame<'_>,
    region: CaptureRegion,
    rows: Range<u32>,
    out: &mut [u8],
    offset: F,
) where
    F: Fn(u32, u32, u32) -> usize,
{
    let row_len = region.width as usize * LinearRaster::BYTES_PER_PIXEL;
    debug_assert_eq!(out.len(), rows.len() * row_len);

    for (row, dst_row) in rows.zip(out.chunks_exact_mut(row_len)) {
        let y = region.y + row;
        for (col, dst) in dst_row.chunks_exact_mut(LinearRaster::BYTES_PER_PIXEL).enumerate() {
            let src = offset(region.x + col as u32, y, source.pitch);
            dst[0] = source.data[src + 2];
            dst[1] = source.data[src + 1];
            dst[2] = source.data[src];
        }
    }
}

/// Convert `region` of `source` on the calling thread.
pub fn detile(source: &SourceFrame<'_>, region: CaptureRegion) -> Result<LinearRaster, RecError> {
    source.check_region(region)?;
    let mut raster = LinearRaster::new(region.width, region.height);
    convert_rows(source, region, 0..region.height, raster.as_bytes_mut());
    Ok(raster)
}

// ── Tests ────────────────────────────────────────────────────────
