//! RGB to planar 4:2:0 conversion shared by the encoders.
//!
//! BT.601 limited range. Planes may be larger than the raster (macroblock
//! padding); the extra area replicates the last row and column.

use crate::types::LinearRaster;

/// BT.601 limited-range luma.
#[inline]
pub(crate) fn luma(r: i32, g: i32, b: i32) -> u8 {
    (((66 * r + 129 * g + 25 * b + 128) >> 8) + 16) as u8
}

/// BT.601 limited-range chroma pair.
#[inline]
pub(crate) fn chroma(r: i32, g: i32, b: i32) -> (u8, u8) {
    let cb = ((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128;
    let cr = ((112 * r - 94 * g - 18 * b + 128) >> 8) + 128;
    (cb as u8, cr as u8)
}

/// Reusable I420 planes.
#[derive(Debug, Clone)]
pub(crate) struct Yuv420 {
    width: usize,
    height: usize,
    pub(crate) y: Vec<u8>,
    pub(crate) cb: Vec<u8>,
    pub(crate) cr: Vec<u8>,
}

impl Yuv420 {
    /// Planes of `width`×`height` luma samples; both must be even.
    pub(crate) fn new(width: usize, height: usize) -> Self {
        debug_assert!(width % 2 == 0 && height % 2 == 0);
        let luma_len = width * height;
        Self {
            width,
            height,
            y: vec![0; luma_len],
            cb: vec![0; luma_len / 4],
            cr: vec![0; luma_len / 4],
        }
    }

    pub(crate) fn luma_stride(&self) -> usize {
        self.width
    }

    pub(crate) fn chroma_stride(&self) -> usize {
        self.width / 2
    }

    /// Convert `raster` into the planes, averaging each 2×2 block for chroma.
    pub(crate) fn load(&mut self, raster: &LinearRaster) {
        let max_x = raster.width() as usize - 1;
        let max_y = raster.height() as usize - 1;
        let data = raster.as_bytes();
        let row_len = raster.row_len();

        let rgb = |x: usize, y: usize| {
            let offset = y.min(max_y) * row_len + x.min(max_x) * 3;
            (
                data[offset] as i32,
                data[offset + 1] as i32,
                data[offset + 2] as i32,
            )
        };

        for y in 0..self.height {
            for x in 0..self.width {
                let (r, g, b) = rgb(x, y);
                self.y[y * self.width + x] = luma(r, g, b);
            }
        }

        let chroma_w = self.width / 2;
        for cy in 0..self.height / 2 {
            for cx in 0..chroma_w {
                let (mut r, mut g, mut b) = (0, 0, 0);
                for (dx, dy) in [(0, 0), (1, 0), (0, 1), (1, 1)] {
                    let (pr, pg, pb) = rgb(cx * 2 + dx, cy * 2 + dy);
                    r += pr;
                    g += pg;
                    b += pb;
                }
                let (u, v) = chroma((r + 2) / 4, (g + 2) / 4, (b + 2) / 4);
                self.cb[cy * chroma_w + cx] = u;
                self.cr[cy * chroma_w + cx] = v;
            }
        }
    }
}
