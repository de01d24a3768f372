//! Single-frame capture to a binary PPM (P6) image.

use std::io::Write;

use tracing::debug;

use crate::error::RecError;
use crate::tiling::detile;
use crate::types::{CaptureRegion, SourceFrame};

/// Detile `region` of `source` and write it as `P6` with a maxval of 255.
pub fn write_ppm<W: Write>(source: &SourceFrame<'_>, region: CaptureRegion, mut out: W) -> Result<(), RecError> {
    let raster = detile(source, region)?;

    write!(out, "P6\n{}\n{}\n255\n", raster.width(), raster.height())?;
    out.write_all(raster.as_bytes())?;
    out.flush()?;

    debug!(
        width = raster.width(),
        height = raster.height(),
        layout = ?source.layout,
        "screenshot written"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::paint;
    use crate::types::{PixelFormat, PixelLayout};

    fn frame(data: &[u8], layout: PixelLayout) -> SourceFrame<'_> {
        SourceFrame {
            data,
            pitch: 512,
            width: 128,
            height: 16,
            format: PixelFormat::Xrgb8888,
            layout,
        }
    }

    #[test]
    fn writes_header_and_rows() {
        let data = paint(PixelLayout::TiledX4Kb, 512, 128, 16, |x, y| [x as u8, y as u8, 1]);
        let mut out = Vec::new();
        let region = CaptureRegion { x: 125, y: 7, width: 3, height: 2 };
        write_ppm(&frame(&data, PixelLayout::TiledX4Kb), region, &mut out).unwrap();

        let header = b"P6\n3\n2\n255\n";
        assert_eq!(&out[..header.len()], header);
        let pixels = &out[header.len()..];
        assert_eq!(pixels.len(), 3 * 2 * 3);
        assert_eq!(&pixels[..6], &[125, 7, 1, 126, 7, 1]);
        assert_eq!(&pixels[6..9], &[127, 7, 1]);
        // Row 8 starts the next tile row.
        assert_eq!(&pixels[9..12], &[125, 8, 1]);
    }

    #[test]
    fn linear_frames_honour_region() {
        let data = paint(PixelLayout::Linear, 512, 128, 16, |x, y| [x as u8, y as u8, 2]);
        let mut out = Vec::new();
        let region = CaptureRegion { x: 5, y: 3, width: 2, height: 1 };
        write_ppm(&frame(&data, PixelLayout::Linear), region, &mut out).unwrap();
        assert_eq!(&out[out.len() - 6..], &[5, 3, 2, 6, 3, 2]);
    }

    #[test]
    fn out_of_bounds_region_fails() {
        let data = paint(PixelLayout::Linear, 512, 128, 16, |_, _| [0, 0, 0]);
        let region = CaptureRegion { x: 120, y: 0, width: 16, height: 1 };
        let err = write_ppm(&frame(&data, PixelLayout::Linear), region, Vec::new()).unwrap_err();
        assert!(matches!(err, RecError::Geometry(_)));
    }
}
