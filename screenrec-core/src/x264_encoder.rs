//! H.264 through libx264.
//!
//! [`X264Encoder`] converts each raster to I420 and hands it to the `x264`
//! crate configured with the session's speed preset, keyframe interval and
//! frame rate. Output is requested without Annex B start codes, so every
//! unit already carries the 4-byte NAL lengths the muxer declares.
//!
//! | Setting            | Source                                   |
//! |--------------------|------------------------------------------|
//! | preset             | [`Preset`], one to one                   |
//! | keyint max         | `keyframe_interval`                      |
//! | fps / timebase     | `refresh_hz / interval`, `1 / refresh_hz` |
//! | tune               | none, zero latency                       |

use tracing::debug;
use x264::{Colorspace, Image, Plane, Setup, Tune};

use crate::encoder::{ColorFormat, EncodedUnit, Encoder, EncoderSettings, ParameterSets, Preset};
use crate::error::RecError;
use crate::types::LinearRaster;
use crate::yuv::Yuv420;

const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_LENGTH_BYTES: usize = 4;

fn x264_preset(preset: Preset) -> x264::Preset {
    match preset {
        Preset::Ultrafast => x264::Preset::Ultrafast,
        Preset::Superfast => x264::Preset::Superfast,
        Preset::Veryfast => x264::Preset::Veryfast,
        Preset::Faster => x264::Preset::Faster,
        Preset::Fast => x264::Preset::Fast,
        Preset::Medium => x264::Preset::Medium,
        Preset::Slow => x264::Preset::Slow,
        Preset::Slower => x264::Preset::Slower,
        Preset::Veryslow => x264::Preset::Veryslow,
    }
}

// ── NAL helpers ──────────────────────────────────────────────────

/// Split a buffer of 4-byte length-prefixed NAL units.
pub(crate) fn split_length_prefixed(mut data: &[u8]) -> Result<Vec<&[u8]>, RecError> {
    let mut nals = Vec::new();
    while !data.is_empty() {
        let Some((prefix, rest)) = data.split_first_chunk::<NAL_LENGTH_BYTES>() else {
            return Err(RecError::Encoder("truncated NAL length prefix".into()));
        };
        let len = u32::from_be_bytes(*prefix) as usize;
        if rest.len() < len {
            return Err(RecError::Encoder(format!(
                "NAL claims {len} bytes, {} left",
                rest.len()
            )));
        }
        let (nal, tail) = rest.split_at(len);
        nals.push(nal);
        data = tail;
    }
    Ok(nals)
}

/// First SPS and PPS found in an encoder header blob.
pub(crate) fn parameter_sets_from(headers: &[u8]) -> Result<ParameterSets, RecError> {
    let mut sets = ParameterSets::default();
    for nal in split_length_prefixed(headers)? {
        match nal.first().map(|b| b & 0x1f) {
            Some(NAL_SPS) if sets.sps.is_empty() => sets.sps = nal.to_vec(),
            Some(NAL_PPS) if sets.pps.is_empty() => sets.pps = nal.to_vec(),
            _ => {}
        }
    }
    Ok(sets)
}

// ── X264Encoder ──────────────────────────────────────────────────

/// libx264-backed encoder honouring the speed preset.
pub struct X264Encoder {
    /// Taken by [`flush`](Encoder::flush); libx264 drains by consuming.
    inner: Option<x264::Encoder>,
    settings: EncoderSettings,
    sets: ParameterSets,
    planes: Yuv420,
}

impl X264Encoder {
    pub fn new(settings: EncoderSettings) -> Result<Self, RecError> {
        let EncoderSettings {
            width,
            height,
            color,
            preset,
            keyframe_interval,
            refresh_hz,
            interval,
        } = settings;

        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(RecError::Encoder(format!(
                "4:2:0 encoding needs even, non-zero dimensions, got {width}x{height}"
            )));
        }
        if keyframe_interval == 0 || refresh_hz == 0 || interval == 0 {
            return Err(RecError::Encoder(format!(
                "invalid timing: keyframe interval {keyframe_interval}, \
                 {refresh_hz} Hz, interval {interval}"
            )));
        }
        match color {
            ColorFormat::Rgb24 => {}
        }

        let mut inner = Setup::preset(x264_preset(preset), Tune::None, false, true)
            .annexb(false)
            .fps(refresh_hz, interval)
            .timebase(1, refresh_hz)
            .max_keyframe_interval(keyframe_interval as i32)
            .build(Colorspace::I420, width as i32, height as i32)
            .map_err(|_| {
                RecError::Encoder(format!("libx264 refused {width}x{height} with {preset}"))
            })?;

        let sets = {
            let headers = inner
                .headers()
                .map_err(|_| RecError::Encoder("libx264 produced no headers".into()))?;
            parameter_sets_from(headers.entirety())?
        };

        debug!(
            width,
            height,
            %preset,
            keyframe_interval,
            sps_bytes = sets.sps.len(),
            "x264 encoder configured"
        );

        Ok(Self {
            inner: Some(inner),
            settings,
            sets,
            planes: Yuv420::new(width as usize, height as usize),
        })
    }
}

impl Encoder for X264Encoder {
    fn parameter_sets(&self) -> Result<ParameterSets, RecError> {
        Ok(self.sets.clone())
    }

    fn encode(&mut self, raster: &LinearRaster, pts: u64) -> Result<Vec<EncodedUnit>, RecError> {
        if raster.width() != self.settings.width || raster.height() != self.settings.height {
            return Err(RecError::Encoder(format!(
                "raster is {}x{}, encoder was configured for {}x{}",
                raster.width(),
                raster.height(),
                self.settings.width,
                self.settings.height
            )));
        }
        let Some(inner) = self.inner.as_mut() else {
            return Err(RecError::Encoder("encoder already flushed".into()));
        };

        self.planes.load(raster);
        let luma_stride = self.planes.luma_stride() as i32;
        let chroma_stride = self.planes.chroma_stride() as i32;
        let image = Image::new(
            Colorspace::I420,
            self.settings.width as i32,
            self.settings.height as i32,
            &[
                Plane { stride: luma_stride, data: &self.planes.y },
                Plane { stride: chroma_stride, data: &self.planes.cb },
                Plane { stride: chroma_stride, data: &self.planes.cr },
            ],
        );

        let (data, picture) = inner
            .encode(pts as i64, image)
            .map_err(|_| RecError::Encoder(format!("libx264 failed on frame {pts}")))?;
        let payload = data.entirety();
        if payload.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![EncodedUnit {
            data: payload.to_vec(),
            keyframe: picture.keyframe(),
            pts: picture.pts().max(0) as u64,
        }])
    }

    fn flush(&mut self) -> Result<Vec<EncodedUnit>, RecError> {
        let Some(inner) = self.inner.take() else {
            return Ok(Vec::new());
        };

        let mut units = Vec::new();
        let mut delayed = inner.flush();
        while let Some(result) = delayed.next() {
            let (data, picture) =
                result.map_err(|_| RecError::Encoder("libx264 failed while flushing".into()))?;
            let payload = data.entirety();
            if !payload.is_empty() {
                units.push(EncodedUnit {
                    data: payload.to_vec(),
                    keyframe: picture.keyframe(),
                    pts: picture.pts().max(0) as u64,
                });
            }
        }
        debug!(units = units.len(), "x264 encoder flushed");
        Ok(units)
    }
}

// ── Tests ────────────────────────────────────────────────────────
