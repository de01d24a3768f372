//! Lossless reference H.264 encoder.
//!
//! [`PcmEncoder`] emits a Baseline-profile elementary stream in which every
//! macroblock is coded as I_PCM: raw 4:2:0 samples, no prediction and no
//! transform. Files are large but decode bit-exactly in any H.264 player,
//! which makes it a dependable stand-in when the x264 backend is not
//! compiled in, and a deterministic encoder for tests.
//!
//! ## Stream layout
//!
//! | NAL        | Contents                                              |
//! |------------|-------------------------------------------------------|
//! | SPS        | Baseline, level 5.2, POC type 2, one reference frame  |
//! | PPS        | CAVLC, deblocking control present                     |
//! | IDR / non-IDR slice | one I slice per frame, all macroblocks I_PCM |
//!
//! Every picture is a reference picture, so POC type 2 stays valid.

use tracing::{debug, warn};

use crate::encoder::{ColorFormat, EncodedUnit, Encoder, EncoderSettings, ParameterSets};
use crate::error::RecError;
use crate::types::LinearRaster;
use crate::yuv::Yuv420;

// ── Constants ────────────────────────────────────────────────────

const NAL_SLICE: u8 = 1;
const NAL_IDR_SLICE: u8 = 5;
const NAL_SPS: u8 = 7;
const NAL_PPS: u8 = 8;
const NAL_REF_IDC: u8 = 3;

const PROFILE_BASELINE: u32 = 66;
/// constraint_set0_flag and constraint_set1_flag.
const CONSTRAINT_FLAGS: u32 = 0xc0;
const LEVEL_5_2: u32 = 52;
/// Largest frame, in macroblocks, level 5.2 allows.
const LEVEL_MAX_FRAME_MBS: u32 = 36_864;

const LOG2_MAX_FRAME_NUM: u32 = 4;
const SLICE_TYPE_I: u32 = 7;
const MB_TYPE_I_PCM: u32 = 25;
const MB_SIZE: usize = 16;
const MB_BYTES: usize = 256 + 64 + 64;

// ── BitWriter ────────────────────────────────────────────────────

/// MSB-first bit writer producing an RBSP.
#[derive(Debug, Default)]
pub(crate) struct BitWriter {
    bytes: Vec<u8>,
    current: u8,
    used: u32,
}

impl BitWriter {
    pub(crate) fn with_capacity(bytes: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(bytes),
            ..Self::default()
        }
    }

    pub(crate) fn put_bit(&mut self, bit: bool) {
        self.current = (self.current << 1) | bit as u8;
        self.used += 1;
        if self.used == 8 {
            self.bytes.push(self.current);
            self.current = 0;
            self.used = 0;
        }
    }

    pub(crate) fn put_bits(&mut self, value: u64, count: u32) {
        for i in (0..count).rev() {
            self.put_bit((value >> i) & 1 == 1);
        }
    }

    /// Unsigned Exp-Golomb.
    pub(crate) fn put_ue(&mut self, value: u32) {
        let code = value as u64 + 1;
        let len = 64 - code.leading_zeros();
        self.put_bits(0, len - 1);
        self.put_bits(code, len);
    }

    /// Signed Exp-Golomb.
    pub(crate) fn put_se(&mut self, value: i32) {
        let mapped = if value > 0 {
            (value as u32) * 2 - 1
        } else {
            value.unsigned_abs() * 2
        };
        self.put_ue(mapped);
    }

    pub(crate) fn is_aligned(&self) -> bool {
        self.used == 0
    }

    pub(crate) fn align_zero(&mut self) {
        while !self.is_aligned() {
            self.put_bit(false);
        }
    }

    /// Append whole bytes; the writer must be byte aligned.
    pub(crate) fn put_bytes(&mut self, bytes: &[u8]) {
        debug_assert!(self.is_aligned());
        self.bytes.extend_from_slice(bytes);
    }

    /// Append `rbsp_trailing_bits` and return the payload.
    pub(crate) fn finish(mut self) -> Vec<u8> {
        self.put_bit(true);
        self.align_zero();
        self.bytes
    }
}

/// Wrap an RBSP in a NAL unit, inserting emulation-prevention bytes.
pub(crate) fn nal_unit(nal_type: u8, rbsp: &[u8]) -> Vec<u8> {
    let mut nal = Vec::with_capacity(rbsp.len() + rbsp.len() / 64 + 1);
    nal.push((NAL_REF_IDC << 5) | nal_type);

    let mut zeros = 0;
    for &byte in rbsp {
        if zeros == 2 && byte <= 3 {
            nal.push(0x03);
            zeros = 0;
        }
        nal.push(byte);
        zeros = if byte == 0 { zeros + 1 } else { 0 };
    }
    nal
}

// ── PcmEncoder ───────────────────────────────────────────────────

/// All-I_PCM H.264 encoder.
pub struct PcmEncoder {
    settings: EncoderSettings,
    mb_width: u32,
    mb_height: u32,
    sps: Vec<u8>,
    pps: Vec<u8>,
    frame_index: u64,
    frame_num: u32,
    idr_pic_id: u32,
    /// Macroblock-padded planes, reused across frames.
    planes: Yuv420,
}

impl PcmEncoder {
    /// Configure an encoder for `settings`.
    ///
    /// Width and height must be even so the 4:2:0 crop is exact.
    pub fn new(settings: EncoderSettings) -> Result<Self, RecError> {
        let EncoderSettings {
            width,
            height,
            color,
            keyframe_interval,
            ..
        } = settings;

        if width == 0 || height == 0 || width % 2 != 0 || height % 2 != 0 {
            return Err(RecError::Encoder(format!(
                "PCM encoder needs even, non-zero dimensions, got {width}x{height}"
            )));
        }
        if keyframe_interval == 0 {
            return Err(RecError::Encoder("keyframe interval must be at least 1".into()));
        }
        match color {
            ColorFormat::Rgb24 => {}
        }

        let mb_width = width.div_ceil(MB_SIZE as u32);
        let mb_height = height.div_ceil(MB_SIZE as u32);
        if mb_width * mb_height > LEVEL_MAX_FRAME_MBS {
            warn!(
                width,
                height, "frame exceeds level 5.2 limits; some players may refuse it"
            );
        }

        let sps = nal_unit(NAL_SPS, &Self::sps_rbsp(width, height, mb_width, mb_height));
        let pps = nal_unit(NAL_PPS, &Self::pps_rbsp());

        debug!(
            width,
            height,
            preset = ?settings.preset,
            "PCM encoder configured (lossless, preset has no effect)"
        );

        Ok(Self {
            settings,
            mb_width,
            mb_height,
            sps,
            pps,
            frame_index: 0,
            frame_num: 0,
            idr_pic_id: 0,
            planes: Yuv420::new(mb_width as usize * MB_SIZE, mb_height as usize * MB_SIZE),
        })
    }

    fn sps_rbsp(width: u32, height: u32, mb_width: u32, mb_height: u32) -> Vec<u8> {
        let mut w = BitWriter::with_capacity(16);
        w.put_bits(PROFILE_BASELINE as u64, 8);
        w.put_bits(CONSTRAINT_FLAGS as u64, 8);
        w.put_bits(LEVEL_5_2 as u64, 8);
        w.put_ue(0); // seq_parameter_set_id
        w.put_ue(LOG2_MAX_FRAME_NUM - 4);
        w.put_ue(2); // pic_order_cnt_type
        w.put_ue(1); // max_num_ref_frames
        w.put_bit(false); // gaps_in_frame_num_value_allowed_flag
        w.put_ue(mb_width - 1);
        w.put_ue(mb_height - 1);
        w.put_bit(true); // frame_mbs_only_flag
        w.put_bit(true); // direct_8x8_inference_flag

        // 4:2:0 crop offsets are in units of two luma samples.
        let crop_right = (mb_width * MB_SIZE as u32 - width) / 2;
        let crop_bottom = (mb_height * MB_SIZE as u32 - height) / 2;
        let cropping = crop_right > 0 || crop_bottom > 0;
        w.put_bit(cropping);
        if cropping {
            w.put_ue(0);
            w.put_ue(crop_right);
            w.put_ue(0);
            w.put_ue(crop_bottom);
        }

        w.put_bit(false); // vui_parameters_present_flag
        w.finish()
    }

    fn pps_rbsp() -> Vec<u8> {
        let mut w = BitWriter::with_capacity(8);
        w.put_ue(0); // pic_parameter_set_id
        w.put_ue(0); // seq_parameter_set_id
        w.put_bit(false); // entropy_coding_mode_flag (CAVLC)
        w.put_bit(false); // bottom_field_pic_order_in_frame_present_flag
        w.put_ue(0); // num_slice_groups_minus1
        w.put_ue(0); // num_ref_idx_l0_default_active_minus1
        w.put_ue(0); // num_ref_idx_l1_default_active_minus1
        w.put_bit(false); // weighted_pred_flag
        w.put_bits(0, 2); // weighted_bipred_idc
        w.put_se(0); // pic_init_qp_minus26
        w.put_se(0); // pic_init_qs_minus26
        w.put_se(0); // chroma_qp_index_offset
        w.put_bit(true); // deblocking_filter_control_present_flag
        w.put_bit(false); // constrained_intra_pred_flag
        w.put_bit(false); // redundant_pic_cnt_present_flag
        w.finish()
    }

    fn slice_rbsp(&self, idr: bool) -> Vec<u8> {
        let mbs = (self.mb_width * self.mb_height) as usize;
        let mut w = BitWriter::with_capacity(mbs * (MB_BYTES + 2) + 16);

        w.put_ue(0); // first_mb_in_slice
        w.put_ue(SLICE_TYPE_I);
        w.put_ue(0); // pic_parameter_set_id
        w.put_bits(self.frame_num as u64, LOG2_MAX_FRAME_NUM);
        if idr {
            w.put_ue(self.idr_pic_id);
            w.put_bit(false); // no_output_of_prior_pics_flag
            w.put_bit(false); // long_term_reference_flag
        } else {
            w.put_bit(false); // adaptive_ref_pic_marking_mode_flag
        }
        w.put_se(0); // slice_qp_delta
        w.put_ue(1); // disable_deblocking_filter_idc

        let padded_w = self.planes.luma_stride();
        let chroma_w = self.planes.chroma_stride();
        for mb_y in 0..self.mb_height as usize {
            for mb_x in 0..self.mb_width as usize {
                w.put_ue(MB_TYPE_I_PCM);
                w.align_zero();

                for row in 0..MB_SIZE {
                    let start = (mb_y * MB_SIZE + row) * padded_w + mb_x * MB_SIZE;
                    w.put_bytes(&self.planes.y[start..start + MB_SIZE]);
                }
                for plane in [&self.planes.cb, &self.planes.cr] {
                    for row in 0..MB_SIZE / 2 {
                        let start = (mb_y * MB_SIZE / 2 + row) * chroma_w + mb_x * MB_SIZE / 2;
                        w.put_bytes(&plane[start..start + MB_SIZE / 2]);
                    }
                }
            }
        }

        w.finish()
    }
}

impl Encoder for PcmEncoder {
    fn parameter_sets(&self) -> Result<ParameterSets, RecError> {
        Ok(ParameterSets {
            sps: self.sps.clone(),
            pps: self.pps.clone(),
        })
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

        let idr = self.frame_index % self.settings.keyframe_interval as u64 == 0;
        if idr {
            self.frame_num = 0;
        }

        self.planes.load(raster);
        let nal = nal_unit(
            if idr { NAL_IDR_SLICE } else { NAL_SLICE },
            &self.slice_rbsp(idr),
        );

        let mut data = Vec::with_capacity(nal.len() + 4);
        data.extend_from_slice(&(nal.len() as u32).to_be_bytes());
        data.extend_from_slice(&nal);

        if idr {
            self.idr_pic_id = (self.idr_pic_id + 1) % 65_536;
        }
        self.frame_num = (self.frame_num + 1) % (1 << LOG2_MAX_FRAME_NUM);
        self.frame_index += 1;

        Ok(vec![EncodedUnit {
            data,
            keyframe: idr,
            pts,
        }])
    }
}

// ── Tests ────────────────────────────────────────────────────────
