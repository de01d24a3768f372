//! Incremental streaming Matroska writer.
//!
//! ```text
//!  EBML header
//!  Segment [size*]
//!  ├── SeekHead   Info, Tracks, Cues[pos*]
//!  ├── Info       TimestampScale, MuxingApp, WritingApp
//!  ├── Tracks     one H.264 video track
//!  ├── Cluster [size*]  Timestamp, SimpleBlock...
//!  ├── Cluster [size*]  ...
//!  └── Cues [size*]     CuePoint...
//! ```
//!
//! Fields marked `*` are written as placeholders and patched once their
//! value is known. Only the open cluster's bookkeeping and the cue list
//! are kept in memory; blocks go straight to the writer.

use std::io::{Seek, SeekFrom, Write};

use bytes::{BufMut, BytesMut};
use tracing::{debug, warn};

use super::cues::{CueEntry, CueList};
use super::ebml::{self, Element, MAX_BLOCK_BODY, UNKNOWN_SIZE_8, id};
use crate::encoder::{EncodedUnit, ParameterSets};
use crate::error::RecError;

// ── Constants ────────────────────────────────────────────────────

pub const CODEC_ID: &str = "V_MPEG4/ISO/AVC";
pub const MUXING_APP: &str = "screenrec";
pub const WRITING_APP: &str = concat!("screenrec ", env!("CARGO_PKG_VERSION"));

const TRACK_NUMBER: u8 = 1;
const TRACK_TYPE_VIDEO: u64 = 1;
const KEYFRAME_FLAG: u8 = 0x80;
/// Block header: id, 4-byte size, track, timestamp, flags.
const BLOCK_HEADER_LEN: usize = 9;
/// Cluster Timestamp element, the first thing in every cluster body.
const CLUSTER_TIMESTAMP_LEN: u64 = 10;
const PLACEHOLDER_WIDTH: usize = 8;

// ── Timebase ─────────────────────────────────────────────────────

/// Conversion from frame counts to container ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timebase {
    /// Duration of one display frame.
    pub frame_duration_ns: u64,
    /// Duration of one container tick (Info/TimestampScale).
    pub timestamp_scale_ns: u64,
}

impl Timebase {
    /// Millisecond ticks, the Matroska default.
    pub const DEFAULT_SCALE_NS: u64 = 1_000_000;
    pub const FALLBACK_REFRESH_HZ: u32 = 60;

    /// Timebase for a display refreshing at `refresh_hz`; falls back to
    /// 60 Hz when the rate is unknown.
    pub fn from_refresh(refresh_hz: Option<u32>) -> Self {
        let hz = match refresh_hz {
            Some(hz) if hz > 0 => hz,
            _ => {
                warn!(
                    fallback = Self::FALLBACK_REFRESH_HZ,
                    "display refresh rate unknown, assuming fallback"
                );
                Self::FALLBACK_REFRESH_HZ
            }
        };
        Self {
            frame_duration_ns: Self::frame_duration_ns(hz),
            timestamp_scale_ns: Self::DEFAULT_SCALE_NS,
        }
    }

    /// `1e9 / refresh_hz`, rounded half up.
    pub fn frame_duration_ns(refresh_hz: u32) -> u64 {
        let hz = refresh_hz.max(1) as u64;
        (1_000_000_000 + hz / 2) / hz
    }

    /// Absolute tick of frame `pts`, rounded half up.
    pub fn ticks(&self, pts: u64) -> u64 {
        let scale = self.timestamp_scale_ns.max(1) as u128;
        let ns = pts as u128 * self.frame_duration_ns as u128;
        ((ns + scale / 2) / scale) as u64
    }
}

// ── Track description ────────────────────────────────────────────

/// The single video track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackInfo {
    pub width: u32,
    pub height: u32,
    /// Nominal duration of one captured frame, if known.
    pub default_duration_ns: Option<u64>,
}

/// AVCDecoderConfigurationRecord with one SPS and one PPS and 4-byte
/// NAL lengths.
pub fn avc_config(sets: &ParameterSets) -> Result<Vec<u8>, RecError> {
    if sets.sps.is_empty() {
        return Err(RecError::MissingParameterSets("SPS"));
    }
    if sets.pps.is_empty() {
        return Err(RecError::MissingParameterSets("PPS"));
    }
    if sets.sps.len() < 4 {
        return Err(RecError::Encoder(format!(
            "SPS is only {} bytes long",
            sets.sps.len()
        )));
    }

    let mut record = Vec::with_capacity(11 + sets.sps.len() + sets.pps.len());
    record.push(1); // configurationVersion
    record.extend_from_slice(&sets.sps[1..4]); // profile, compatibility, level
    record.push(0xFC | 3); // lengthSizeMinusOne
    record.push(0xE0 | 1); // numOfSequenceParameterSets
    record.extend_from_slice(&(sets.sps.len() as u16).to_be_bytes());
    record.extend_from_slice(&sets.sps);
    record.push(1); // numOfPictureParameterSets
    record.extend_from_slice(&(sets.pps.len() as u16).to_be_bytes());
    record.extend_from_slice(&sets.pps);
    Ok(record)
}

// ── Backpatching ─────────────────────────────────────────────────

/// Fields written before their value is known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchField {
    SegmentSize,
    ClusterSize,
    CuesSize,
    CuesSeekPosition,
    /// Header of a block whose payload only partly reached the file.
    BlockHeader,
}

/// A reserved field: where it lives and how wide it is.
#[derive(Debug, Clone, Copy)]
struct Placeholder {
    field: PatchField,
    offset: u64,
    width: usize,
}

impl Placeholder {
    /// Reserve the field at the writer's current position.
    fn reserve<W: Write + Seek>(out: &mut W, field: PatchField) -> Result<Self, RecError> {
        let offset = out.stream_position()?;
        out.write_all(&UNKNOWN_SIZE_8.to_be_bytes())?;
        Ok(Self {
            field,
            offset,
            width: PLACEHOLDER_WIDTH,
        })
    }

    /// A field inside bytes already written at `offset`.
    fn at(field: PatchField, offset: u64) -> Self {
        Self {
            field,
            offset,
            width: PLACEHOLDER_WIDTH,
        }
    }

    fn encode(&self, value: u64) -> [u8; 8] {
        match self.field {
            PatchField::CuesSeekPosition => value.to_be_bytes(),
            PatchField::SegmentSize
            | PatchField::ClusterSize
            | PatchField::CuesSize
            | PatchField::BlockHeader => ebml::size_8(value),
        }
    }

    /// Overwrite the field with `value`, then return to where we were.
    fn patch<W: Write + Seek>(&self, out: &mut W, value: u64) -> Result<(), RecError> {
        let bytes = self.encode(value);
        let field = self.field;
        let fail = |source| RecError::Backpatch { field, source };

        let resume = out.stream_position().map_err(fail)?;
        out.seek(SeekFrom::Start(self.offset)).map_err(fail)?;
        out.write_all(&bytes[8 - self.width..]).map_err(fail)?;
        out.seek(SeekFrom::Start(resume)).map_err(fail)?;
        Ok(())
    }
}

/// Turn whatever part of a failed block reached the file into a Void
/// element, so the cluster body stays a valid element sequence.
///
/// Returns the position the next element starts at. Fewer than
/// `BLOCK_HEADER_LEN` stray bytes cannot hold a Void header; the writer is
/// rewound over them instead and the next element, always longer, covers
/// them. Failing to do either is fatal.
fn discard_partial_block<W: Write + Seek>(out: &mut W, block_start: u64) -> Result<u64, RecError> {
    let fail = |source| RecError::Backpatch {
        field: PatchField::BlockHeader,
        source,
    };

    let reached = out.stream_position().map_err(fail)?;
    let stray = reached.saturating_sub(block_start);
    out.seek(SeekFrom::Start(block_start)).map_err(fail)?;
    if stray < BLOCK_HEADER_LEN as u64 {
        warn!(block_start, stray, "rewound over partial block");
        return Ok(block_start);
    }

    let mut void = [0u8; BLOCK_HEADER_LEN];
    void[0] = id::VOID as u8;
    void[1..].copy_from_slice(&ebml::size_8(stray - BLOCK_HEADER_LEN as u64));
    out.write_all(&void).map_err(fail)?;
    out.seek(SeekFrom::Start(reached)).map_err(fail)?;
    warn!(block_start, stray, "partial block voided");
    Ok(reached)
}

// ── Muxer ────────────────────────────────────────────────────────

#[derive(Debug)]
struct OpenCluster {
    /// File offset of the cluster id.
    start: u64,
    size: Placeholder,
    /// Absolute tick the block timestamps are relative to.
    base: u64,
    /// Body bytes written so far.
    body_len: u64,
}

impl OpenCluster {
    fn data_start(&self) -> u64 {
        self.size.offset + self.size.width as u64
    }
}

/// What the muxer wrote over the whole session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MuxSummary {
    pub clusters: u64,
    pub blocks: u64,
    pub cues: u64,
    pub bytes: u64,
}

/// Writes one H.264 track to a Matroska file as units arrive.
pub struct MatroskaMuxer<W: Write + Seek> {
    out: W,
    timebase: Timebase,
    segment_data_start: u64,
    segment_size: Placeholder,
    cues_position: Placeholder,
    cluster: Option<OpenCluster>,
    cues: CueList,
    clusters: u64,
    blocks: u64,
}

impl<W: Write + Seek> MatroskaMuxer<W> {
    /// Write the file header and get ready for the first unit.
    ///
    /// Fails before writing anything if the parameter sets are missing or
    /// a header element does not fit its size field.
    pub fn new(
        mut out: W,
        track: TrackInfo,
        sets: &ParameterSets,
        timebase: Timebase,
    ) -> Result<Self, RecError> {
        let ebml_header = ebml_header()?;
        let info = info_element(timebase)?;
        let tracks = tracks_element(track, sets)?;

        // Positions are fixed-width, so the first pass only measures.
        let seek_len = seek_head(0, 0)?.len() as u64;
        let info_pos = seek_len;
        let tracks_pos = info_pos + info.len() as u64;
        let seek = seek_head(info_pos, tracks_pos)?;

        out.write_all(&ebml_header)?;
        let mut segment = BytesMut::with_capacity(4);
        ebml::put_id(&mut segment, id::SEGMENT);
        out.write_all(&segment)?;
        let segment_size = Placeholder::reserve(&mut out, PatchField::SegmentSize)?;
        let segment_data_start = out.stream_position()?;

        out.write_all(&seek)?;
        // The Cues entry comes last; its position is the final eight bytes.
        let cues_position = Placeholder::at(
            PatchField::CuesSeekPosition,
            segment_data_start + seek.len() as u64 - PLACEHOLDER_WIDTH as u64,
        );
        out.write_all(&info)?;
        out.write_all(&tracks)?;

        debug!(
            width = track.width,
            height = track.height,
            header_bytes = out.stream_position()?,
            "matroska header written"
        );

        Ok(Self {
            out,
            timebase,
            segment_data_start,
            segment_size,
            cues_position,
            cluster: None,
            cues: CueList::new(),
            clusters: 0,
            blocks: 0,
        })
    }

    pub fn timebase(&self) -> Timebase {
        self.timebase
    }

    pub fn cluster_count(&self) -> u64 {
        self.clusters
    }

    pub fn block_count(&self) -> u64 {
        self.blocks
    }

    pub fn cue_count(&self) -> usize {
        self.cues.len()
    }

    /// Append one unit as a SimpleBlock, rotating clusters as needed.
    ///
    /// `UnitTooLarge` and `BlockWrite` leave the file consistent and the
    /// caller may carry on. A partly written block is voided; if even that
    /// fails the error is a fatal `Backpatch`.
    pub fn write_unit(&mut self, unit: &EncodedUnit) -> Result<(), RecError> {
        check_block_size(unit.data.len())?;

        let time = self.timebase.ticks(unit.pts);
        let rotate = match &self.cluster {
            None => true,
            Some(_) if unit.keyframe => true,
            Some(cluster) => relative_time(time, cluster.base).is_none(),
        };
        if rotate {
            self.close_cluster()?;
            self.open_cluster(time)?;
        }

        let Some(cluster) = self.cluster.as_mut() else {
            return Err(RecError::Config("no open cluster".into()));
        };
        let relative = relative_time(time, cluster.base).unwrap_or_default();
        let block_offset = cluster.body_len;

        let mut header = [0u8; BLOCK_HEADER_LEN];
        header[0] = id::SIMPLE_BLOCK as u8;
        header[1..5].copy_from_slice(&ebml::size_4((unit.data.len() + 4) as u32));
        header[5] = 0x80 | TRACK_NUMBER;
        header[6..8].copy_from_slice(&relative.to_be_bytes());
        header[8] = if unit.keyframe { KEYFRAME_FLAG } else { 0 };

        let written = self
            .out
            .write_all(&header)
            .and_then(|_| self.out.write_all(&unit.data));
        if let Err(e) = written {
            let data_start = cluster.data_start();
            let end = discard_partial_block(&mut self.out, data_start + block_offset)?;
            cluster.body_len = end - data_start;
            return Err(RecError::BlockWrite(e));
        }
        cluster.body_len += (BLOCK_HEADER_LEN + unit.data.len()) as u64;
        self.blocks += 1;

        if unit.keyframe {
            self.cues.push(CueEntry {
                time,
                cluster_position: cluster.start - self.segment_data_start,
                relative_position: block_offset,
            });
        }
        Ok(())
    }

    fn open_cluster(&mut self, base: u64) -> Result<(), RecError> {
        let start = self.out.stream_position()?;
        let mut head = BytesMut::with_capacity(4);
        ebml::put_id(&mut head, id::CLUSTER);
        self.out.write_all(&head)?;
        let size = Placeholder::reserve(&mut self.out, PatchField::ClusterSize)?;

        let mut timestamp = BytesMut::with_capacity(CLUSTER_TIMESTAMP_LEN as usize);
        ebml::put_id(&mut timestamp, id::TIMESTAMP);
        timestamp.put_u8(0x88);
        timestamp.put_u64(base);
        self.out.write_all(&timestamp)?;

        self.clusters += 1;
        debug!(cluster = self.clusters, base, offset = start, "cluster opened");
        self.cluster = Some(OpenCluster {
            start,
            size,
            base,
            body_len: CLUSTER_TIMESTAMP_LEN,
        });
        Ok(())
    }

    fn close_cluster(&mut self) -> Result<(), RecError> {
        if let Some(cluster) = self.cluster.take() {
            cluster.size.patch(&mut self.out, cluster.body_len)?;
        }
        Ok(())
    }

    /// Close the last cluster, write the cue index and patch every
    /// remaining size. Returns the writer positioned at the end.
    pub fn finalize(mut self) -> Result<(W, MuxSummary), RecError> {
        self.close_cluster()?;

        let cues_start = self.out.stream_position()?;
        self.cues_position
            .patch(&mut self.out, cues_start - self.segment_data_start)?;

        let mut head = BytesMut::with_capacity(4);
        ebml::put_id(&mut head, id::CUES);
        self.out.write_all(&head)?;
        let cues_size = Placeholder::reserve(&mut self.out, PatchField::CuesSize)?;
        let cues_data_start = self.out.stream_position()?;

        let mut buf = BytesMut::with_capacity(64 * 1024);
        for entry in self.cues.iter() {
            entry.encode(&mut buf);
            if buf.len() >= 60 * 1024 {
                self.out.write_all(&buf)?;
                buf.clear();
            }
        }
        self.out.write_all(&buf)?;

        let end = self.out.stream_position()?;
        cues_size.patch(&mut self.out, end - cues_data_start)?;
        self.segment_size
            .patch(&mut self.out, end - self.segment_data_start)?;
        self.out.flush()?;

        let summary = MuxSummary {
            clusters: self.clusters,
            blocks: self.blocks,
            cues: self.cues.len() as u64,
            bytes: end,
        };
        debug!(?summary, "matroska file finalized");
        Ok((self.out, summary))
    }
}

/// Reject payloads the 4-byte block size cannot describe.
pub fn check_block_size(payload: usize) -> Result<(), RecError> {
    if payload + 4 > MAX_BLOCK_BODY {
        return Err(RecError::UnitTooLarge {
            size: payload,
            max: MAX_BLOCK_BODY - 4,
        });
    }
    Ok(())
}

/// `time - base` if it fits a block's signed 16-bit timestamp.
fn relative_time(time: u64, base: u64) -> Option<i16> {
    let delta = time as i128 - base as i128;
    i16::try_from(delta).ok()
}

// ── Header elements ──────────────────────────────────────────────

fn ebml_header() -> Result<bytes::Bytes, RecError> {
    let mut header = Element::new("EBML", id::EBML);
    header
        .uint(id::EBML_VERSION, 1)
        .uint(id::EBML_READ_VERSION, 1)
        .uint(id::EBML_MAX_ID_LENGTH, 4)
        .uint(id::EBML_MAX_SIZE_LENGTH, 8)
        .string("DocType", id::DOC_TYPE, "matroska")?
        .uint(id::DOC_TYPE_VERSION, 4)
        .uint(id::DOC_TYPE_READ_VERSION, 2);
    header.finish()
}

fn seek_entry(target: u32, position: u64) -> Result<Element, RecError> {
    let mut seek = Element::new("Seek", id::SEEK);
    seek.binary("SeekID", id::SEEK_ID, &target.to_be_bytes())?
        .uint_8(id::SEEK_POSITION, position);
    Ok(seek)
}

fn seek_head(info_pos: u64, tracks_pos: u64) -> Result<bytes::Bytes, RecError> {
    let mut head = Element::new("SeekHead", id::SEEK_HEAD);
    head.master(seek_entry(id::INFO, info_pos)?)?
        .master(seek_entry(id::TRACKS, tracks_pos)?)?
        .master(seek_entry(id::CUES, 0)?)?;
    head.finish()
}

fn info_element(timebase: Timebase) -> Result<bytes::Bytes, RecError> {
    let mut info = Element::new("Info", id::INFO);
    info.uint(id::TIMESTAMP_SCALE, timebase.timestamp_scale_ns)
        .string("MuxingApp", id::MUXING_APP, MUXING_APP)?
        .string("WritingApp", id::WRITING_APP, WRITING_APP)?;
    info.finish()
}

fn tracks_element(track: TrackInfo, sets: &ParameterSets) -> Result<bytes::Bytes, RecError> {
    let codec_private = avc_config(sets)?;

    let mut video = Element::new("Video", id::VIDEO);
    video
        .uint(id::PIXEL_WIDTH, track.width as u64)
        .uint(id::PIXEL_HEIGHT, track.height as u64);

    let mut entry = Element::new("TrackEntry", id::TRACK_ENTRY);
    entry
        .uint(id::TRACK_NUMBER, TRACK_NUMBER as u64)
        .uint(id::TRACK_UID, 1)
        .uint(id::TRACK_TYPE, TRACK_TYPE_VIDEO)
        .uint(id::FLAG_LACING, 0);
    if let Some(duration) = track.default_duration_ns {
        entry.uint(id::DEFAULT_DURATION, duration);
    }
    entry
        .string("CodecID", id::CODEC_ID, CODEC_ID)?
        .binary("CodecPrivate", id::CODEC_PRIVATE, &codec_private)?
        .master(video)?;

    let mut tracks = Element::new("Tracks", id::TRACKS);
    tracks.master(entry)?;
    tracks.finish()
}

// ── Tests ────────────────────────────────────────────────────────
