//! End-to-end tests: detile pool against the single-threaded path, full
//! recordings through the scheduler, and a structural re-parse of the
//! produced Matroska bytes.

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use screenrec_core::mkv::ebml::{id, read_id, read_size};
use screenrec_core::source::paint;
use screenrec_core::{
    CaptureRegion, CaptureScheduler, DetilePool, EncodedUnit, Encoder, EncoderSettings,
    FrameSource, LinearRaster, MatroskaMuxer, ParameterSets, PcmEncoder, PixelFormat, PixelLayout,
    RecError, RecorderConfig, SourceFrame, SyntheticSource, Timebase, TrackInfo, VblankTarget,
    detile,
};

// ── EBML reader ──────────────────────────────────────────────────

const MASTERS: &[u32] = &[
    id::EBML,
    id::SEGMENT,
    id::SEEK_HEAD,
    id::SEEK,
    id::INFO,
    id::TRACKS,
    id::TRACK_ENTRY,
    id::VIDEO,
    id::CLUSTER,
    id::CUES,
    id::CUE_POINT,
    id::CUE_TRACK_POSITIONS,
];

#[derive(Debug)]
struct Node {
    id: u32,
    start: usize,
    data: usize,
    size: usize,
    children: Vec<Node>,
}

impl Node {
    fn child(&self, id: u32) -> &Node {
        self.children
            .iter()
            .find(|n| n.id == id)
            .unwrap_or_else(|| panic!("no child {id:#x} in {:#x}", self.id))
    }

    fn all(&self, id: u32) -> impl Iterator<Item = &Node> {
        self.children.iter().filter(move |n| n.id == id)
    }

    fn bytes<'a>(&self, file: &'a [u8]) -> &'a [u8] {
        &file[self.data..self.data + self.size]
    }

    fn uint(&self, file: &[u8]) -> u64 {
        self.bytes(file).iter().fold(0, |acc, &b| (acc << 8) | b as u64)
    }
}

/// Parse `buf[pos..end]`, asserting that every declared size lines up
/// exactly with its parent's extent.
fn parse(buf: &[u8], mut pos: usize, end: usize) -> Vec<Node> {
    let mut nodes = Vec::new();
    while pos < end {
        let (id, id_len) = read_id(&buf[pos..]).expect("element id");
        let (size, size_len) = read_size(&buf[pos + id_len..]).expect("element size");
        let data = pos + id_len + size_len;
        let size = size as usize;
        assert!(
            data + size <= end,
            "element {id:#x} at {pos} claims {size} bytes, overrunning its parent"
        );

        let children = if MASTERS.contains(&id) {
            parse(buf, data, data + size)
        } else {
            Vec::new()
        };
        nodes.push(Node {
            id,
            start: pos,
            data,
            size,
            children,
        });
        pos = data + size;
    }
    assert_eq!(pos, end, "children do not fill their parent exactly");
    nodes
}

/// Top-level EBML header and Segment.
fn parse_file(file: &[u8]) -> (Node, Node) {
    let mut top = parse(file, 0, file.len()).into_iter();
    let header = top.next().expect("EBML header");
    let segment = top.next().expect("Segment");
    assert_eq!(header.id, id::EBML);
    assert_eq!(segment.id, id::SEGMENT);
    assert!(top.next().is_none(), "nothing may follow the segment");
    (header, segment)
}

/// (track, relative timestamp, flags) of a SimpleBlock.
fn block_header(file: &[u8], block: &Node) -> (u8, i16, u8) {
    let b = block.bytes(file);
    (b[0], i16::from_be_bytes([b[1], b[2]]), b[3])
}

// ── Fixtures ─────────────────────────────────────────────────────

const FRAME_TICKS: Timebase = Timebase {
    frame_duration_ns: 1_000_000,
    timestamp_scale_ns: 1_000_000,
};

fn sets() -> ParameterSets {
    ParameterSets {
        sps: vec![0x67, 66, 0xc0, 52, 0x11],
        pps: vec![0x68, 0xce],
    }
}

fn unit(pts: u64, keyframe: bool) -> EncodedUnit {
    EncodedUnit {
        data: vec![0, 0, 0, 2, 0x65, pts as u8],
        keyframe,
        pts,
    }
}

fn mux(units: &[EncodedUnit]) -> Vec<u8> {
    let track = TrackInfo {
        width: 64,
        height: 16,
        default_duration_ns: Some(1_000_000),
    };
    let mut muxer = MatroskaMuxer::new(Cursor::new(Vec::new()), track, &sets(), FRAME_TICKS).unwrap();
    for u in units {
        muxer.write_unit(u).unwrap();
    }
    let (out, _) = muxer.finalize().unwrap();
    out.into_inner()
}

fn pattern(x: u32, y: u32) -> [u8; 3] {
    [(x * 7) as u8, (y * 13) as u8, (x ^ y) as u8]
}

/// Tiled 64×16 source replaying scripted vblank sequence numbers.
struct Scripted {
    data: Vec<u8>,
    sequences: Vec<u64>,
}

impl Scripted {
    fn new(count: u64) -> Self {
        Self {
            data: paint(PixelLayout::TiledX4Kb, 512, 64, 16, pattern),
            sequences: (1..=count).rev().collect(),
        }
    }
}

impl FrameSource for Scripted {
    fn frame(&self) -> SourceFrame<'_> {
        SourceFrame {
            data: &self.data,
            pitch: 512,
            width: 64,
            height: 16,
            format: PixelFormat::Xrgb8888,
            layout: PixelLayout::TiledX4Kb,
        }
    }

    fn refresh_hz(&self) -> Option<u32> {
        Some(1000)
    }

    fn wait_vblank(&mut self, _target: VblankTarget) -> Result<u64, RecError> {
        self.sequences
            .pop()
            .ok_or_else(|| RecError::Vblank("script exhausted".into()))
    }
}

/// Holds frame 2 back and emits nothing for it.
struct Buffering {
    frames: u64,
    rasters: Arc<Mutex<Vec<LinearRaster>>>,
}

impl Encoder for Buffering {
    fn parameter_sets(&self) -> Result<ParameterSets, RecError> {
        Ok(sets())
    }

    fn encode(&mut self, raster: &LinearRaster, pts: u64) -> Result<Vec<EncodedUnit>, RecError> {
        self.frames += 1;
        self.rasters.lock().unwrap().push(raster.clone());
        Ok(match self.frames {
            2 => Vec::new(),
            n => vec![unit(pts, n == 1)],
        })
    }
}

/// Output that refuses any write beginning with `0xDE`.
struct Rejecting(Cursor<Vec<u8>>);

impl Write for Rejecting {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.first() == Some(&0xDE) {
            return Err(io::Error::other("rejected"));
        }
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for Rejecting {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.seek(pos)
    }
}

// ── Detile ───────────────────────────────────────────────────────

#[test]
fn four_workers_match_one() {
    let data = paint(PixelLayout::TiledX4Kb, 512, 64, 16, pattern);
    let source = SourceFrame {
        data: &data,
        pitch: 512,
        width: 64,
        height: 16,
        format: PixelFormat::Xrgb8888,
        layout: PixelLayout::TiledX4Kb,
    };
    let region = CaptureRegion::full(64, 16);

    let mut four = LinearRaster::new(64, 16);
    DetilePool::new(region, 4).unwrap().run(&source, &mut four).unwrap();
    let mut one = LinearRaster::new(64, 16);
    DetilePool::new(region, 1).unwrap().run(&source, &mut one).unwrap();

    assert_eq!(four.as_bytes(), one.as_bytes());
    assert_eq!(four, detile(&source, region).unwrap());
    assert_eq!(four.pixel(63, 15), pattern(63, 15));
}

// ── Muxer structure ──────────────────────────────────────────────

#[test]
fn keyframe_past_tick_range_opens_second_cluster() {
    let file = mux(&[unit(0, false), unit(40_000, true), unit(40_001, false)]);
    let (_, segment) = parse_file(&file);

    let clusters: Vec<&Node> = segment.all(id::CLUSTER).collect();
    assert_eq!(clusters.len(), 2);
    assert_eq!(clusters[0].child(id::TIMESTAMP).uint(&file), 0);
    assert_eq!(clusters[1].child(id::TIMESTAMP).uint(&file), 40_000);
    assert_eq!(clusters[1].all(id::SIMPLE_BLOCK).count(), 2);

    let cues = segment.child(id::CUES);
    assert_eq!(cues.all(id::CUE_POINT).count(), 1);
}

#[test]
fn one_tick_past_range_rotates() {
    let max = i16::MAX as u64;
    let file = mux(&[unit(0, true), unit(max, false), unit(max + 1, false)]);
    let (_, segment) = parse_file(&file);

    let clusters: Vec<&Node> = segment.all(id::CLUSTER).collect();
    assert_eq!(clusters.len(), 2);

    let first: Vec<_> = clusters[0]
        .all(id::SIMPLE_BLOCK)
        .map(|b| block_header(&file, b))
        .collect();
    assert_eq!(first, vec![(0x81, 0, 0x80), (0x81, i16::MAX, 0)]);

    let second = clusters[1].child(id::SIMPLE_BLOCK);
    assert_eq!(block_header(&file, second), (0x81, 0, 0));
    assert_eq!(clusters[1].child(id::TIMESTAMP).uint(&file), max + 1);
}

#[test]
fn rejected_payload_leaves_a_parseable_cluster() {
    let track = TrackInfo {
        width: 64,
        height: 16,
        default_duration_ns: Some(1_000_000),
    };
    let out = Rejecting(Cursor::new(Vec::new()));
    let mut muxer = MatroskaMuxer::new(out, track, &sets(), FRAME_TICKS).unwrap();

    muxer.write_unit(&unit(0, true)).unwrap();
    let rejected = EncodedUnit {
        data: vec![0xDE, 0xAD, 0, 0, 0, 0],
        keyframe: false,
        pts: 1,
    };
    let err = muxer.write_unit(&rejected).unwrap_err();
    assert!(err.is_recoverable());
    muxer.write_unit(&unit(2, false)).unwrap();
    let (out, summary) = muxer.finalize().unwrap();
    assert_eq!(summary.blocks, 2);

    let file = out.0.into_inner();
    let (_, segment) = parse_file(&file);
    let cluster = segment.child(id::CLUSTER);
    let ids: Vec<u32> = cluster.children.iter().map(|n| n.id).collect();
    assert_eq!(ids, [id::TIMESTAMP, id::SIMPLE_BLOCK, id::VOID, id::SIMPLE_BLOCK]);

    let blocks: Vec<_> = cluster
        .all(id::SIMPLE_BLOCK)
        .map(|b| block_header(&file, b))
        .collect();
    assert_eq!(blocks, vec![(0x81, 0, 0x80), (0x81, 2, 0)]);
    assert_eq!(segment.child(id::CUES).all(id::CUE_POINT).count(), 1);
}

#[test]
fn every_size_and_seek_position_is_exact() {
    let units: Vec<EncodedUnit> = (0..40).map(|pts| unit(pts, pts % 8 == 0)).collect();
    let file = mux(&units);
    let (header, segment) = parse_file(&file);

    assert_eq!(header.child(id::DOC_TYPE).bytes(&file), b"matroska");
    assert_eq!(segment.data + segment.size, file.len());

    let seek_head = segment.child(id::SEEK_HEAD);
    for seek in seek_head.all(id::SEEK) {
        let target = seek.child(id::SEEK_ID).uint(&file) as u32;
        let position = seek.child(id::SEEK_POSITION).uint(&file) as usize;
        let element = segment.child(target);
        assert_eq!(segment.data + position, element.start, "seek to {target:#x}");
    }

    let entry = segment.child(id::TRACKS).child(id::TRACK_ENTRY);
    assert_eq!(entry.child(id::CODEC_ID).bytes(&file), b"V_MPEG4/ISO/AVC");
    assert_eq!(entry.child(id::DEFAULT_DURATION).uint(&file), 1_000_000);
    let video = entry.child(id::VIDEO);
    assert_eq!(video.child(id::PIXEL_WIDTH).uint(&file), 64);
    assert_eq!(video.child(id::PIXEL_HEIGHT).uint(&file), 16);

    let info = segment.child(id::INFO);
    assert_eq!(info.child(id::TIMESTAMP_SCALE).uint(&file), 1_000_000);

    assert_eq!(segment.all(id::CLUSTER).count(), 5);
}

#[test]
fn cues_point_at_their_cluster_and_block() {
    let units: Vec<EncodedUnit> = (0..30).map(|pts| unit(pts * 3, pts % 7 == 0)).collect();
    let file = mux(&units);
    let (_, segment) = parse_file(&file);

    let cue_points: Vec<&Node> = segment.child(id::CUES).all(id::CUE_POINT).collect();
    assert_eq!(cue_points.len(), 5);

    for point in cue_points {
        let time = point.child(id::CUE_TIME).uint(&file);
        let positions = point.child(id::CUE_TRACK_POSITIONS);
        assert_eq!(positions.child(id::CUE_TRACK).uint(&file), 1);
        let cluster_pos = positions.child(id::CUE_CLUSTER_POSITION).uint(&file) as usize;
        let relative = positions.child(id::CUE_RELATIVE_POSITION).uint(&file) as usize;

        let cluster = segment
            .all(id::CLUSTER)
            .find(|c| c.start == segment.data + cluster_pos)
            .expect("cue lands on a cluster start");
        let block = cluster
            .all(id::SIMPLE_BLOCK)
            .find(|b| b.start == cluster.data + relative)
            .expect("cue lands on a block start");

        let (_, rel, flags) = block_header(&file, block);
        let base = cluster.child(id::TIMESTAMP).uint(&file);
        assert_eq!(base + rel as u64, time);
        assert_eq!(flags & 0x80, 0x80);
    }
}

// ── Scheduler ────────────────────────────────────────────────────

#[test]
fn empty_encoder_output_leaves_no_block_and_keeps_timestamps() {
    let rasters: Arc<Mutex<Vec<LinearRaster>>> = Arc::default();
    let config = RecorderConfig {
        workers: 4,
        max_seconds: Some(0.003),
        ..RecorderConfig::default()
    };
    let scheduler = CaptureScheduler::new(
        Scripted::new(3),
        {
            let rasters = Arc::clone(&rasters);
            move |_: EncoderSettings| Ok::<_, RecError>(Buffering { frames: 0, rasters })
        },
        Cursor::new(Vec::new()),
        config,
    )
    .unwrap();
    let (out, summary) = scheduler.run().unwrap();
    assert_eq!(summary.frames, 3);
    assert_eq!(summary.units, 2);

    let file = out.into_inner();
    let (_, segment) = parse_file(&file);
    let blocks: Vec<_> = segment
        .all(id::CLUSTER)
        .flat_map(|c| c.all(id::SIMPLE_BLOCK))
        .map(|b| block_header(&file, b))
        .collect();
    assert_eq!(blocks, vec![(0x81, 0, 0x80), (0x81, 2, 0)]);

    let expected = detile(&Scripted::new(0).frame(), CaptureRegion::full(64, 16)).unwrap();
    for raster in rasters.lock().unwrap().iter() {
        assert_eq!(raster, &expected);
    }
}

#[test]
fn records_playable_file_to_disk() {
    let source = SyntheticSource::new(64, 32, 1000).unwrap();
    let config = RecorderConfig {
        workers: 2,
        keyframe_interval: 4,
        max_seconds: Some(0.01),
        ..RecorderConfig::default()
    };
    let file = tempfile::tempfile().unwrap();

    let scheduler = CaptureScheduler::new(source, PcmEncoder::new, file, config).unwrap();
    let (mut file, summary) = scheduler.run().unwrap();
    assert_eq!(summary.frames, 10);
    assert_eq!(summary.units, 10);
    assert_eq!(summary.cues, 3);

    let mut bytes = Vec::new();
    file.seek(SeekFrom::Start(0)).unwrap();
    file.read_to_end(&mut bytes).unwrap();
    assert_eq!(bytes.len() as u64, summary.bytes);

    let (_, segment) = parse_file(&bytes);
    let codec_private = segment
        .child(id::TRACKS)
        .child(id::TRACK_ENTRY)
        .child(id::CODEC_PRIVATE)
        .bytes(&bytes);
    assert_eq!(&codec_private[..4], &[1, 66, 0xc0, 52]);

    let blocks = segment
        .all(id::CLUSTER)
        .flat_map(|c| c.all(id::SIMPLE_BLOCK))
        .count();
    assert_eq!(blocks, 10);
}
