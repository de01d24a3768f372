//! EBML primitives: element ids, size encodings and a compact builder.
//!
//! Header elements are small and written once, so they are assembled in
//! memory with [`Element`] and always carry a single-byte size
//! (`0x80 | len`, at most [`MAX_COMPACT_SIZE`]). Anything that grows while
//! recording (segment, clusters, cues) instead reserves an 8-byte size
//! that the muxer backpatches.
//!
//! ## Size encodings used
//!
//! | Width | Marker | Used for                         |
//! |-------|--------|----------------------------------|
//! | 1     | `1xxxxxxx` | header elements             |
//! | 4     | `0001xxxx` | SimpleBlock                 |
//! | 8     | `00000001` | Segment, Cluster, Cues      |

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::RecError;

// ── Element ids ──────────────────────────────────────────────────

pub mod id {
    pub const EBML: u32 = 0x1A45_DFA3;
    pub const EBML_VERSION: u32 = 0x4286;
    pub const EBML_READ_VERSION: u32 = 0x42F7;
    pub const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
    pub const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const DOC_TYPE_VERSION: u32 = 0x4287;
    pub const DOC_TYPE_READ_VERSION: u32 = 0x4285;

    pub const SEGMENT: u32 = 0x1853_8067;

    pub const SEEK_HEAD: u32 = 0x114D_9B74;
    pub const SEEK: u32 = 0x4DBB;
    pub const SEEK_ID: u32 = 0x53AB;
    pub const SEEK_POSITION: u32 = 0x53AC;

    pub const INFO: u32 = 0x1549_A966;
    pub const TIMESTAMP_SCALE: u32 = 0x2AD7B1;
    pub const MUXING_APP: u32 = 0x4D80;
    pub const WRITING_APP: u32 = 0x5741;

    pub const TRACKS: u32 = 0x1654_AE6B;
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const TRACK_UID: u32 = 0x73C5;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const FLAG_LACING: u32 = 0x9C;
    pub const DEFAULT_DURATION: u32 = 0x23E383;
    pub const CODEC_ID: u32 = 0x86;
    pub const CODEC_PRIVATE: u32 = 0x63A2;
    pub const VIDEO: u32 = 0xE0;
    pub const PIXEL_WIDTH: u32 = 0xB0;
    pub const PIXEL_HEIGHT: u32 = 0xBA;

    pub const VOID: u32 = 0xEC;

    pub const CLUSTER: u32 = 0x1F43_B675;
    pub const TIMESTAMP: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;

    pub const CUES: u32 = 0x1C53_BB6B;
    pub const CUE_POINT: u32 = 0xBB;
    pub const CUE_TIME: u32 = 0xB3;
    pub const CUE_TRACK_POSITIONS: u32 = 0xB7;
    pub const CUE_TRACK: u32 = 0xF7;
    pub const CUE_CLUSTER_POSITION: u32 = 0xF1;
    pub const CUE_RELATIVE_POSITION: u32 = 0xF0;
}

// ── Size encodings ───────────────────────────────────────────────

/// Largest body a single-byte size can describe (127 is reserved).
pub const MAX_COMPACT_SIZE: usize = 126;

/// 8-byte "unknown size", written into every placeholder.
pub const UNKNOWN_SIZE_8: u64 = 0x01FF_FFFF_FFFF_FFFF;

/// Largest value an 8-byte size can carry.
pub const MAX_SIZE_8: u64 = UNKNOWN_SIZE_8 - (1 << 56) - 1;

/// Largest SimpleBlock body a 4-byte size can carry.
pub const MAX_BLOCK_BODY: usize = 0x0FFF_FFFE;

/// Number of bytes the element id occupies; ids keep their marker bits.
pub fn id_len(id: u32) -> usize {
    (4 - id.leading_zeros() as usize / 8).max(1)
}

pub fn put_id(buf: &mut BytesMut, id: u32) {
    let len = id_len(id);
    buf.put_slice(&id.to_be_bytes()[4 - len..]);
}

/// 8-byte size field for `size`.
pub fn size_8(size: u64) -> [u8; 8] {
    debug_assert!(size <= MAX_SIZE_8);
    ((1 << 56) | size).to_be_bytes()
}

/// 4-byte size field for a SimpleBlock body.
pub fn size_4(size: u32) -> [u8; 4] {
    debug_assert!(size as usize <= MAX_BLOCK_BODY);
    (0x1000_0000 | size).to_be_bytes()
}

/// Shortest big-endian encoding of `value`, at least one byte.
fn uint_bytes(value: u64) -> ([u8; 8], usize) {
    let len = (8 - value.leading_zeros() as usize / 8).max(1);
    (value.to_be_bytes(), len)
}

// ── Element builder ──────────────────────────────────────────────

/// In-memory master element with single-byte sized children.
#[derive(Debug)]
pub struct Element {
    name: &'static str,
    id: u32,
    body: BytesMut,
}

impl Element {
    pub fn new(name: &'static str, id: u32) -> Self {
        Self {
            name,
            id,
            body: BytesMut::with_capacity(MAX_COMPACT_SIZE),
        }
    }

    fn put_child(&mut self, id: u32, data: &[u8]) {
        put_id(&mut self.body, id);
        self.body.put_u8(0x80 | data.len() as u8);
        self.body.put_slice(data);
    }

    /// Unsigned integer in its shortest form.
    pub fn uint(&mut self, id: u32, value: u64) -> &mut Self {
        let (bytes, len) = uint_bytes(value);
        self.put_child(id, &bytes[8 - len..]);
        self
    }

    /// Unsigned integer padded to 8 bytes, for values patched later.
    pub fn uint_8(&mut self, id: u32, value: u64) -> &mut Self {
        self.put_child(id, &value.to_be_bytes());
        self
    }

    pub fn binary(&mut self, name: &'static str, id: u32, data: &[u8]) -> Result<&mut Self, RecError> {
        check_compact(name, data.len())?;
        self.put_child(id, data);
        Ok(self)
    }

    pub fn string(&mut self, name: &'static str, id: u32, value: &str) -> Result<&mut Self, RecError> {
        self.binary(name, id, value.as_bytes())
    }

    /// Append a finished child master element.
    pub fn master(&mut self, child: Element) -> Result<&mut Self, RecError> {
        let encoded = child.finish()?;
        self.body.put_slice(&encoded);
        Ok(self)
    }

    /// Encode id, size and body.
    pub fn finish(self) -> Result<Bytes, RecError> {
        check_compact(self.name, self.body.len())?;
        let mut out = BytesMut::with_capacity(id_len(self.id) + 1 + self.body.len());
        put_id(&mut out, self.id);
        out.put_u8(0x80 | self.body.len() as u8);
        out.put_slice(&self.body);
        Ok(out.freeze())
    }
}

fn check_compact(element: &'static str, size: usize) -> Result<(), RecError> {
    if size > MAX_COMPACT_SIZE {
        return Err(RecError::HeaderTooLarge {
            element,
            size,
            max: MAX_COMPACT_SIZE,
        });
    }
    Ok(())
}

// ── Reading ──────────────────────────────────────────────────────

/// Decode an element id at the start of `buf`, returning it with its length.
pub fn read_id(buf: &[u8]) -> Option<(u32, usize)> {
    let first = *buf.first()?;
    let len = first.leading_zeros() as usize + 1;
    if len > 4 || buf.len() < len {
        return None;
    }
    let id = buf[..len].iter().fold(0u32, |acc, &b| (acc << 8) | b as u32);
    Some((id, len))
}

/// Decode a size field, returning the value (marker stripped) and its length.
/// An all-ones value means "unknown".
pub fn read_size(buf: &[u8]) -> Option<(u64, usize)> {
    let first = *buf.first()?;
    let len = first.leading_zeros() as usize + 1;
    if len > 8 || buf.len() < len {
        return None;
    }
    let mask = if len == 8 { 0 } else { 0xFFu8 >> len };
    let value = buf[1..len]
        .iter()
        .fold((first & mask) as u64, |acc, &b| (acc << 8) | b as u64);
    Some((value, len))
}

// ── Tests ────────────────────────────────────────────────────────
