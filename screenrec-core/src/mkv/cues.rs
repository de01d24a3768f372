//! Cue index storage.
//!
//! Keyframe positions are collected in fixed-capacity chunks that are
//! never reallocated once full, so an entry never moves after it is
//! recorded. The chunks are walked in allocation order at finalization.

use bytes::{BufMut, BytesMut};

use super::ebml::{id, put_id};

/// Entries per chunk.
pub const CUE_CHUNK_CAPACITY: usize = 2048;

/// Encoded size of one CuePoint, id and size included.
pub const CUE_POINT_LEN: usize = 37;

const TRACK_POSITIONS_BODY: u8 = 23;
const CUE_POINT_BODY: u8 = 35;

/// One seek point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CueEntry {
    /// Absolute timestamp in ticks.
    pub time: u64,
    /// Cluster offset from the start of the segment's data.
    pub cluster_position: u64,
    /// Block offset from the start of the cluster's data.
    pub relative_position: u64,
}

impl CueEntry {
    /// Append this entry as a CuePoint for track 1.
    pub fn encode(&self, buf: &mut BytesMut) {
        put_id(buf, id::CUE_POINT);
        buf.put_u8(0x80 | CUE_POINT_BODY);

        put_id(buf, id::CUE_TIME);
        buf.put_u8(0x88);
        buf.put_u64(self.time);

        put_id(buf, id::CUE_TRACK_POSITIONS);
        buf.put_u8(0x80 | TRACK_POSITIONS_BODY);
        put_id(buf, id::CUE_TRACK);
        buf.put_slice(&[0x81, 0x01]);
        put_id(buf, id::CUE_CLUSTER_POSITION);
        buf.put_u8(0x88);
        buf.put_u64(self.cluster_position);
        put_id(buf, id::CUE_RELATIVE_POSITION);
        buf.put_u8(0x88);
        buf.put_u64(self.relative_position);
    }
}

/// Append-only chunked list of cue entries.
#[derive(Debug, Default)]
pub struct CueList {
    chunks: Vec<Vec<CueEntry>>,
    len: usize,
}

impl CueList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: CueEntry) {
        match self.chunks.last_mut() {
            Some(chunk) if chunk.len() < CUE_CHUNK_CAPACITY => chunk.push(entry),
            _ => {
                let mut chunk = Vec::with_capacity(CUE_CHUNK_CAPACITY);
                chunk.push(entry);
                self.chunks.push(chunk);
            }
        }
        self.len += 1;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Entries in the order they were recorded.
    pub fn iter(&self) -> impl Iterator<Item = &CueEntry> {
        self.chunks.iter().flatten()
    }
}
