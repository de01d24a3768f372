//! Vertical-blank pacing.
//!
//! The display's vblank counter is the capture clock. A [`FrameSource`]
//! exposes the mapped framebuffer and a blocking wait on that counter;
//! [`VblankClock`] turns the raw sequence numbers it reports into frame
//! ticks, detecting dropped frames along the way.

use crate::error::RecError;
use crate::types::SourceFrame;

// ── FrameSource ──────────────────────────────────────────────────

/// How far [`FrameSource::wait_vblank`] should wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VblankTarget {
    /// Wake after this many vblanks from now.
    Relative(u32),
    /// Wake once the vblank counter reaches this sequence number.
    /// Returns immediately if it already has.
    Absolute(u64),
}

/// A display framebuffer that can be read once per vertical blank.
///
/// Implementations own the mapping; the pipeline only borrows the bytes
/// between two waits. Both operations fail fatally if the underlying
/// capture handle becomes invalid.
pub trait FrameSource {
    /// Borrow the mapped framebuffer.
    fn frame(&self) -> SourceFrame<'_>;

    /// Native refresh rate in Hz, if the display reports one.
    fn refresh_hz(&self) -> Option<u32>;

    /// Block until `target` and return the current vblank sequence number.
    fn wait_vblank(&mut self, target: VblankTarget) -> Result<u64, RecError>;
}

// ── VblankClock ──────────────────────────────────────────────────

/// Outcome of one vblank wake-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tick {
    /// Vblank sequence number reported by the source.
    pub sequence: u64,
    /// Vblanks since the previous wake-up (0 on the first one).
    pub elapsed: u64,
    /// Frames lost because the loop could not keep up.
    pub dropped: u64,
    /// Whether this is the wake-up that seeded the clock.
    pub first: bool,
}

/// Tracks vblank sequence numbers across wake-ups.
///
/// The first wait is relative (next vblank). Once a reply has seeded the
/// baseline every later wait targets an absolute sequence number, so a
/// slow iteration does not push the whole schedule back.
#[derive(Debug, Clone)]
pub struct VblankClock {
    interval: u32,
    last: Option<u64>,
}

impl VblankClock {
    /// Wake every `interval` vblanks (must be at least 1).
    pub fn new(interval: u32) -> Result<Self, RecError> {
        if interval == 0 {
            return Err(RecError::Config("vblank interval must be at least 1".into()));
        }
        Ok(Self {
            interval,
            last: None,
        })
    }

    pub fn interval(&self) -> u32 {
        self.interval
    }

    /// Target for the next wait.
    pub fn target(&self) -> VblankTarget {
        match self.last {
            None => VblankTarget::Relative(1),
            Some(last) => VblankTarget::Absolute(last + self.interval as u64),
        }
    }

    /// Record the sequence number returned by a wait.
    pub fn observe(&mut self, sequence: u64) -> Tick {
        let tick = match self.last {
            None => Tick {
                sequence,
                elapsed: 0,
                dropped: 0,
                first: true,
            },
            Some(last) => {
                let elapsed = sequence.saturating_sub(last);
                Tick {
                    sequence,
                    elapsed,
                    dropped: elapsed.saturating_sub(self.interval as u64),
                    first: false,
                }
            }
        };
        self.last = Some(sequence.max(self.last.unwrap_or(0)));
        tick
    }
}

// ── Tests ────────────────────────────────────────────────────────
