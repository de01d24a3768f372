//! The real-time capture loop.
//!
//! One orchestrator thread drives every frame through the same fixed
//! sequence of phases:
//!
//! ```text
//!   ┌──────────────┐    ┌────────┐    ┌────────┐    ┌─────┐    ┌────────────┐
//!   │ WaitVblank   │───▶│ Detile │───▶│ Encode │───▶│ Mux │───▶│ CheckStop  │
//!   └──────────────┘    └────────┘    └────────┘    └─────┘    └────────────┘
//!          ▲                                                     │      │
//!          └─────────────────────────────────────────────────────┘      ▼
//!                                                                   Finalize
//! ```
//!
//! Nothing is pipelined across frames: encode and mux of frame K finish
//! before the wait for frame K+1 starts. Presentation timestamps count
//! vblanks actually elapsed, so dropped frames leave gaps instead of
//! compressing time.

use std::io::{Seek, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info, trace, warn};

use crate::detile::DetilePool;
use crate::encoder::{ColorFormat, EncodedUnit, Encoder, EncoderSettings, Preset};
use crate::error::RecError;
use crate::mkv::{MatroskaMuxer, Timebase, TrackInfo};
use crate::types::{CaptureRegion, Geometry, LinearRaster};
use crate::vblank::{FrameSource, VblankClock};

// ── Configuration ────────────────────────────────────────────────

/// Everything the scheduler needs to set up a session.
#[derive(Debug, Clone, PartialEq)]
pub struct RecorderConfig {
    /// Capture rectangle; the default covers the whole framebuffer.
    pub geometry: Geometry,
    /// Capture every `interval` vblanks.
    pub interval: u32,
    /// Detile threads; 0 means one per online CPU.
    pub workers: usize,
    pub preset: Preset,
    /// Frames between forced keyframes.
    pub keyframe_interval: u32,
    /// Stop on its own after this many seconds.
    pub max_seconds: Option<f64>,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            geometry: Geometry::default(),
            interval: 1,
            workers: 0,
            preset: Preset::default(),
            keyframe_interval: 60,
            max_seconds: None,
        }
    }
}

/// Frame limit for `max_seconds`, rounded half up.
pub fn max_frames(max_seconds: f64, refresh_hz: u32, interval: u32) -> u64 {
    let frames = max_seconds * refresh_hz as f64 / interval.max(1) as f64;
    (frames + 0.5).floor() as u64
}

// ── Summary ──────────────────────────────────────────────────────

/// What one recording session produced.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecordingSummary {
    /// Frames captured and encoded.
    pub frames: u64,
    /// Frames lost because the loop fell behind the display.
    pub dropped: u64,
    /// Units written as blocks.
    pub units: u64,
    /// Units skipped after a recoverable mux error.
    pub skipped_units: u64,
    pub clusters: u64,
    pub cues: u64,
    /// Final file size.
    pub bytes: u64,
}

// ── Scheduler ────────────────────────────────────────────────────

#[derive(Debug)]
enum Phase {
    WaitVblank,
    Detile,
    Encode,
    Mux(Vec<EncodedUnit>),
    CheckStop,
    Finalize,
}

/// Owns a capture session from the first vblank to the finalized file.
pub struct CaptureScheduler<S, E, W>
where
    S: FrameSource,
    E: Encoder,
    W: Write + Seek,
{
    source: S,
    encoder: E,
    muxer: MatroskaMuxer<W>,
    pool: DetilePool,
    raster: LinearRaster,
    clock: VblankClock,
    max_frames: Option<u64>,
    stop: Arc<AtomicBool>,
}

impl<S, E, W> CaptureScheduler<S, E, W>
where
    S: FrameSource,
    E: Encoder,
    W: Write + Seek,
{
    /// Validate the source, configure the encoder through `make_encoder`,
    /// start the detile pool and write the container header.
    pub fn new<F>(source: S, make_encoder: F, output: W, config: RecorderConfig) -> Result<Self, RecError>
    where
        F: FnOnce(EncoderSettings) -> Result<E, RecError>,
    {
        let clock = VblankClock::new(config.interval)?;

        let frame = source.frame();
        let region: CaptureRegion = config.geometry.resolve(frame.width, frame.height)?;
        frame.check_region(region)?;

        let refresh_hz = source.refresh_hz();
        let timebase = Timebase::from_refresh(refresh_hz);
        let hz = refresh_hz
            .filter(|&hz| hz > 0)
            .unwrap_or(Timebase::FALLBACK_REFRESH_HZ);
        let max_frames = match config.max_seconds {
            Some(secs) if !(secs > 0.0) => {
                return Err(RecError::Config(format!(
                    "recording limit must be positive, got {secs}"
                )));
            }
            Some(secs) => Some(max_frames(secs, hz, config.interval)),
            None => None,
        };

        let encoder = make_encoder(EncoderSettings {
            width: region.width,
            height: region.height,
            color: ColorFormat::Rgb24,
            preset: config.preset,
            keyframe_interval: config.keyframe_interval.max(1),
            refresh_hz: hz,
            interval: config.interval,
        })?;
        let sets = encoder.parameter_sets()?;

        let track = TrackInfo {
            width: region.width,
            height: region.height,
            default_duration_ns: Some(timebase.frame_duration_ns * config.interval as u64),
        };
        let muxer = MatroskaMuxer::new(output, track, &sets, timebase)?;

        let pool = match config.workers {
            0 => DetilePool::with_default_workers(region)?,
            n => DetilePool::new(region, n)?,
        };

        info!(
            x = region.x,
            y = region.y,
            width = region.width,
            height = region.height,
            interval = config.interval,
            workers = pool.workers(),
            refresh_hz = ?refresh_hz,
            max_frames = ?max_frames,
            "capture session ready"
        );

        Ok(Self {
            source,
            encoder,
            muxer,
            pool,
            raster: LinearRaster::new(region.width, region.height),
            clock,
            max_frames,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Use an externally owned stop flag.
    pub fn with_stop(mut self, stop: Arc<AtomicBool>) -> Self {
        self.stop = stop;
        self
    }

    /// Flag that ends the session at the next frame boundary.
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn region(&self) -> CaptureRegion {
        self.pool.region()
    }

    /// Record until stopped, then finalize the file.
    ///
    /// Returns the output writer together with the session summary.
    pub fn run(mut self) -> Result<(W, RecordingSummary), RecError> {
        let mut summary = RecordingSummary::default();
        let mut pts = 0u64;
        let mut phase = Phase::WaitVblank;

        loop {
            phase = match phase {
                Phase::WaitVblank => {
                    let sequence = self.source.wait_vblank(self.clock.target())?;
                    let tick = self.clock.observe(sequence);

                    if tick.dropped > 0 {
                        summary.dropped += tick.dropped;
                        warn!(
                            sequence,
                            dropped = tick.dropped,
                            "capture fell behind the display, frames dropped"
                        );
                    }

                    if tick.first {
                        Phase::Detile
                    } else if tick.elapsed == 0 {
                        warn!(sequence, "vblank counter did not advance, frame skipped");
                        Phase::CheckStop
                    } else {
                        pts += tick.elapsed;
                        Phase::Detile
                    }
                }
                Phase::Detile => {
                    self.pool.run(&self.source.frame(), &mut self.raster)?;
                    Phase::Encode
                }
                Phase::Encode => {
                    let units = self.encoder.encode(&self.raster, pts)?;
                    summary.frames += 1;
                    trace!(frame = summary.frames, pts, units = units.len(), "frame encoded");
                    Phase::Mux(units)
                }
                Phase::Mux(units) => {
                    self.mux(&units, &mut summary)?;
                    Phase::CheckStop
                }
                Phase::CheckStop => {
                    let limit_reached = self.max_frames.is_some_and(|max| summary.frames >= max);
                    if self.stop.load(Ordering::Relaxed) || limit_reached {
                        Phase::Finalize
                    } else {
                        Phase::WaitVblank
                    }
                }
                Phase::Finalize => break,
            };
        }

        debug!(frames = summary.frames, "stopping capture, draining encoder");
        let tail = self.encoder.flush()?;
        self.mux(&tail, &mut summary)?;

        let (output, mux) = self.muxer.finalize()?;
        summary.clusters = mux.clusters;
        summary.cues = mux.cues;
        summary.bytes = mux.bytes;

        info!(
            frames = summary.frames,
            dropped = summary.dropped,
            units = summary.units,
            skipped = summary.skipped_units,
            bytes = summary.bytes,
            "recording finished"
        );
        Ok((output, summary))
    }

    /// Hand units to the muxer, absorbing per-unit failures.
    fn mux(&mut self, units: &[EncodedUnit], summary: &mut RecordingSummary) -> Result<(), RecError> {
        for unit in units {
            match self.muxer.write_unit(unit) {
                Ok(()) => summary.units += 1,
                Err(e) if e.is_recoverable() => {
                    summary.skipped_units += 1;
                    warn!(pts = unit.pts, bytes = unit.data.len(), error = %e, "unit skipped");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::ParameterSets;
    use crate::source::paint;
    use crate::types::{PixelFormat, PixelLayout, SourceFrame};
    use crate::vblank::VblankTarget;
    use std::collections::VecDeque;
    use std::io::{self, Cursor, SeekFrom};
    use std::sync::Mutex;

    /// Linear source replaying a fixed list of vblank sequence numbers.
    struct Scripted {
        data: Vec<u8>,
        sequences: VecDeque<u64>,
        targets: Arc<Mutex<Vec<VblankTarget>>>,
        stop_after: Option<(usize, Arc<AtomicBool>)>,
        waits: usize,
    }

    impl Scripted {
        fn new(sequences: &[u64]) -> Self {
            Self {
                data: paint(PixelLayout::Linear, 64, 16, 4, |x, y| [x as u8, y as u8, 7]),
                sequences: sequences.iter().copied().collect(),
                targets: Arc::default(),
                stop_after: None,
                waits: 0,
            }
        }
    }

    impl FrameSource for Scripted {
        fn frame(&self) -> SourceFrame<'_> {
            SourceFrame {
                data: &self.data,
                pitch: 64,
                width: 16,
                height: 4,
                format: PixelFormat::Xrgb8888,
                layout: PixelLayout::Linear,
            }
        }

        fn refresh_hz(&self) -> Option<u32> {
            Some(1000)
        }

        fn wait_vblank(&mut self, target: VblankTarget) -> Result<u64, RecError> {
            self.targets.lock().unwrap().push(target);
            self.waits += 1;
            if let Some((after, flag)) = &self.stop_after {
                if self.waits >= *after {
                    flag.store(true, Ordering::Relaxed);
                }
            }
            self.sequences
                .pop_front()
                .ok_or_else(|| RecError::Vblank("display gone".into()))
        }
    }

    /// Encoder that records the pts it sees and emits one unit each.
    struct Counting {
        seen: Arc<Mutex<Vec<u64>>>,
        payload: Vec<u8>,
    }

    impl Encoder for Counting {
        fn parameter_sets(&self) -> Result<ParameterSets, RecError> {
            Ok(ParameterSets {
                sps: vec![0x67, 66, 0xc0, 52],
                pps: vec![0x68, 0xce],
            })
        }

        fn encode(&mut self, _raster: &LinearRaster, pts: u64) -> Result<Vec<EncodedUnit>, RecError> {
            let mut seen = self.seen.lock().unwrap();
            let keyframe = seen.is_empty();
            seen.push(pts);
            Ok(vec![EncodedUnit {
                data: self.payload.clone(),
                keyframe,
                pts,
            }])
        }
    }

    fn config(max_seconds: Option<f64>) -> RecorderConfig {
        RecorderConfig {
            workers: 2,
            max_seconds,
            ..RecorderConfig::default()
        }
    }

    fn counting(seen: &Arc<Mutex<Vec<u64>>>) -> impl FnOnce(EncoderSettings) -> Result<Counting, RecError> {
        let seen = Arc::clone(seen);
        move |settings| {
            assert_eq!((settings.width, settings.height), (16, 4));
            Ok(Counting {
                seen,
                payload: vec![0, 0, 0, 1, 0x65],
            })
        }
    }

    #[test]
    fn pts_tracks_elapsed_vblanks() {
        let seen = Arc::default();
        let source = Scripted::new(&[100, 101, 104, 104, 105]);
        let targets = Arc::clone(&source.targets);

        let scheduler =
            CaptureScheduler::new(source, counting(&seen), Cursor::new(Vec::new()), config(Some(0.004)))
                .unwrap();
        let (_, summary) = scheduler.run().unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 4, 5]);
        assert_eq!(summary.frames, 4);
        assert_eq!(summary.dropped, 2);
        assert_eq!(summary.units, 4);
        assert_eq!(summary.clusters, 1);
        assert_eq!(summary.cues, 1);

        let targets = targets.lock().unwrap();
        assert_eq!(targets[0], VblankTarget::Relative(1));
        assert_eq!(targets[1], VblankTarget::Absolute(101));
        assert_eq!(targets[2], VblankTarget::Absolute(102));
    }

    #[test]
    fn stop_flag_ends_session_after_current_frame() {
        let seen = Arc::default();
        let stop = Arc::new(AtomicBool::new(false));
        let mut source = Scripted::new(&[1, 2, 3, 4, 5, 6]);
        source.stop_after = Some((3, Arc::clone(&stop)));

        let scheduler =
            CaptureScheduler::new(source, counting(&seen), Cursor::new(Vec::new()), config(None))
                .unwrap()
                .with_stop(stop);
        let (out, summary) = scheduler.run().unwrap();

        assert_eq!(summary.frames, 3);
        assert_eq!(summary.bytes, out.into_inner().len() as u64);
    }

    #[test]
    fn vblank_failure_is_fatal() {
        let seen = Arc::default();
        let source = Scripted::new(&[1, 2]);
        let scheduler =
            CaptureScheduler::new(source, counting(&seen), Cursor::new(Vec::new()), config(None))
                .unwrap();
        assert!(matches!(scheduler.run(), Err(RecError::Vblank(_))));
    }

    #[test]
    fn rejects_geometry_outside_framebuffer() {
        let seen = Arc::default();
        let config = RecorderConfig {
            geometry: "10,0,8x4".parse().unwrap(),
            ..config(None)
        };
        let result = CaptureScheduler::new(
            Scripted::new(&[]),
            counting(&seen),
            Cursor::new(Vec::new()),
            config,
        );
        assert!(matches!(result, Err(RecError::Geometry(_))));
    }

    #[test]
    fn rejects_non_positive_limit() {
        let seen = Arc::default();
        let result = CaptureScheduler::new(
            Scripted::new(&[]),
            counting(&seen),
            Cursor::new(Vec::new()),
            config(Some(0.0)),
        );
        assert!(matches!(result, Err(RecError::Config(_))));
    }

    #[test]
    fn frame_limit_rounds_half_up() {
        assert_eq!(max_frames(1.0, 60, 1), 60);
        assert_eq!(max_frames(1.0, 60, 7), 9);
        assert_eq!(max_frames(0.25, 30, 1), 8);
    }

    /// Cursor that refuses to write a payload starting with `0xDE`.
    struct Picky(Cursor<Vec<u8>>);

    impl Write for Picky {
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

    impl Seek for Picky {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.0.seek(pos)
        }
    }

    /// Emits a rejected payload on the second frame only.
    struct SecondFails {
        frame: u64,
    }

    impl Encoder for SecondFails {
        fn parameter_sets(&self) -> Result<ParameterSets, RecError> {
            Ok(ParameterSets {
                sps: vec![0x67, 66, 0xc0, 52],
                pps: vec![0x68],
            })
        }

        fn encode(&mut self, _raster: &LinearRaster, pts: u64) -> Result<Vec<EncodedUnit>, RecError> {
            self.frame += 1;
            let data = if self.frame == 2 { vec![0xDE, 0xAD] } else { vec![0x00, 0x01] };
            Ok(vec![EncodedUnit {
                data,
                keyframe: self.frame == 1,
                pts,
            }])
        }
    }

    #[test]
    fn failed_block_write_skips_unit_and_continues() {
        let scheduler = CaptureScheduler::new(
            Scripted::new(&[1, 2, 3]),
            |_| Ok(SecondFails { frame: 0 }),
            Picky(Cursor::new(Vec::new())),
            config(Some(0.003)),
        )
        .unwrap();
        let (out, summary) = scheduler.run().unwrap();

        assert_eq!(summary.frames, 3);
        assert_eq!(summary.units, 2);
        assert_eq!(summary.skipped_units, 1);

        // The rejected block's header was voided in place.
        let file = out.0.into_inner();
        assert_eq!(file.len() as u64, summary.bytes);
        let void = [0xEC, 0x01, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(file.windows(9).filter(|w| *w == void).count(), 1);
    }
}
