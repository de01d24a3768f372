//! Persistent detile worker pool.
//!
//! Converting a full-screen tiled frame on one core is too slow at display
//! rate, so the capture region is cut into horizontal bands and each band
//! is owned by one long-lived worker thread. Per frame the orchestrator
//! runs a two-phase barrier:
//!
//! 1. send every worker its own start signal (one single-slot channel per
//!    worker, so a slow worker never delays the others' start),
//! 2. each worker converts its band straight into its slice of the
//!    [`LinearRaster`] and reports on the shared completion channel,
//! 3. the orchestrator collects exactly one report per worker before it
//!    returns and lets anyone read the raster.
//!
//! Bands never overlap, so the raster itself needs no lock.

use std::ops::Range;
use std::panic::{self, AssertUnwindSafe};
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, bounded, unbounded};
use tracing::{debug, error};

use crate::error::RecError;
use crate::tiling::convert_rows;
use crate::types::{CaptureRegion, LinearRaster, PixelFormat, PixelLayout, SourceFrame};

// ── Partitioning ─────────────────────────────────────────────────

/// Split `height` rows into `workers` contiguous bands of
/// `ceil(height / workers)` rows. Trailing bands may be shorter or empty.
pub fn partition_rows(height: u32, workers: usize) -> Vec<Range<u32>> {
    let workers = workers.max(1) as u32;
    let band = height.div_ceil(workers);

    (0..workers)
        .map(|i| {
            let start = i.saturating_mul(band).min(height);
            let end = (i + 1).saturating_mul(band).min(height);
            start..end
        })
        .collect()
}

// ── FrameJob ─────────────────────────────────────────────────────

/// Borrowed frame data smuggled to a worker for the span of one barrier.
#[derive(Clone, Copy)]
struct FrameJob {
    src: *const u8,
    src_len: usize,
    pitch: u32,
    width: u32,
    height: u32,
    format: PixelFormat,
    layout: PixelLayout,
    dst: *mut u8,
    dst_len: usize,
}

// SAFETY: a job only travels from `DetilePool::run` to a worker, and `run`
// does not return (releasing the borrows the pointers came from) until that
// worker has reported back on the completion channel.
unsafe impl Send for FrameJob {}

impl FrameJob {
    /// # Safety
    ///
    /// The pointers must still be backed by the borrows taken in
    /// `DetilePool::run`, and no other thread may access the destination.
    unsafe fn parts<'a>(&self) -> (SourceFrame<'a>, &'a mut [u8]) {
        let (data, out) = unsafe {
            (
                std::slice::from_raw_parts(self.src, self.src_len),
                std::slice::from_raw_parts_mut(self.dst, self.dst_len),
            )
        };
        let source = SourceFrame {
            data,
            pitch: self.pitch,
            width: self.width,
            height: self.height,
            format: self.format,
            layout: self.layout,
        };
        (source, out)
    }
}

/// A worker's answer to one start signal.
struct BandReport {
    worker: usize,
    ok: bool,
}

// ── DetilePool ───────────────────────────────────────────────────

struct Worker {
    start: Option<Sender<FrameJob>>,
    handle: Option<JoinHandle<()>>,
}

/// Fixed set of detile threads, created once per recording session.
///
/// # Lifetime
///
/// Workers live as long as the pool. Dropping the pool closes every
/// start channel and joins the threads; a worker always finishes the band
/// it is on before it notices.
pub struct DetilePool {
    region: CaptureRegion,
    bands: Vec<Range<u32>>,
    workers: Vec<Worker>,
    finished: Receiver<BandReport>,
}

impl DetilePool {
    /// Spawn `workers` threads converting `region`.
    pub fn new(region: CaptureRegion, workers: usize) -> Result<Self, RecError> {
        if workers == 0 {
            return Err(RecError::Config("detile pool needs at least one worker".into()));
        }

        let bands = partition_rows(region.height, workers);
        let (done_tx, finished) = unbounded();
        let mut pool = Vec::with_capacity(workers);

        for (index, band) in bands.iter().cloned().enumerate() {
            let (start_tx, start_rx) = bounded(1);
            let done = done_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("detile-{index}"))
                .spawn(move || worker_loop(index, region, band, start_rx, done))?;

            pool.push(Worker {
                start: Some(start_tx),
                handle: Some(handle),
            });
        }

        debug!(
            workers,
            band_rows = bands.first().map_or(0, |b| b.len()),
            "detile pool started"
        );

        Ok(Self {
            region,
            bands,
            workers: pool,
            finished,
        })
    }

    /// One worker per online CPU.
    pub fn with_default_workers(region: CaptureRegion) -> Result<Self, RecError> {
        Self::new(region, num_cpus::get())
    }

    pub fn workers(&self) -> usize {
        self.workers.len()
    }

    /// Row band owned by each worker, relative to the region's top edge.
    pub fn bands(&self) -> &[Range<u32>] {
        &self.bands
    }

    pub fn region(&self) -> CaptureRegion {
        self.region
    }

    /// Convert the pool's region of `source` into `raster`.
    ///
    /// Returns only after every worker has reported for this frame.
    pub fn run(&self, source: &SourceFrame<'_>, raster: &mut LinearRaster) -> Result<(), RecError> {
        source.check_region(self.region)?;
        if raster.width() != self.region.width || raster.height() != self.region.height {
            return Err(RecError::Config(format!(
                "raster is {}x{}, region is {}x{}",
                raster.width(),
                raster.height(),
                self.region.width,
                self.region.height
            )));
        }

        let row_len = raster.row_len();
        let dst = raster.as_bytes_mut().as_mut_ptr();
        let mut dispatched = 0;

        for (worker, band) in self.workers.iter().zip(&self.bands) {
            let job = FrameJob {
                src: source.data.as_ptr(),
                src_len: source.data.len(),
                pitch: source.pitch,
                width: source.width,
                height: source.height,
                format: source.format,
                layout: source.layout,
                // SAFETY: band.start <= region.height, so the offset stays
                // within (or one past the end of) the raster allocation.
                dst: unsafe { dst.add(band.start as usize * row_len) },
                dst_len: band.len() * row_len,
            };

            let sent = worker
                .start
                .as_ref()
                .is_some_and(|start| start.send(job).is_ok());
            if !sent {
                break;
            }
            dispatched += 1;
        }

        let mut failed = (dispatched < self.workers.len()).then_some(dispatched);
        for _ in 0..dispatched {
            match self.finished.recv() {
                Ok(report) if !report.ok => {
                    failed.get_or_insert(report.worker);
                }
                Ok(_) => {}
                // Every worker is gone, so nobody is touching the raster.
                Err(_) => return Err(RecError::WorkerFailed(failed.unwrap_or(0))),
            }
        }

        match failed {
            Some(worker) => Err(RecError::WorkerFailed(worker)),
            None => Ok(()),
        }
    }
}

impl Drop for DetilePool {
    fn drop(&mut self) {
        for worker in &mut self.workers {
            worker.start.take();
        }
        for worker in &mut self.workers {
            if let Some(handle) = worker.handle.take() {
                let _ = handle.join();
            }
        }
        debug!("detile pool stopped");
    }
}

fn worker_loop(
    index: usize,
    region: CaptureRegion,
    band: Range<u32>,
    start: Receiver<FrameJob>,
    finished: Sender<BandReport>,
) {
    while let Ok(job) = start.recv() {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            // SAFETY: the orchestrator is blocked in `DetilePool::run` until
            // the report below arrives, and this band is ours alone.
            let (source, out) = unsafe { job.parts() };
            convert_rows(&source, region, band.clone(), out);
        }));

        if outcome.is_err() {
            error!(worker = index, "band conversion panicked");
        }

        let report = BandReport {
            worker: index,
            ok: outcome.is_ok(),
        };
        if finished.send(report).is_err() {
            break;
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::paint;
    use crate::tiling::detile;
    use proptest::prelude::*;

    fn pattern(x: u32, y: u32) -> [u8; 3] {
        [x as u8, y as u8, (x * 3 + y * 5) as u8]
    }

    fn tiled_frame(data: &[u8], width: u32, height: u32, pitch: u32) -> SourceFrame<'_> {
        SourceFrame {
            data,
            pitch,
            width,
            height,
            format: PixelFormat::Xrgb8888,
            layout: PixelLayout::TiledX4Kb,
        }
    }

    #[test]
    fn bands_round_up() {
        assert_eq!(partition_rows(10, 4), vec![0..3, 3..6, 6..9, 9..10]);
        assert_eq!(partition_rows(3, 4), vec![0..1, 1..2, 2..3, 3..3]);
        assert_eq!(partition_rows(8, 1), vec![0..8]);
    }

    #[test]
    fn pool_matches_single_thread() {
        let data = paint(PixelLayout::TiledX4Kb, 512, 64, 16, pattern);
        let src = tiled_frame(&data, 64, 16, 512);
        let region = CaptureRegion::full(64, 16);

        let pool = DetilePool::new(region, 4).unwrap();
        let mut raster = LinearRaster::new(64, 16);
        pool.run(&src, &mut raster).unwrap();

        assert_eq!(raster, detile(&src, region).unwrap());
    }

    #[test]
    fn pool_is_reused_across_frames() {
        let region = CaptureRegion { x: 3, y: 2, width: 40, height: 9 };
        let pool = DetilePool::new(region, 3).unwrap();
        let mut raster = LinearRaster::new(40, 9);

        for frame in 0..5u32 {
            let data = paint(PixelLayout::TiledX4Kb, 512, 64, 16, |x, y| {
                [(x + frame) as u8, y as u8, frame as u8]
            });
            let src = tiled_frame(&data, 64, 16, 512);
            pool.run(&src, &mut raster).unwrap();
            assert_eq!(raster.pixel(0, 0), [(3 + frame) as u8, 2, frame as u8]);
            assert_eq!(raster.pixel(39, 8), [(42 + frame) as u8, 10, frame as u8]);
        }
    }

    #[test]
    fn more_workers_than_rows() {
        let data = paint(PixelLayout::TiledX4Kb, 512, 64, 8, pattern);
        let src = tiled_frame(&data, 64, 8, 512);
        let region = CaptureRegion { x: 0, y: 0, width: 64, height: 3 };

        let pool = DetilePool::new(region, 8).unwrap();
        let mut raster = LinearRaster::new(64, 3);
        pool.run(&src, &mut raster).unwrap();
        assert_eq!(raster, detile(&src, region).unwrap());
    }

    #[test]
    fn raster_size_mismatch_is_rejected() {
        let data = paint(PixelLayout::TiledX4Kb, 512, 64, 8, pattern);
        let src = tiled_frame(&data, 64, 8, 512);
        let pool = DetilePool::new(CaptureRegion::full(64, 8), 2).unwrap();
        let mut raster = LinearRaster::new(32, 8);
        assert!(matches!(pool.run(&src, &mut raster), Err(RecError::Config(_))));
    }

    #[test]
    fn zero_workers_rejected() {
        assert!(DetilePool::new(CaptureRegion::full(8, 8), 0).is_err());
    }

    proptest! {
        #[test]
        fn bands_cover_every_row_once(height in 0u32..2000, workers in 1usize..64) {
            let bands = partition_rows(height, workers);
            prop_assert_eq!(bands.len(), workers);

            let mut next = 0;
            for band in &bands {
                prop_assert_eq!(band.start, next);
                prop_assert!(band.end >= band.start);
                next = band.end;
            }
            prop_assert_eq!(next, height);
        }
    }
}
