//! Blocking recording and screenshot sessions.
//!
//! Both run on the caller's thread; `main` moves them onto tokio's
//! blocking pool so the runtime stays free for signal handling.

use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use tracing::{info, warn};

#[cfg(not(feature = "x264"))]
use screenrec_core::PcmEncoder;
#[cfg(feature = "x264")]
use screenrec_core::X264Encoder;
use screenrec_core::{
    CaptureRegion, CaptureScheduler, EncoderSettings, FrameSource, RecError, RecordingSummary,
    SyntheticSource, VblankTarget, write_ppm,
};

use crate::config::ScreenrecConfig;

fn open_source(config: &ScreenrecConfig) -> Result<SyntheticSource, RecError> {
    SyntheticSource::with_drm_format(
        config.source.width,
        config.source.height,
        config.source.refresh_hz,
        config.source.fourcc,
        config.source.modifier,
    )
}

#[cfg(feature = "x264")]
fn make_encoder(settings: EncoderSettings) -> Result<X264Encoder, RecError> {
    X264Encoder::new(settings)
}

#[cfg(not(feature = "x264"))]
fn make_encoder(settings: EncoderSettings) -> Result<PcmEncoder, RecError> {
    warn!(
        preset = %settings.preset,
        "built without x264; recording losslessly, preset ignored"
    );
    PcmEncoder::new(settings)
}

/// Record to `output` until `stop` is set or the time limit is reached.
///
/// Configuration is checked before `output` is created; if the session
/// still cannot start, the half-made file is removed.
pub fn record(
    config: &ScreenrecConfig,
    output: &Path,
    stop: Arc<AtomicBool>,
) -> Result<RecordingSummary, RecError> {
    let recorder = config.to_recorder_config()?;
    let source = open_source(config)?;
    let frame = source.frame();
    let region = recorder.geometry.resolve(frame.width, frame.height)?;
    frame.check_region(region)?;

    let file = BufWriter::new(File::create(output)?);
    let scheduler = match CaptureScheduler::new(source, make_encoder, file, recorder) {
        Ok(scheduler) => scheduler.with_stop(stop),
        Err(e) => {
            if let Err(remove) = std::fs::remove_file(output) {
                warn!(output = %output.display(), error = %remove, "couldn't remove unstarted output");
            }
            return Err(e);
        }
    };

    info!(output = %output.display(), "recording started");
    let (file, summary) = scheduler.run()?;
    file.into_inner().map_err(|e| e.into_error())?.sync_all()?;
    Ok(summary)
}

/// Capture one frame as PPM into `output`.
pub fn screenshot(config: &ScreenrecConfig, output: &Path) -> Result<CaptureRegion, RecError> {
    let mut source = open_source(config)?;
    source.wait_vblank(VblankTarget::Relative(1))?;

    let frame = source.frame();
    let region = config.geometry()?.resolve(frame.width, frame.height)?;
    write_ppm(&frame, region, BufWriter::new(File::create(output)?))?;

    info!(output = %output.display(), width = region.width, height = region.height, "screenshot saved");
    Ok(region)
}
