//! screenrec entry point.
//!
//! ```text
//! screenrec record [-o out.mkv]       Record until ENTER / Ctrl-C
//! screenrec screenshot [-o shot.ppm]  Save one frame
//! screenrec --config <path> ...       Load a custom config TOML
//! screenrec --gen-config              Write default config to stdout
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use clap::{Args, CommandFactory, Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use screenrec::config::ScreenrecConfig;
use screenrec::session;
use screenrec_core::Preset;

// ── CLI ──────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(name = "screenrec", about = "Record the framebuffer into a streaming Matroska file")]
struct Cli {
    /// Path to configuration TOML file.
    #[arg(short, long, default_value = "screenrec.toml")]
    config: PathBuf,

    /// Print the default configuration to stdout and exit.
    #[arg(long)]
    gen_config: bool,

    /// Capture rectangle `X,Y[,WxH]`.
    #[arg(short, long, global = true)]
    geometry: Option<String>,

    #[command(subcommand)]
    command: Option<Mode>,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Record video until stopped.
    Record(RecordArgs),
    /// Save a single frame as PPM.
    Screenshot {
        /// Output image.
        #[arg(short, long, default_value = "screenshot.ppm")]
        output: PathBuf,
    },
}

#[derive(Args, Debug)]
struct RecordArgs {
    /// Output file.
    #[arg(short, long, default_value = "screenrec.mkv")]
    output: PathBuf,

    /// Encoder speed preset.
    #[arg(short, long)]
    preset: Option<Preset>,

    /// Capture every N vblanks (1-9).
    #[arg(short = 'y', long)]
    interval: Option<u32>,

    /// Detile threads (0 = one per CPU).
    #[arg(short, long)]
    workers: Option<usize>,

    /// Stop after this many seconds.
    #[arg(short = 't', long)]
    max_seconds: Option<f64>,
}

impl RecordArgs {
    fn apply(&self, config: &mut ScreenrecConfig) {
        if let Some(preset) = self.preset {
            config.encoder.preset = preset;
        }
        if let Some(interval) = self.interval {
            config.capture.interval = interval;
        }
        if let Some(workers) = self.workers {
            config.capture.workers = workers;
        }
        if let Some(secs) = self.max_seconds {
            config.capture.max_seconds = secs;
        }
    }
}

// ── Main ─────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // --gen-config: dump defaults and exit.
    if cli.gen_config {
        let text = toml::to_string_pretty(&ScreenrecConfig::default())?;
        println!("{text}");
        return Ok(());
    }

    let Some(mode) = cli.command else {
        Cli::command().print_help()?;
        return Ok(());
    };

    // Load config.
    let (mut config, origin) = ScreenrecConfig::load(&cli.config);
    if let Some(geometry) = cli.geometry {
        config.capture.geometry = geometry;
    }
    if let Mode::Record(args) = &mode {
        args.apply(&mut config);
    }

    // Init tracing.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
    origin.report(&cli.config);

    info!("screenrec v{}", env!("CARGO_PKG_VERSION"));
    info!(
        "source: {}x{} @ {} Hz",
        config.source.width, config.source.height, config.source.refresh_hz
    );

    let outcome = match mode {
        Mode::Record(args) => record(config, args.output).await,
        Mode::Screenshot { output } => {
            tokio::task::spawn_blocking(move || session::screenshot(&config, &output))
                .await
                .map_err(|e| e.to_string())
                .and_then(|r| r.map(|_| ()).map_err(|e| e.to_string()))
        }
    };

    if let Err(e) = outcome {
        error!("{e}");
        std::process::exit(1);
    }
    Ok(())
}

async fn record(config: ScreenrecConfig, output: PathBuf) -> Result<(), String> {
    let stop = Arc::new(AtomicBool::new(false));

    // Ctrl-C handler.
    let stop_clone = stop.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("Ctrl-C received, stopping");
        stop_clone.store(true, Ordering::SeqCst);
    });

    // ENTER on stdin; detached so a pending read cannot delay exit.
    let stop_clone = stop.clone();
    std::thread::spawn(move || {
        let mut line = String::new();
        if std::io::stdin().read_line(&mut line).is_ok_and(|n| n > 0) {
            info!("ENTER received, stopping");
            stop_clone.store(true, Ordering::SeqCst);
        }
    });

    println!("Recording to {}; press ENTER or Ctrl-C to stop.", output.display());
    let summary = tokio::task::spawn_blocking(move || session::record(&config, &output, stop))
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())?;

    println!(
        "{} frames ({} dropped), {} units in {} clusters, {} cues, {} bytes",
        summary.frames,
        summary.dropped,
        summary.units,
        summary.clusters,
        summary.cues,
        summary.bytes
    );
    Ok(())
}
