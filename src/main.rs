mod capture;
mod category;
mod codec;
mod config;
mod error;
mod export;
mod frame;
mod progress;
mod report;
mod round;
mod session;
mod source;
mod store;
mod ui;
mod util;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::HumanBytes;
use log::{info, warn};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;

use capture::{CaptureStats, SystemClock};
use category::{Category, Subphase};
use config::{CameraConfig, CaptureConfig, CaptureOptions, SourceTarget};
use export::{ExportMode, ExportStats};
use progress::{format_duration, ProgressConfig, ProgressMode, ProgressReporter, ProgressUnit};
use round::RoundTracker;
use session::{ClassificationSession, SubphasePolicy};
use source::FfmpegSource;
use store::ClassificationStore;

#[derive(Parser)]
#[command(
    name = "phasecap",
    version,
    about = "Round-aware camera frame capture and furnace phase labeling"
)]
struct Cli {
    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture one round of frames from the camera stream
    Capture {
        /// Directory the JPEG frames are written to
        #[arg(long, env = "CAPTURE_OUTPUT_DIR", default_value = config::DEFAULT_OUTPUT_DIR)]
        output_dir: PathBuf,

        /// Minimum seconds between two saved frames
        #[arg(long, env = "CAPTURE_INTERVAL_SECONDS", default_value_t = 2.0)]
        interval_seconds: f64,

        /// JPEG quality, 1-100
        #[arg(long, env = "CAPTURE_JPEG_QUALITY", default_value_t = 90)]
        jpeg_quality: u8,

        /// Wall-clock budget of the session in minutes
        #[arg(long, env = "CAPTURE_DURATION_MINUTES", default_value_t = 1440.0)]
        duration_minutes: f64,

        /// Consecutive read failures tolerated before the session ends
        #[arg(long, default_value_t = 30)]
        max_read_failures: u32,

        /// Seconds to wait for a frame before counting a read failure
        #[arg(long, default_value_t = 10.0)]
        read_timeout_seconds: f64,

        /// File holding the last used round id
        #[arg(long, default_value = config::DEFAULT_STATE_FILE)]
        state_file: PathBuf,

        /// Append-only session report
        #[arg(long, default_value = config::DEFAULT_SUMMARY_FILE)]
        summary_file: PathBuf,

        /// Explicit stream URL or video file; bypasses the camera fields
        #[arg(long)]
        source: Option<String>,

        #[arg(long, env = "CAMERA_USERNAME")]
        camera_username: Option<String>,

        #[arg(long, env = "CAMERA_PASSWORD", hide_env_values = true)]
        camera_password: Option<String>,

        #[arg(long, env = "CAMERA_IP")]
        camera_ip: Option<String>,

        #[arg(long, env = "CAMERA_PORT")]
        camera_port: Option<String>,

        #[arg(long, env = "RTSP_STREAM_PATH")]
        rtsp_stream_path: Option<String>,

        /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
        #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
        progress: ProgressMode,
    },

    /// Show which round id the next capture will use
    Rounds {
        #[arg(long, env = "CAPTURE_OUTPUT_DIR", default_value = config::DEFAULT_OUTPUT_DIR)]
        output_dir: PathBuf,

        #[arg(long, default_value = config::DEFAULT_STATE_FILE)]
        state_file: PathBuf,
    },

    /// Label captured frames interactively
    Classify {
        #[arg(long, env = "CAPTURE_OUTPUT_DIR", default_value = config::DEFAULT_OUTPUT_DIR)]
        frames_dir: PathBuf,

        #[arg(long, default_value = store::DEFAULT_STORE_FILE)]
        store: PathBuf,

        /// Whether categories 1-5 need a sub-phase (i/m/f) first
        #[arg(long, value_enum, default_value_t = SubphasePolicy::Required)]
        subphase: SubphasePolicy,

        /// Image viewer program launched with the current frame path
        #[arg(long)]
        viewer: Option<String>,
    },

    /// Copy (or move) labeled frames into per-category folders
    Export {
        #[arg(long, default_value = store::DEFAULT_STORE_FILE)]
        store: PathBuf,

        #[arg(long)]
        dest: PathBuf,

        /// Rename instead of copy
        #[arg(long = "move", default_value_t = false)]
        move_files: bool,

        /// Progress display mode: auto (TTY-aware), rich, plain, quiet.
        #[arg(long, value_enum, default_value_t = ProgressMode::Auto)]
        progress: ProgressMode,
    },

    /// Tally the labels in a classification store
    Stats {
        #[arg(long, default_value = store::DEFAULT_STORE_FILE)]
        store: PathBuf,

        #[arg(long, env = "CAPTURE_OUTPUT_DIR", default_value = config::DEFAULT_OUTPUT_DIR)]
        frames_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    // A missing .env is normal; the environment alone is enough.
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.cmd {
        Commands::Capture {
            output_dir,
            interval_seconds,
            jpeg_quality,
            duration_minutes,
            max_read_failures,
            read_timeout_seconds,
            state_file,
            summary_file,
            source,
            camera_username,
            camera_password,
            camera_ip,
            camera_port,
            rtsp_stream_path,
            progress,
        } => {
            let target = match source {
                Some(url) => SourceTarget::Url(url),
                None => CameraConfig {
                    username: camera_username,
                    password: camera_password,
                    host: camera_ip,
                    port: camera_port,
                    stream_path: rtsp_stream_path,
                }
                .into_target()?,
            };
            let cfg = CaptureConfig::from_options(CaptureOptions {
                output_dir,
                interval_seconds,
                jpeg_quality,
                duration_minutes,
                max_read_failures,
                read_timeout_seconds,
                state_file,
                summary_file,
            })?;
            let stats = run_capture_command(&target, &cfg, ProgressConfig::new(progress))?;
            print_capture_summary(&stats, &cfg);
        }

        Commands::Rounds {
            output_dir,
            state_file,
        } => {
            let decision = RoundTracker::new(&state_file, &output_dir).decide();
            println!(
                "Round summary: next_round={} state={} scanned_max={} state_file={} output={}",
                decision.next,
                fmt_opt(decision.persisted),
                fmt_opt(decision.scanned_max),
                state_file.display(),
                output_dir.display(),
            );
        }

        Commands::Classify {
            frames_dir,
            store,
            subphase,
            viewer,
        } => {
            let frames = frame::scan_frames(&frames_dir)?;
            let store = ClassificationStore::load(&store)?;
            let mut session = ClassificationSession::new(frames, store, subphase)
                .with_context(|| format!("classify {}", frames_dir.display()))?;
            let mut viewer = viewer.map(ui::Viewer::new);

            let interactive = std::io::stdin().is_terminal() && std::io::stdout().is_terminal();
            let summary = if interactive {
                let mut frontend = ui::TerminalUi::open()?;
                ui::run_session(&mut session, &mut frontend, viewer.as_mut())?
            } else {
                let stdin = std::io::stdin();
                let mut frontend = ui::LineUi::new(stdin.lock(), std::io::stdout());
                ui::run_session(&mut session, &mut frontend, viewer.as_mut())?
            };

            println!(
                "Classify summary: frames={} labeled={} commits={} reclassified={} rejected={} position={} store={}",
                session.len(),
                session.store().len(),
                summary.commits,
                summary.reclassified,
                summary.rejected,
                summary.last_index + 1,
                session.store().path().display(),
            );
        }

        Commands::Export {
            store,
            dest,
            move_files,
            progress,
        } => {
            let mut store = ClassificationStore::load(&store)?;
            if store.is_empty() {
                warn!("{} holds no classifications", store.path().display());
            }
            let mode = if move_files {
                ExportMode::Move
            } else {
                ExportMode::Copy
            };
            let reporter = ProgressReporter::new(
                "export",
                store.len() as u64,
                ProgressUnit::Files,
                ProgressConfig::new(progress),
            );
            let stats = export::export_frames(&mut store, &dest, mode, &reporter.handle())?;
            let outcome = reporter.finish("export complete");
            print_export_summary(&stats, &dest, mode, outcome.elapsed, outcome.warning_count);
            for warning in outcome.warnings {
                println!("  warning: {}", warning);
            }
        }

        Commands::Stats { store, frames_dir } => {
            let store = ClassificationStore::load(&store)?;
            print_stats(&store, &frames_dir)?;
        }
    }

    Ok(())
}

/// Round decision, capture, report, then round persistence. A source that
/// cannot be opened aborts before any of the later steps.
fn run_capture_command(
    target: &SourceTarget,
    cfg: &CaptureConfig,
    progress_cfg: ProgressConfig,
) -> Result<CaptureStats> {
    let tracker = RoundTracker::new(&cfg.state_file, &cfg.output_dir);
    let round_id = tracker.next_round_id();

    let mut source = FfmpegSource::open(target.clone(), cfg.read_timeout)
        .with_context(|| format!("open frame source {}", target.masked()))?;
    std::fs::create_dir_all(&cfg.output_dir)
        .with_context(|| format!("create {}", cfg.output_dir.display()))?;
    info!(
        "round {}: capturing into {} every {:?} for {} minutes",
        round_id,
        cfg.output_dir.display(),
        cfg.interval,
        cfg.duration_minutes
    );

    let reporter = ProgressReporter::new(
        format!("round {}", round_id),
        cfg.duration.as_secs(),
        ProgressUnit::Seconds,
        progress_cfg.with_idle_threshold((cfg.interval * 5).max(Duration::from_secs(30))),
    );
    let (width, height) = source.frame_size();
    reporter
        .handle()
        .log(format!("stream {} at {}x{}", target.masked(), width, height));
    let stats = capture::run_capture(
        &mut source,
        &SystemClock::start(),
        round_id,
        cfg,
        &reporter.handle(),
    );
    drop(source);
    let outcome = reporter.finish(stats.termination.to_string());

    if let Err(e) = report::append_report(&cfg.summary_file, &stats, &target.masked()) {
        warn!("session report not written: {:#}", e);
    }
    tracker.persist(round_id)?;
    info!(
        "round {} recorded in {}",
        round_id,
        tracker.state_file().display()
    );

    for warning in outcome.warnings {
        println!("  warning: {}", warning);
    }
    Ok(stats)
}

fn print_capture_summary(stats: &CaptureStats, cfg: &CaptureConfig) {
    println!(
        "Capture summary: round={} frames={} bytes={} avg_bytes={:.0} duration={} termination={} read_failures={} write_failures={} output={} report={}",
        stats.round_id,
        stats.frames_saved,
        HumanBytes(stats.total_bytes),
        stats.average_bytes_per_frame(),
        format_duration(stats.actual_duration()),
        stats.termination,
        stats.read_failures,
        stats.write_failures,
        cfg.output_dir.display(),
        cfg.summary_file.display(),
    );
}

fn print_export_summary(
    stats: &ExportStats,
    dest: &Path,
    mode: ExportMode,
    elapsed: Duration,
    warnings: usize,
) {
    println!(
        "Export summary: dest={} mode={} exported={} already_present={} missing={} bytes={} duration={} warnings={}",
        dest.display(),
        match mode {
            ExportMode::Copy => "copy",
            ExportMode::Move => "move",
        },
        stats.exported,
        stats.already_present,
        stats.missing,
        HumanBytes(stats.bytes),
        format_duration(elapsed),
        warnings,
    );
}

fn print_stats(store: &ClassificationStore, frames_dir: &Path) -> Result<()> {
    let counts = store.counts();
    for category in Category::ALL {
        let mut line = format!(
            "  {} {:<32} {:>6}",
            category.id(),
            category.name(),
            counts.get(category)
        );
        if !category.is_null() {
            for sub in Subphase::ALL {
                line.push_str(&format!(
                    " {}={}",
                    sub.name(),
                    counts.get_subphase(category, sub)
                ));
            }
        }
        println!("{}", line);
    }

    let on_disk = if frames_dir.is_dir() {
        frame::scan_frames(frames_dir)?
    } else {
        vec![]
    };
    let unclassified = on_disk
        .iter()
        .filter(|f| store.get(&f.name.file_name()).is_none())
        .count();
    let exported = store
        .entries()
        .filter(|e| e.destination_path.is_some())
        .count();
    println!(
        "Stats summary: store={} classified={} exported={} frames_on_disk={} unclassified={}",
        store.path().display(),
        counts.total(),
        exported,
        on_disk.len(),
        unclassified,
    );
    Ok(())
}

fn fmt_opt(v: Option<u64>) -> String {
    v.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}
