use anyhow::{Context, Result};
use log::info;
use std::fmt::Write as _;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::time::Duration;

use crate::capture::CaptureStats;
use crate::progress::format_duration;

const REPORT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Appends one session record to `path`. Earlier records are never touched.
pub fn append_report(path: &Path, stats: &CaptureStats, camera: &str) -> Result<()> {
    if let Some(dir) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open session report {}", path.display()))?;
    file.write_all(render(stats, camera).as_bytes())
        .with_context(|| format!("append session report {}", path.display()))?;
    info!(
        "round {} report appended to {}",
        stats.round_id,
        path.display()
    );
    Ok(())
}

/// Fixed field order; one `Key: value` per line between start/end markers.
pub fn render(stats: &CaptureStats, camera: &str) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "--- Round {} Start: {} ---",
        stats.round_id,
        stats.started_at.format(REPORT_TIME_FORMAT)
    );
    let _ = writeln!(out, "Start Time: {}", stats.started_at.format(REPORT_TIME_FORMAT));
    let _ = writeln!(out, "End Time: {}", stats.ended_at.format(REPORT_TIME_FORMAT));
    let _ = writeln!(out, "Camera URL: {}", camera);
    let _ = writeln!(
        out,
        "Configured Duration: {} ({:.2} minutes)",
        format_duration(stats.configured_duration),
        stats.configured_duration.as_secs_f64() / 60.0
    );
    let _ = writeln!(
        out,
        "Actual Duration: {} ({:.1} seconds)",
        format_duration(stats.actual_duration()),
        stats.actual_duration().as_secs_f64()
    );
    let _ = writeln!(out, "Capture Interval: {} seconds", seconds(stats.interval));
    let _ = writeln!(out, "JPEG Quality: {}", stats.jpeg_quality);
    let _ = writeln!(out, "Frames Saved: {}", stats.frames_saved);
    let _ = writeln!(out, "Total Size: {} bytes", stats.total_bytes);
    let _ = writeln!(
        out,
        "Average Size: {:.2} bytes",
        stats.average_bytes_per_frame()
    );
    let _ = writeln!(out, "Read Failures: {}", stats.read_failures);
    let _ = writeln!(out, "Termination: {}", stats.termination);
    let _ = writeln!(out, "--- Round {} End ---", stats.round_id);
    out.push('\n');
    out
}

fn seconds(d: Duration) -> String {
    let secs = d.as_secs_f64();
    if secs.fract() == 0.0 {
        format!("{}", d.as_secs())
    } else {
        format!("{:.3}", secs)
    }
}
