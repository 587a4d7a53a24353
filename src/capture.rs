use chrono::{DateTime, Local};
use std::time::{Duration, Instant};

use crate::codec;
use crate::config::CaptureConfig;
use crate::frame::FrameName;
use crate::progress::ProgressHandle;
use crate::source::FrameSource;
use crate::util;

/// Time as seen by the capture loop.
pub trait Clock {
    /// Monotonic time since the loop started.
    fn elapsed(&self) -> Duration;
    /// Wall-clock time, used for frame names and the session report.
    fn now(&self) -> DateTime<Local>;
    fn sleep(&self, d: Duration);
}

pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn start() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Clock for SystemClock {
    fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    fn sleep(&self, d: Duration) {
        std::thread::sleep(d)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    DurationElapsed,
    SourceExhausted,
    ReadFailures(u32),
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::DurationElapsed => f.write_str("duration elapsed"),
            Termination::SourceExhausted => f.write_str("source exhausted"),
            Termination::ReadFailures(n) => {
                write!(f, "too many read failures ({} consecutive)", n)
            }
        }
    }
}

/// Aggregate of one capture session, consumed once by the session report.
#[derive(Debug, Clone)]
pub struct CaptureStats {
    pub round_id: u64,
    pub frames_saved: u64,
    pub total_bytes: u64,
    pub started_at: DateTime<Local>,
    pub ended_at: DateTime<Local>,
    pub configured_duration: Duration,
    pub interval: Duration,
    pub jpeg_quality: u8,
    pub read_failures: u64,
    pub write_failures: u64,
    pub termination: Termination,
}

impl CaptureStats {
    pub fn actual_duration(&self) -> Duration {
        (self.ended_at - self.started_at)
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    pub fn average_bytes_per_frame(&self) -> f64 {
        if self.frames_saved == 0 {
            0.0
        } else {
            self.total_bytes as f64 / self.frames_saved as f64
        }
    }
}

/// Pulls frames until the duration budget elapses, the source ends, or too
/// many reads fail in a row. Frames arriving sooner than `interval` after the
/// previous save are dropped. Always returns the stats gathered so far.
pub fn run_capture(
    source: &mut dyn FrameSource,
    clock: &dyn Clock,
    round_id: u64,
    cfg: &CaptureConfig,
    progress: &ProgressHandle,
) -> CaptureStats {
    let started_at = clock.now();
    let mut stats = CaptureStats {
        round_id,
        frames_saved: 0,
        total_bytes: 0,
        started_at,
        ended_at: started_at,
        configured_duration: cfg.duration,
        interval: cfg.interval,
        jpeg_quality: cfg.jpeg_quality,
        read_failures: 0,
        write_failures: 0,
        termination: Termination::DurationElapsed,
    };

    let mut last_saved: Option<Duration> = None;
    let mut consecutive_failures = 0u32;
    progress.set_stage(format!("round {}: capturing", round_id));

    while clock.elapsed() < cfg.duration {
        let frame = match source.read_frame() {
            Ok(Some(frame)) => {
                consecutive_failures = 0;
                frame
            }
            Ok(None) => {
                stats.termination = Termination::SourceExhausted;
                break;
            }
            Err(e) => {
                consecutive_failures += 1;
                stats.read_failures += 1;
                progress.warn(format!(
                    "read failure {}/{}: {}",
                    consecutive_failures, cfg.max_read_failures, e
                ));
                if !e.is_transient() || consecutive_failures >= cfg.max_read_failures {
                    stats.termination = Termination::ReadFailures(consecutive_failures);
                    break;
                }
                clock.sleep(cfg.poll_delay);
                continue;
            }
        };

        let now = clock.elapsed();
        progress.set_position(now.as_secs());
        let due = last_saved.map_or(true, |t| now.saturating_sub(t) >= cfg.interval);
        if due {
            if frame.is_empty() {
                progress.warn("empty frame received, skipping save");
            } else {
                let frame_number = stats.frames_saved + 1;
                let name = FrameName::new(round_id, frame_number, &clock.now());
                let path = cfg.output_dir.join(name.file_name());
                let written = codec::encode_jpeg(&frame, cfg.jpeg_quality)
                    .and_then(|bytes| util::write_atomic(&path, &bytes).map(|_| bytes.len() as u64));
                match written {
                    Ok(bytes) => {
                        stats.frames_saved = frame_number;
                        stats.total_bytes += bytes;
                        last_saved = Some(now);
                        progress.record_frame(bytes);
                    }
                    Err(e) => {
                        stats.write_failures += 1;
                        progress.warn(format!("could not save {}: {:#}", name, e));
                    }
                }
            }
        }

        clock.sleep(cfg.poll_delay);
    }

    stats.ended_at = clock.now();
    progress.set_position(clock.elapsed().as_secs());
    progress.set_stage(format!("round {}: {}", round_id, stats.termination));
    stats
}
