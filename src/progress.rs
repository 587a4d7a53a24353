use clap::ValueEnum;
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use std::collections::VecDeque;
use std::io::IsTerminal;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

const WARNINGS_KEPT: usize = 32;
const TICK: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[value(rename_all = "lower")]
pub enum ProgressMode {
    Auto,
    Rich,
    Plain,
    Quiet,
}

/// What position and total count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressUnit {
    /// Seconds of a time budget.
    Seconds,
    Files,
}

#[derive(Debug, Clone, Copy)]
pub struct ProgressConfig {
    pub mode: ProgressMode,
    /// Warn when nothing was saved for this long.
    pub idle_threshold: Duration,
    /// Spacing of `[PROGRESS]` lines in plain mode.
    pub plain_interval: Duration,
    tty_override: Option<bool>,
}

impl ProgressConfig {
    pub fn new(mode: ProgressMode) -> Self {
        Self {
            mode,
            idle_threshold: Duration::from_secs(30),
            plain_interval: Duration::from_secs(10),
            tty_override: None,
        }
    }

    pub fn with_idle_threshold(mut self, idle: Duration) -> Self {
        self.idle_threshold = idle;
        self
    }

    #[cfg(test)]
    pub fn with_tty_override(mut self, is_tty: bool) -> Self {
        self.tty_override = Some(is_tty);
        self
    }

    fn style(&self) -> Style {
        let tty = self
            .tty_override
            .unwrap_or_else(|| std::io::stderr().is_terminal());
        match (self.mode, tty) {
            (ProgressMode::Auto, true) | (ProgressMode::Rich, _) => Style::Bars,
            (ProgressMode::Auto, false) | (ProgressMode::Plain, _) => Style::Lines,
            (ProgressMode::Quiet, _) => Style::Silent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Style {
    Bars,
    Lines,
    Silent,
}

/// Returned once by [`ProgressReporter::finish`].
#[derive(Debug, Clone)]
pub struct ProgressOutcome {
    pub elapsed: Duration,
    pub warning_count: usize,
    pub warnings: Vec<String>,
}

/// Owns the ticker thread. Dropping it without `finish` still closes the display.
pub struct ProgressReporter {
    handle: ProgressHandle,
    ticker: Option<JoinHandle<()>>,
}

/// Cheap clone handed to the worker code.
#[derive(Clone)]
pub struct ProgressHandle {
    shared: Arc<Shared>,
}

struct Shared {
    label: String,
    unit: ProgressUnit,
    style: Style,
    bars: Option<Bars>,
    idle_threshold: Duration,
    plain_interval: Duration,
    tally: Mutex<Tally>,
    stopping: AtomicBool,
    closed: AtomicBool,
}

struct Bars {
    _multi: MultiProgress,
    main: ProgressBar,
    status: ProgressBar,
}

struct Tally {
    started: Instant,
    stage: String,
    position: u64,
    total: u64,
    frames: u64,
    bytes: u64,
    last_saved: Instant,
    last_line: Option<Instant>,
    idle_warned_at: Option<Instant>,
    warnings: VecDeque<String>,
    warning_count: usize,
}

/// Point-in-time copy rendered outside the lock.
struct View {
    stage: String,
    position: u64,
    total: u64,
    frames: u64,
    bytes: u64,
    elapsed: Duration,
    eta: Option<Duration>,
}

impl ProgressReporter {
    pub fn new(
        label: impl Into<String>,
        total: u64,
        unit: ProgressUnit,
        config: ProgressConfig,
    ) -> Self {
        let label = label.into();
        let style = config.style();
        let now = Instant::now();
        let shared = Arc::new(Shared {
            bars: (style == Style::Bars).then(|| Bars::new(&label, total)),
            label,
            unit,
            style,
            idle_threshold: config.idle_threshold,
            plain_interval: config.plain_interval,
            tally: Mutex::new(Tally {
                started: now,
                stage: "starting".to_string(),
                position: 0,
                total,
                frames: 0,
                bytes: 0,
                last_saved: now,
                last_line: None,
                idle_warned_at: None,
                warnings: VecDeque::new(),
                warning_count: 0,
            }),
            stopping: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        });

        let ticking = Arc::clone(&shared);
        let ticker = thread::spawn(move || {
            while !ticking.stopping.load(Ordering::Relaxed) {
                thread::sleep(TICK);
                ticking.tick();
            }
        });

        Self {
            handle: ProgressHandle { shared },
            ticker: Some(ticker),
        }
    }

    pub fn handle(&self) -> ProgressHandle {
        self.handle.clone()
    }

    pub fn finish(mut self, message: impl Into<String>) -> ProgressOutcome {
        self.stop_ticker();
        self.handle.shared.close(Some(message.into()))
    }

    fn stop_ticker(&mut self) {
        self.handle.shared.stopping.store(true, Ordering::Relaxed);
        if let Some(t) = self.ticker.take() {
            let _ = t.join();
        }
    }
}

impl Drop for ProgressReporter {
    fn drop(&mut self) {
        self.stop_ticker();
        let _ = self.handle.shared.close(None);
    }
}

impl ProgressHandle {
    pub fn set_stage(&self, stage: impl Into<String>) {
        let view = self.update(|t| t.stage = stage.into());
        match self.shared.style {
            Style::Bars => self.shared.draw_bars(&view),
            Style::Lines => self.shared.print_line(&view),
            Style::Silent => {}
        }
    }

    /// Clamped to the total when one is known.
    pub fn set_position(&self, position: u64) {
        let view = self.update(|t| {
            t.position = if t.total > 0 {
                position.min(t.total)
            } else {
                position
            }
        });
        self.shared.draw_bars(&view);
    }

    pub fn inc_position(&self, delta: u64) {
        let view = self.update(|t| {
            let next = t.position.saturating_add(delta);
            t.position = if t.total > 0 { next.min(t.total) } else { next };
        });
        self.shared.draw_bars(&view);
    }

    /// One frame (or file) of `bytes` written.
    pub fn record_frame(&self, bytes: u64) {
        let view = self.update(|t| {
            t.frames += 1;
            t.bytes = t.bytes.saturating_add(bytes);
            t.last_saved = Instant::now();
        });
        self.shared.draw_bars(&view);
    }

    /// Printed right away and kept for the final outcome.
    pub fn warn(&self, message: impl Into<String>) {
        let message = message.into();
        self.shared.lock().remember(&message);
        self.shared.emit("WARN", &message);
    }

    pub fn log(&self, message: impl Into<String>) {
        self.shared.emit("INFO", &message.into());
    }

    fn update(&self, f: impl FnOnce(&mut Tally)) -> View {
        let mut tally = self.shared.lock();
        f(&mut tally);
        tally.view(self.shared.unit)
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Tally> {
        self.tally.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn tick(&self) {
        if self.style == Style::Silent {
            return;
        }
        let now = Instant::now();
        let (view, line_due, idle) = {
            let mut tally = self.lock();
            let line_due = tally
                .last_line
                .map_or(true, |at| now.duration_since(at) >= self.plain_interval);
            let idle = if idle_warning_due(
                now,
                tally.last_saved,
                tally.idle_warned_at,
                self.idle_threshold,
            ) {
                tally.idle_warned_at = Some(now);
                let msg = format!(
                    "IDLE WARNING: nothing saved for {} (stage={}, frames={})",
                    format_duration(now.duration_since(tally.last_saved)),
                    tally.stage,
                    tally.frames
                );
                tally.remember(&msg);
                Some(msg)
            } else {
                None
            };
            (tally.view(self.unit), line_due, idle)
        };

        match self.style {
            Style::Bars => self.draw_bars(&view),
            Style::Lines if line_due => self.print_line(&view),
            _ => {}
        }
        if let Some(msg) = idle {
            self.emit("WARN", &msg);
        }
    }

    fn draw_bars(&self, view: &View) {
        let Some(bars) = &self.bars else {
            return;
        };
        bars.main.set_length(view.total.max(1));
        bars.main.set_position(view.position.min(view.total.max(1)));
        bars.main.set_message(format!(
            "frames={} {} avg={} ETA={}",
            view.frames,
            HumanBytes(view.bytes),
            HumanBytes(average(view.bytes, view.frames)),
            format_eta(view.eta)
        ));
        bars.status
            .set_message(format!("{} | {}", view.stage, format_duration(view.elapsed)));
    }

    fn print_line(&self, view: &View) {
        self.lock().last_line = Some(Instant::now());
        eprintln!(
            "[PROGRESS] {} elapsed={} stage={} done={} / {} ({:.1}%) frames={} bytes={} rate={} ETA={}",
            self.label,
            format_duration(view.elapsed),
            view.stage,
            format_amount(view.position, self.unit),
            format_amount(view.total, self.unit),
            percent(view.position, view.total),
            view.frames,
            HumanBytes(view.bytes),
            format_frame_rate(view.frames, view.elapsed),
            format_eta(view.eta)
        );
    }

    fn emit(&self, level: &str, message: &str) {
        let line = format!("[{}] {}: {}", level, self.label, message);
        match (&self.bars, self.style) {
            (_, Style::Silent) => {}
            (Some(bars), _) => bars.status.println(line),
            (None, _) => eprintln!("{}", line),
        }
    }

    fn close(&self, message: Option<String>) -> ProgressOutcome {
        let (view, outcome) = {
            let tally = self.lock();
            (
                tally.view(self.unit),
                ProgressOutcome {
                    elapsed: tally.started.elapsed(),
                    warning_count: tally.warning_count,
                    warnings: tally.warnings.iter().cloned().collect(),
                },
            )
        };
        if self.closed.swap(true, Ordering::Relaxed) {
            return outcome;
        }

        match self.style {
            Style::Silent => {}
            Style::Lines => {
                self.print_line(&view);
                if let Some(msg) = message {
                    eprintln!("[DONE] {}: {}", self.label, msg);
                }
            }
            Style::Bars => {
                if let Some(bars) = &self.bars {
                    bars.main.finish_with_message(format!(
                        "frames={} {} in {}",
                        view.frames,
                        HumanBytes(view.bytes),
                        format_duration(view.elapsed)
                    ));
                    match message {
                        Some(msg) => bars.status.finish_with_message(msg),
                        None => bars.status.finish_and_clear(),
                    }
                }
            }
        }
        outcome
    }
}

impl Bars {
    fn new(label: &str, total: u64) -> Self {
        let multi = MultiProgress::new();
        let main = multi.add(ProgressBar::new(total.max(1)));
        main.set_style(
            ProgressStyle::with_template(
                "{prefix:.bold} [{elapsed_precise}] {bar:40.green/white} {percent:>3}% {msg}",
            )
            .expect("valid progress template"),
        );
        main.set_prefix(label.to_string());

        let status = multi.add(ProgressBar::new_spinner());
        status.set_style(
            ProgressStyle::with_template("  {spinner:.yellow} {msg}")
                .expect("valid status template"),
        );
        status.enable_steady_tick(Duration::from_millis(150));

        Self {
            _multi: multi,
            main,
            status,
        }
    }
}

impl Tally {
    fn remember(&mut self, message: &str) {
        if self.warnings.len() == WARNINGS_KEPT {
            self.warnings.pop_front();
        }
        self.warnings.push_back(message.to_string());
        self.warning_count += 1;
    }

    fn view(&self, unit: ProgressUnit) -> View {
        let elapsed = self.started.elapsed();
        View {
            stage: self.stage.clone(),
            position: self.position,
            total: self.total,
            frames: self.frames,
            bytes: self.bytes,
            elapsed,
            eta: remaining(unit, self.position, self.total, elapsed),
        }
    }
}

/// Time budgets count down; file counts extrapolate from the pace so far.
fn remaining(unit: ProgressUnit, position: u64, total: u64, elapsed: Duration) -> Option<Duration> {
    if position >= total {
        return None;
    }
    match unit {
        ProgressUnit::Seconds => Some(Duration::from_secs(total - position)),
        ProgressUnit::Files if position == 0 => None,
        ProgressUnit::Files => {
            let per_file = elapsed.as_secs_f64() / position as f64;
            Some(Duration::from_secs_f64(per_file * (total - position) as f64))
        }
    }
}

fn idle_warning_due(
    now: Instant,
    last_saved: Instant,
    warned_at: Option<Instant>,
    threshold: Duration,
) -> bool {
    if now.duration_since(last_saved) < threshold {
        return false;
    }
    warned_at.map_or(true, |at| now.duration_since(at) >= threshold)
}

fn average(bytes: u64, frames: u64) -> u64 {
    if frames == 0 {
        0
    } else {
        bytes / frames
    }
}

fn percent(position: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        position as f64 * 100.0 / total as f64
    }
}

/// `MM:SS`, or `HH:MM:SS` past the hour.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    let (h, m, s) = (secs / 3600, secs / 60 % 60, secs % 60);
    if h > 0 {
        format!("{:02}:{:02}:{:02}", h, m, s)
    } else {
        format!("{:02}:{:02}", m, s)
    }
}

fn format_amount(value: u64, unit: ProgressUnit) -> String {
    match unit {
        ProgressUnit::Seconds => format_duration(Duration::from_secs(value)),
        ProgressUnit::Files => format!("{} files", value),
    }
}

fn format_frame_rate(frames: u64, elapsed: Duration) -> String {
    let minutes = elapsed.as_secs_f64() / 60.0;
    if minutes <= f64::EPSILON {
        "0.0 frames/min".to_string()
    } else {
        format!("{:.1} frames/min", frames as f64 / minutes)
    }
}

fn format_eta(eta: Option<Duration>) -> String {
    eta.map(format_duration).unwrap_or_else(|| "--:--".to_string())
}
