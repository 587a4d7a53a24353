use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::{debug, info, warn};
use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Read};
use std::process::{Child, Command, Stdio};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::SourceTarget;
use crate::error::SourceError;

/// One decoded picture, packed RGB24.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    pub rgb: Vec<u8>,
}

impl Frame {
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0 || self.rgb.is_empty()
    }
}

pub trait FrameSource {
    /// `Ok(None)` once the source is exhausted.
    fn read_frame(&mut self) -> Result<Option<Frame>, SourceError>;
}

/// Frames decoded by an `ffmpeg` child process into raw RGB24 on a pipe.
pub struct FfmpegSource {
    target: SourceTarget,
    width: u32,
    height: u32,
    read_timeout: Duration,
    stream: Option<Stream>,
}

struct Stream {
    child: Child,
    frames: Receiver<Vec<u8>>,
    reader: Option<JoinHandle<()>>,
    stderr: Option<JoinHandle<Vec<String>>>,
}

impl FfmpegSource {
    /// Probes the target first; an unreachable stream fails here with
    /// `SourceError::Connection` before any frame is requested.
    pub fn open(target: SourceTarget, read_timeout: Duration) -> Result<Self, SourceError> {
        let (width, height) = probe_frame_size(&target, read_timeout)?;
        info!(
            "connected to {} ({}x{})",
            target.masked(),
            width,
            height
        );
        let stream = spawn_stream(&target, width, height)?;
        Ok(Self {
            target,
            width,
            height,
            read_timeout,
            stream: Some(stream),
        })
    }

    pub fn frame_size(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn restart(&mut self) -> Result<(), SourceError> {
        if let Some(old) = self.stream.take() {
            old.shutdown();
        }
        self.stream = Some(spawn_stream(&self.target, self.width, self.height)?);
        Ok(())
    }
}

impl FrameSource for FfmpegSource {
    fn read_frame(&mut self) -> Result<Option<Frame>, SourceError> {
        let Some(stream) = self.stream.as_mut() else {
            return Ok(None);
        };
        match stream.frames.recv_timeout(self.read_timeout) {
            Ok(rgb) => Ok(Some(Frame {
                width: self.width,
                height: self.height,
                rgb,
            })),
            Err(RecvTimeoutError::Timeout) => Err(SourceError::Timeout(self.read_timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                let Some(stream) = self.stream.take() else {
                    return Ok(None);
                };
                let (success, tail) = stream.wait();
                let tail = self.target.redact(&tail);
                if success {
                    info!("frame source {} ended", self.target.masked());
                    return Ok(None);
                }
                warn!(
                    "ffmpeg exited mid-stream for {}: {}; reconnecting",
                    self.target.masked(),
                    tail
                );
                // A failed respawn leaves no stream; the next call reports exhaustion.
                self.restart()?;
                Err(SourceError::Read(format!("stream dropped: {}", tail)))
            }
        }
    }
}

impl Drop for FfmpegSource {
    fn drop(&mut self) {
        if let Some(stream) = self.stream.take() {
            stream.shutdown();
        }
    }
}

impl Stream {
    fn shutdown(mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
        if let Some(h) = self.reader.take() {
            let _ = h.join();
        }
    }

    fn wait(mut self) -> (bool, String) {
        let status = self.child.wait();
        if let Some(h) = self.reader.take() {
            let _ = h.join();
        }
        let lines = self
            .stderr
            .take()
            .and_then(|h| h.join().ok())
            .unwrap_or_default();
        let tail = if lines.is_empty() {
            "<no ffmpeg stderr>".to_string()
        } else {
            lines.join(" | ")
        };
        (status.map(|s| s.success()).unwrap_or(false), tail)
    }
}

/// Non-RTSP inputs (files, test sources) are paced at their native frame rate
/// when `paced` is set, so they behave like a live camera.
fn input_args(cmd: &mut Command, target: &SourceTarget, timeout: Option<Duration>, paced: bool) {
    if target.is_rtsp() {
        cmd.arg("-rtsp_transport").arg("tcp");
        if let Some(t) = timeout {
            cmd.arg("-timeout").arg(t.as_micros().to_string());
        }
    } else if paced {
        cmd.arg("-re");
    }
    cmd.arg("-i").arg(target.url());
}

fn probe_frame_size(target: &SourceTarget, timeout: Duration) -> Result<(u32, u32), SourceError> {
    let connection = |reason: String| SourceError::Connection {
        target: target.masked(),
        reason,
    };

    let mut cmd = Command::new("ffprobe");
    cmd.arg("-v").arg("error");
    input_args(&mut cmd, target, Some(timeout), false);
    cmd.arg("-select_streams")
        .arg("v:0")
        .arg("-show_entries")
        .arg("stream=width,height")
        .arg("-of")
        .arg("csv=p=0:s=x");

    let out = cmd
        .output()
        .map_err(|e| connection(format!("failed to run ffprobe: {}", e)))?;
    if !out.status.success() {
        return Err(probe_failure(target, &out.stderr));
    }
    let text = String::from_utf8_lossy(&out.stdout);
    parse_probe_size(&text).ok_or_else(|| {
        connection(format!(
            "no video stream (probe said {:?})",
            target.redact(text.trim())
        ))
    })
}

/// ffprobe echoes the input URL in its errors; credentials are masked here.
fn probe_failure(target: &SourceTarget, stderr: &[u8]) -> SourceError {
    SourceError::Connection {
        target: target.masked(),
        reason: target.redact(String::from_utf8_lossy(stderr).trim()),
    }
}

fn parse_probe_size(text: &str) -> Option<(u32, u32)> {
    let line = text.lines().map(str::trim).find(|l| !l.is_empty())?;
    let (w, h) = line.split_once('x')?;
    let w: u32 = w.trim().parse().ok()?;
    let h: u32 = h.trim().trim_end_matches('x').parse().ok()?;
    if w == 0 || h == 0 {
        return None;
    }
    Some((w, h))
}

fn spawn_stream(target: &SourceTarget, width: u32, height: u32) -> Result<Stream, SourceError> {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner").arg("-loglevel").arg("error");
    input_args(&mut cmd, target, None, true);
    cmd.arg("-an")
        .arg("-f")
        .arg("rawvideo")
        .arg("-pix_fmt")
        .arg("rgb24")
        .arg("-s")
        .arg(format!("{}x{}", width, height))
        .arg("pipe:1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd.spawn().map_err(|e| SourceError::Connection {
        target: target.masked(),
        reason: format!("failed to spawn ffmpeg: {}", e),
    })?;
    let stderr = child.stderr.take().map(spawn_stderr_collector);
    let Some(stdout) = child.stdout.take() else {
        let _ = child.kill();
        return Err(SourceError::Read("ffmpeg stdout missing".to_string()));
    };

    let frame_bytes = (width as usize) * (height as usize) * 3;
    let (tx, rx) = bounded::<Vec<u8>>(1);
    let evict = rx.clone();
    let reader = std::thread::spawn(move || read_frames(stdout, frame_bytes, tx, evict));
    debug!("spawned ffmpeg pid={} for {}", child.id(), target.masked());

    Ok(Stream {
        child,
        frames: rx,
        reader: Some(reader),
        stderr,
    })
}

/// Keeps only the newest decoded frame queued, so a slow consumer always sees
/// a fresh picture instead of a backlog.
fn read_frames(
    mut stdout: impl Read,
    frame_bytes: usize,
    tx: Sender<Vec<u8>>,
    evict: Receiver<Vec<u8>>,
) {
    loop {
        let mut buf = vec![0u8; frame_bytes];
        let n = match read_exact_or_eof(&mut stdout, &mut buf) {
            Ok(n) => n,
            Err(_) => break,
        };
        if n < frame_bytes {
            break;
        }
        let mut pending = buf;
        loop {
            match tx.try_send(pending) {
                Ok(()) => break,
                Err(TrySendError::Full(back)) => {
                    let _ = evict.try_recv();
                    pending = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
}

fn read_exact_or_eof(r: &mut impl Read, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut got = 0usize;
    while got < buf.len() {
        let n = r.read(&mut buf[got..])?;
        if n == 0 {
            return Ok(got);
        }
        got += n;
    }
    Ok(got)
}

fn spawn_stderr_collector(stderr: impl Read + Send + 'static) -> JoinHandle<Vec<String>> {
    std::thread::spawn(move || {
        let mut lines = VecDeque::new();
        let mut reader = BufReader::new(stderr);
        let mut line = String::new();

        loop {
            line.clear();
            let read = reader.read_line(&mut line).unwrap_or(0);
            if read == 0 {
                break;
            }
            let cleaned = line.trim().to_string();
            if cleaned.is_empty() {
                continue;
            }
            lines.push_back(cleaned);
            if lines.len() > 20 {
                lines.pop_front();
            }
        }

        lines.into_iter().collect::<Vec<_>>()
    })
}
