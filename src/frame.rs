use anyhow::{Context, Result};
use chrono::{DateTime, TimeZone};
use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

pub const PREFIX: &str = "round_";
pub const EXTENSION: &str = ".jpg";
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Identity of a saved frame, carried entirely by its file name:
/// `round_<round_id>_<frame_number>_<YYYYMMDD_HHMMSS>.jpg`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FrameName {
    pub round_id: u64,
    pub frame_number: u64,
    /// Informational only. Early captures wrote Unix milliseconds here.
    pub timestamp: String,
}

impl FrameName {
    pub fn new<Tz: TimeZone>(round_id: u64, frame_number: u64, at: &DateTime<Tz>) -> Self
    where
        Tz::Offset: fmt::Display,
    {
        Self {
            round_id,
            frame_number,
            timestamp: at.format(TIMESTAMP_FORMAT).to_string(),
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}{}_{}_{}{}",
            PREFIX, self.round_id, self.frame_number, self.timestamp, EXTENSION
        )
    }

    pub fn parse(file_name: &str) -> Option<FrameName> {
        let stem = file_name.strip_prefix(PREFIX)?.strip_suffix(EXTENSION)?;
        let mut parts = stem.splitn(3, '_');
        let round_id = parse_digits(parts.next()?)?;
        let frame_number = parse_digits(parts.next()?)?;
        let timestamp = parts.next()?;
        if !valid_timestamp(timestamp) {
            return None;
        }
        Some(FrameName {
            round_id,
            frame_number,
            timestamp: timestamp.to_string(),
        })
    }

    /// Ordering key used to lay frames out for labeling.
    pub fn sort_key(&self) -> (u64, u64) {
        (self.round_id, self.frame_number)
    }
}

impl fmt::Display for FrameName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Round id embedded in any `round_<n>_*.jpg` name, even when the rest of the
/// name is malformed. Used when guarding against round reuse.
pub fn round_prefix(file_name: &str) -> Option<u64> {
    let rest = file_name.strip_prefix(PREFIX)?;
    if !rest.ends_with(EXTENSION) {
        return None;
    }
    let (digits, _) = rest.split_once('_')?;
    parse_digits(digits)
}

#[derive(Debug, Clone)]
pub struct FrameFile {
    pub name: FrameName,
    pub path: PathBuf,
}

/// Frame files directly inside `dir`, sorted by round then frame number.
pub fn scan_frames(dir: &Path) -> Result<Vec<FrameFile>> {
    let mut frames = vec![];
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let e = entry.with_context(|| format!("scan frames in {}", dir.display()))?;
        if !e.file_type().is_file() {
            continue;
        }
        let Some(name) = e.file_name().to_str().and_then(FrameName::parse) else {
            continue;
        };
        frames.push(FrameFile {
            name,
            path: e.path().to_path_buf(),
        });
    }
    frames.sort_by(|a, b| {
        a.name
            .sort_key()
            .cmp(&b.name.sort_key())
            .then_with(|| a.name.timestamp.cmp(&b.name.timestamp))
    });
    Ok(frames)
}

fn parse_digits(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn valid_timestamp(ts: &str) -> bool {
    match ts.split_once('_') {
        Some((date, time)) => {
            date.len() == 8
                && time.len() == 6
                && date.bytes().all(|b| b.is_ascii_digit())
                && time.bytes().all(|b| b.is_ascii_digit())
        }
        None => parse_digits(ts).is_some(),
    }
}
