use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::frame;
use crate::util;

/// Picks and persists the round id that namespaces one capture session.
#[derive(Debug, Clone)]
pub struct RoundTracker {
    state_file: PathBuf,
    image_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundDecision {
    pub next: u64,
    pub persisted: Option<u64>,
    pub scanned_max: Option<u64>,
}

impl RoundTracker {
    pub fn new(state_file: impl Into<PathBuf>, image_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_file: state_file.into(),
            image_dir: image_dir.into(),
        }
    }

    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    pub fn next_round_id(&self) -> u64 {
        self.decide().next
    }

    /// The next id is strictly greater than both the persisted value and every
    /// round already present on disk. A missing or unreadable state file falls
    /// back to the directory scan alone.
    pub fn decide(&self) -> RoundDecision {
        let persisted = self.read_state();
        let scanned_max = self.scan_max_round();

        let candidate = persisted.map(|r| r.saturating_add(1)).unwrap_or(0);
        let from_disk = scanned_max.map(|r| r.saturating_add(1)).unwrap_or(0);
        let next = candidate.max(from_disk);

        info!(
            "round decision: next={} state={} scanned_max={}",
            next,
            persisted.map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
            scanned_max.map(|r| r.to_string()).unwrap_or_else(|| "-".into()),
        );
        RoundDecision {
            next,
            persisted,
            scanned_max,
        }
    }

    /// Written after every session, including zero-frame ones, so the next run
    /// always advances.
    pub fn persist(&self, round_id: u64) -> Result<()> {
        util::write_atomic(&self.state_file, round_id.to_string().as_bytes())
            .with_context(|| format!("write round state {}", self.state_file.display()))?;
        debug!("persisted round {} to {}", round_id, self.state_file.display());
        Ok(())
    }

    fn read_state(&self) -> Option<u64> {
        let raw = match std::fs::read_to_string(&self.state_file) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(
                    "round state {} not found, relying on frame names",
                    self.state_file.display()
                );
                return None;
            }
            Err(e) => {
                warn!(
                    "could not read round state {}: {}",
                    self.state_file.display(),
                    e
                );
                return None;
            }
        };
        match raw.trim().parse::<u64>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(
                    "round state {} holds {:?}, ignoring it",
                    self.state_file.display(),
                    raw.trim()
                );
                None
            }
        }
    }

    fn scan_max_round(&self) -> Option<u64> {
        if !self.image_dir.is_dir() {
            return None;
        }
        WalkDir::new(&self.image_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().and_then(frame::round_prefix))
            .max()
    }
}
