use std::path::PathBuf;
use thiserror::Error;

/// Failures reported by a frame source.
#[derive(Debug, Error)]
pub enum SourceError {
    /// Source unreachable at open time. Fatal, no frames are attempted.
    #[error("could not connect to frame source {target}: {reason}")]
    Connection { target: String, reason: String },

    /// A read failed mid-session. Transient.
    #[error("frame read failed: {0}")]
    Read(String),

    /// No frame arrived within the read timeout. Transient.
    #[error("no frame received within {0:?}")]
    Timeout(std::time::Duration),
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        !matches!(self, SourceError::Connection { .. })
    }
}

/// Failures of the classification store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The persisted document exists but cannot be parsed. Never replaced
    /// with an empty store.
    #[error("classification store {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("classification store {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid classification entry: {0}")]
    Invalid(String),
}
