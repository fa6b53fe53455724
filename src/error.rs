//! Error types for the download engine.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::checksum::ChecksumAlgorithm;

/// Result type for download operations.
pub type DownloadResult<T> = Result<T, DownloadError>;

/// Errors that can occur while driving a download to completion.
///
/// The engine never raises out-of-band: every failure ends up here, attached
/// to the target that suffered it and aggregated into the return value of
/// [`Downloader::download`](crate::Downloader::download).
#[derive(Debug, Error)]
pub enum DownloadError {
    /// Local filesystem failure (open/write/rename). Fatal for the target;
    /// no mirror switch can help.
    #[error("I/O error at {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Transport-level failure (connect, timeout, mid-stream read).
    #[error("transport error for {url}: {reason}")]
    Transport { url: String, reason: String },

    /// The server answered with a non-success HTTP status.
    #[error("HTTP {status} from {url}")]
    HttpStatus { status: u16, url: String },

    /// The transfer produced a different byte count than declared.
    #[error("size mismatch for {}: expected {expected}, got {actual}", .path.display())]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },

    /// A streaming digest did not match its declared value.
    #[error("{algorithm} mismatch for {}: expected {expected}, got {actual}", .path.display())]
    ChecksumMismatch {
        path: PathBuf,
        algorithm: ChecksumAlgorithm,
        expected: String,
        actual: String,
    },

    /// Every mirror in the namespace has been tried and failed.
    #[error("all mirrors exhausted for {path}")]
    MirrorsExhausted { path: String },

    /// The target burned through its total retry budget.
    #[error("retry budget exhausted for {path} after {retries} attempts")]
    RetriesExhausted { path: String, retries: u32 },

    /// No mirror list was registered for the target's namespace.
    #[error("unknown mirror namespace {0:?}")]
    UnknownNamespace(String),

    /// No adapter was registered for the mirror's protocol.
    #[error("no adapter registered for protocol {0}")]
    MissingAdapter(&'static str),

    /// The caller requested shutdown while the transfer was in flight.
    #[error("download cancelled")]
    Cancelled,
}

impl DownloadError {
    /// Convenience constructor for local I/O failures.
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
