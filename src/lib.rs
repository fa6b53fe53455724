//! mirrorfetch - resilient multi-mirror download engine
//!
//! This library drives batches of downloads to completion across sets of
//! equivalent mirrors, tolerating per-mirror failures, transient network
//! errors, partial transfers, and checksum mismatches.
//!
//! # Architecture
//!
//! ```text
//! DownloadTarget ──► Downloader (scheduler)
//!                        │  admit / drive / dispatch
//!                        ├── MirrorMap ── Mirror (stats, backoff, caps)
//!                        ├── MirrorAdapter (prepare, outcome feedback)
//!                        ├── TransferClient ── Transport (byte streams)
//!                        └── Target state machine ── DigestSet
//! ```
//!
//! Each target walks Waiting → Preparing → Running → Finished/Failed:
//! mirror selection prefers origins with the best recent record, transfers
//! resume over byte ranges when the caller allows it, bytes are digested
//! as they land on disk, and only a fully verified file is renamed into
//! place.
//!
//! # Example
//!
//! ```no_run
//! use mirrorfetch::{
//!     Checksum, DownloadTarget, Downloader, DownloaderConfig, Mirror, MirrorMap,
//! };
//!
//! let mut mirror_map = MirrorMap::new();
//! mirror_map.insert(
//!     "conda-forge",
//!     vec![
//!         Mirror::new("https://conda.anaconda.org/conda-forge"),
//!         Mirror::new("https://mirror.example.org/conda-forge"),
//!     ],
//! );
//!
//! let mut downloader = Downloader::new(DownloaderConfig::default())?;
//! downloader.set_mirror_map(mirror_map);
//! downloader.add(
//!     DownloadTarget::new("linux-64/xtensor-0.24.tar.bz2", "conda-forge", "xtensor.tar.bz2")
//!         .with_resume(true)
//!         .with_checksum(Checksum::sha256("0123...")),
//! );
//!
//! let all_finished = downloader.download();
//! # Ok::<(), mirrorfetch::DownloadError>(())
//! ```

pub mod adapter;
pub mod checksum;
pub mod config;
pub mod error;
pub mod mirror;
pub mod scheduler;
pub mod target;
pub mod transfer;
pub mod transport;

pub use adapter::{HttpAdapter, MirrorAdapter, TransferOutcome};
pub use checksum::{Checksum, ChecksumAlgorithm, ChecksumFailure, DigestSet};
pub use config::DownloaderConfig;
pub use error::{DownloadError, DownloadResult};
pub use mirror::{Mirror, MirrorMap, MirrorProtocol, MirrorStats};
pub use scheduler::{CancelToken, Downloader};
pub use target::{
    DownloadTarget, EndCallback, ProgressCallback, TargetState, TransferResult, TransferStatus,
};
pub use transfer::{Completion, TransferClient, TransferEvent, TransferHandle};
pub use transport::{
    ReqwestTransport, Request, ResponseHead, StreamControl, StreamSink, Transport, TransportError,
};
