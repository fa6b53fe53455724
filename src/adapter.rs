//! Mirror adapter contract.
//!
//! Adapters map a logical resource path to a concrete request for one
//! mirror protocol. Anything protocol-specific — request signing for
//! object storage, token exchange for registries — lives behind this
//! trait; the core only ever sees the three operations below and treats
//! all adapters polymorphically. The in-tree [`HttpAdapter`] covers plain
//! HTTP(S) mirrors; the other protocols implement the same trait out of
//! tree.

use crate::error::DownloadResult;
use crate::mirror::Mirror;
use crate::transport::Request;

/// Attempt outcome reported to the adapter, so it can maintain its own
/// credential or backoff state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Success,
    /// The attempt failed in a way worth retrying (transport error, 5xx).
    TransientFailure,
    /// The attempt failed in a way that retrying on this mirror will not
    /// fix (4xx, auth rejection, verification failure).
    FatalFailure,
}

/// The narrow contract a mirror protocol exposes to the core.
pub trait MirrorAdapter: Send + Sync {
    /// Produce the concrete request for fetching `path` from `mirror`.
    ///
    /// May perform an out-of-band preparatory exchange (token acquisition,
    /// signed-URL computation). The core calls this at most once per
    /// attempt, before handing the request to the transfer client; resume
    /// offsets are added by the core afterwards.
    fn prepare(&self, mirror: &Mirror, path: &str) -> DownloadResult<Request>;

    /// Cheap test for whether [`prepare`](Self::prepare) must be called
    /// again, letting the core reuse a previously prepared request while a
    /// cached credential is still valid.
    fn needs_preparation(&self, _mirror: &Mirror, _path: &str) -> bool {
        true
    }

    /// Notification that an attempt finished, whatever the outcome.
    fn on_transfer_complete(&self, _mirror: &Mirror, _path: &str, _outcome: TransferOutcome) {}
}

/// Adapter for plain HTTP(S) mirrors: base URL + path, optional fixed
/// headers, no preparation state.
#[derive(Debug, Default)]
pub struct HttpAdapter {
    headers: Vec<(String, String)>,
}

impl HttpAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a header to every request (e.g. a User-Agent some origins
    /// insist on).
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

impl MirrorAdapter for HttpAdapter {
    fn prepare(&self, mirror: &Mirror, path: &str) -> DownloadResult<Request> {
        let mut request = Request::new(mirror.url_for(path));
        request.headers = self.headers.clone();
        Ok(request)
    }

    fn needs_preparation(&self, _mirror: &Mirror, _path: &str) -> bool {
        // Stateless: a prepared request never goes stale.
        false
    }
}
