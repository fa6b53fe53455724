//! The download scheduler.
//!
//! [`Downloader`] owns the targets, the mirror map, the adapter registry,
//! and one transfer client, and drives everything from a single logical
//! thread of control:
//!
//! ```text
//! ┌─► admit: promote Waiting targets (global cap, per-mirror cap,
//! │          adapter prepare, resume offset) into the transfer client
//! │
//! ├─► drive: TransferClient::perform routes head/body events into the
//! │          owning target's state machine
//! │
//! └─► dispatch: apply the completed attempt's verdict — finish, re-queue
//!              at the tail, or fail — plus mirror accounting, backoff,
//!              and adapter notification
//! ```
//!
//! I/O concurrency lives inside the transfer client's workers; every state
//! transition, mirror counter, and digest update happens here, so none of
//! them needs a lock.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crate::adapter::{HttpAdapter, MirrorAdapter};
use crate::config::DownloaderConfig;
use crate::error::{DownloadError, DownloadResult};
use crate::mirror::{select_mirror, MirrorMap, MirrorProtocol, MirrorSelection};
use crate::target::{
    AttemptVerdict, DownloadTarget, MirrorEffect, Target, TargetState, TransferResult,
    TransferStatus,
};
use crate::transfer::{Completion, TransferClient, TransferEvent, TransferHandle};
use crate::transport::{ReqwestTransport, StreamControl, Transport};

/// Upper bound on one backoff sleep, so cancellation stays responsive
/// while every mirror is rate-limited.
const MAX_IDLE_SLEEP: Duration = Duration::from_millis(200);

/// Fallback tick when no retry deadline is known.
const IDLE_TICK: Duration = Duration::from_millis(50);

/// Cloneable cancellation signal for a running [`Downloader`].
///
/// Cancelling stops admission, aborts all active transfers, and fails the
/// remaining targets with [`DownloadError::Cancelled`]. Partial files stay
/// on disk for future resume.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Drives a batch of download targets to completion across their mirrors.
pub struct Downloader {
    config: DownloaderConfig,
    transport: Arc<dyn Transport>,
    adapters: HashMap<MirrorProtocol, Arc<dyn MirrorAdapter>>,
    mirror_map: MirrorMap,
    targets: Vec<Target>,
    cancel: CancelToken,
}

impl Downloader {
    /// Create a downloader backed by the production HTTP transport.
    pub fn new(config: DownloaderConfig) -> DownloadResult<Self> {
        let transport = ReqwestTransport::new(config.timeout).map_err(|e| {
            DownloadError::Transport {
                url: String::new(),
                reason: e.to_string(),
            }
        })?;
        Ok(Self::with_transport(Arc::new(transport), config))
    }

    /// Create a downloader over a caller-supplied transport. Tests use
    /// this to substitute scripted transports.
    pub fn with_transport(transport: Arc<dyn Transport>, config: DownloaderConfig) -> Self {
        let mut adapters: HashMap<MirrorProtocol, Arc<dyn MirrorAdapter>> = HashMap::new();
        adapters.insert(MirrorProtocol::Http, Arc::new(HttpAdapter::new()));
        Self {
            config,
            transport,
            adapters,
            mirror_map: MirrorMap::new(),
            targets: Vec::new(),
            cancel: CancelToken::new(),
        }
    }

    /// Provide the namespace → mirror-list map.
    pub fn set_mirror_map(&mut self, map: MirrorMap) {
        self.mirror_map = map;
    }

    /// Register the adapter serving a mirror protocol, replacing any
    /// previous registration.
    pub fn set_adapter(&mut self, protocol: MirrorProtocol, adapter: Arc<dyn MirrorAdapter>) {
        self.adapters.insert(protocol, adapter);
    }

    /// Register a download target.
    pub fn add(&mut self, target: DownloadTarget) {
        self.targets.push(Target::new(target));
    }

    /// Handle for requesting shutdown, usable from any thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Request shutdown of a running batch. Equivalent to cancelling the
    /// token from [`Self::cancel_token`].
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Mirrors registered for a namespace, for post-run inspection of
    /// counters and backoff state.
    pub fn mirrors(&self, namespace: &str) -> Option<&[crate::mirror::Mirror]> {
        self.mirror_map.get(namespace)
    }

    /// Terminal results, in registration order, for targets that reached a
    /// terminal state.
    pub fn results(&self) -> Vec<(&DownloadTarget, &TransferResult)> {
        self.targets
            .iter()
            .filter_map(|t| t.result.as_ref().map(|r| (&t.desc, r)))
            .collect()
    }

    /// Run every registered target to a terminal state.
    ///
    /// Returns `true` iff every target finished and verified.
    pub fn download(&mut self) -> bool {
        let mut client = TransferClient::new(Arc::clone(&self.transport));
        let mut running: HashMap<TransferHandle, usize> = HashMap::new();
        let mut queue: VecDeque<usize> = (0..self.targets.len()).collect();

        tracing::info!(targets = self.targets.len(), "starting download batch");

        loop {
            if self.cancel.is_cancelled() {
                self.cancel_all(&mut client, &mut running);
                break;
            }

            self.admit(&mut client, &mut running, &mut queue);

            if client.active_count() == 0 {
                if self.targets.iter().all(Target::is_terminal) {
                    break;
                }
                // Every admissible target is waiting out a mirror backoff.
                self.idle_sleep();
                continue;
            }

            let completion = {
                let targets = &mut self.targets;
                let cancel = &self.cancel;
                client.perform(|handle, event| {
                    if cancel.is_cancelled() {
                        return StreamControl::Abort;
                    }
                    let Some(&index) = running.get(&handle) else {
                        return StreamControl::Abort;
                    };
                    match event {
                        TransferEvent::Head(head) => targets[index].on_head(head),
                        TransferEvent::Body(chunk) => targets[index].on_body(chunk),
                    }
                })
            };

            if let Some(completion) = completion {
                self.dispatch(completion, &mut running, &mut queue);
            }
        }

        self.targets
            .iter()
            .all(|t| t.state == TargetState::Finished)
    }

    /// Promote Waiting targets into the transfer client, oldest first,
    /// until the global cap is reached. Targets that cannot run right now
    /// re-enter the queue at the tail.
    fn admit(
        &mut self,
        client: &mut TransferClient,
        running: &mut HashMap<TransferHandle, usize>,
        queue: &mut VecDeque<usize>,
    ) {
        let now = Instant::now();

        for _ in 0..queue.len() {
            if client.active_count() >= self.config.max_parallel_downloads {
                break;
            }
            let Some(index) = queue.pop_front() else {
                break;
            };
            if self.targets[index].state != TargetState::Waiting {
                continue;
            }

            let namespace = self.targets[index].desc.mirror_namespace.clone();
            let Some(mirrors) = self.mirror_map.get_mut(&namespace) else {
                self.targets[index].complete(
                    TransferStatus::Failed,
                    Some(DownloadError::UnknownNamespace(namespace)),
                );
                continue;
            };

            // A sticky retry (transient error, range downgrade, credential
            // refresh) reuses the current mirror when it is still usable.
            let selection = {
                let target = &self.targets[index];
                let sticky = target
                    .sticky_mirror
                    .then_some(target.current_mirror)
                    .flatten()
                    .filter(|mi| {
                        let mirror = &mirrors[*mi];
                        !target.tried_mirrors.contains(mi)
                            && !mirror.is_rate_limited(now)
                            && mirror.running_transfers() < mirror.allowed_parallel_connections()
                    });
                match sticky {
                    Some(mi) => MirrorSelection::Selected(mi),
                    None => select_mirror(mirrors, &target.tried_mirrors, now),
                }
            };
            let mirror_index = match selection {
                MirrorSelection::Selected(mirror_index) => mirror_index,
                MirrorSelection::Busy => {
                    queue.push_back(index);
                    continue;
                }
                MirrorSelection::Exhausted => {
                    let target = &mut self.targets[index];
                    tracing::warn!(path = %target.desc.path, "all mirrors exhausted");
                    target.complete(
                        TransferStatus::Failed,
                        Some(DownloadError::MirrorsExhausted {
                            path: target.desc.path.clone(),
                        }),
                    );
                    continue;
                }
            };

            let target = &mut self.targets[index];
            target.sticky_mirror = false;
            if target.current_mirror != Some(mirror_index) {
                target.retries_on_current_mirror = 0;
            }
            target.current_mirror = Some(mirror_index);
            target.state = TargetState::Preparing;

            let mirror = &mirrors[mirror_index];
            let Some(adapter) = self.adapters.get(&mirror.protocol()) else {
                target.complete(
                    TransferStatus::Failed,
                    Some(DownloadError::MissingAdapter(mirror.protocol().name())),
                );
                continue;
            };

            // Reuse the prepared request while the adapter's credential
            // state is still valid; otherwise prepare afresh.
            let cached = target
                .prepared
                .as_ref()
                .filter(|(prepared_for, _)| {
                    *prepared_for == mirror_index
                        && !adapter.needs_preparation(mirror, &target.desc.path)
                })
                .map(|(_, request)| request.clone());

            let mut request = match cached {
                Some(request) => request,
                None => match adapter.prepare(mirror, &target.desc.path) {
                    Ok(request) => {
                        target.prepared = Some((mirror_index, request.clone()));
                        request
                    }
                    Err(error) => {
                        // prepare_fail: burn this mirror for the target
                        // and re-queue.
                        tracing::warn!(
                            path = %target.desc.path,
                            mirror = %mirror.base_url(),
                            error = %error,
                            "adapter preparation failed"
                        );
                        target.note_failure(error);
                        target.tried_mirrors.insert(mirror_index);
                        mirrors[mirror_index].record_failure();
                        retry_or_fail(target, &self.config);
                        if target.state == TargetState::Waiting {
                            queue.push_back(index);
                        }
                        continue;
                    }
                },
            };

            if let Err(error) = target.begin_attempt() {
                // Local I/O trouble; no mirror can fix it.
                target.complete(TransferStatus::Failed, Some(error));
                continue;
            }
            if target.original_offset > 0 {
                request.range_start = Some(target.original_offset);
            }

            let handle = client.add(request);
            target.state = TargetState::Running;
            mirrors[mirror_index].transfer_started(now);
            running.insert(handle, index);

            tracing::debug!(
                path = %target.desc.path,
                mirror = %mirrors[mirror_index].base_url(),
                offset = target.original_offset,
                "transfer admitted"
            );
        }
    }

    /// Route a completed attempt back into the owning target and apply the
    /// resulting transition.
    fn dispatch(
        &mut self,
        completion: Completion,
        running: &mut HashMap<TransferHandle, usize>,
        queue: &mut VecDeque<usize>,
    ) {
        let Some(index) = running.remove(&completion.handle) else {
            return;
        };

        let target = &mut self.targets[index];
        let namespace = target.desc.mirror_namespace.clone();
        let mirror_index = target.current_mirror;

        if let (Some(mirror_index), Some(mirrors)) =
            (mirror_index, self.mirror_map.get_mut(&namespace))
        {
            mirrors[mirror_index].transfer_ended();
        }

        if self.cancel.is_cancelled() {
            target.close_attempt();
            target.complete(TransferStatus::Failed, Some(DownloadError::Cancelled));
            return;
        }

        let evaluation = target.evaluate(completion.result, &self.config);

        if let (Some(mirror_index), Some(mirrors)) =
            (mirror_index, self.mirror_map.get_mut(&namespace))
        {
            let mirror = &mut mirrors[mirror_index];
            match evaluation.mirror_effect {
                MirrorEffect::Success => mirror.record_success(),
                MirrorEffect::Failure => mirror.record_failure(),
                MirrorEffect::SoftFailure => mirror.record_soft_failure(
                    Instant::now(),
                    self.config.backoff_base,
                    self.config.backoff_cap,
                ),
                MirrorEffect::Neutral => {}
            }
            if let Some(adapter) = self.adapters.get(&mirror.protocol()) {
                adapter.on_transfer_complete(mirror, &target.desc.path, evaluation.adapter_outcome);
            }
        }

        match evaluation.verdict {
            AttemptVerdict::Finished => {
                target.complete(TransferStatus::Finished, None);
            }
            AttemptVerdict::RetrySameMirror => {
                target.sticky_mirror = true;
                retry_or_fail(target, &self.config);
                if target.state == TargetState::Waiting {
                    queue.push_back(index);
                }
            }
            AttemptVerdict::RetryAnotherMirror { mark_tried } => {
                if mark_tried {
                    if let Some(mirror_index) = mirror_index {
                        target.tried_mirrors.insert(mirror_index);
                    }
                }
                target.sticky_mirror = false;
                target.current_mirror = None;
                target.prepared = None;
                retry_or_fail(target, &self.config);
                if target.state == TargetState::Waiting {
                    queue.push_back(index);
                }
            }
            AttemptVerdict::Fatal(error) => {
                tracing::warn!(path = %target.desc.path, error = %error, "target failed");
                target.complete(TransferStatus::Failed, Some(error));
            }
        }
    }

    /// Abort every active transfer and fail all remaining targets with
    /// [`DownloadError::Cancelled`]. Partials stay on disk.
    fn cancel_all(
        &mut self,
        client: &mut TransferClient,
        running: &mut HashMap<TransferHandle, usize>,
    ) {
        tracing::info!("cancellation requested, aborting active transfers");
        client.abort_all();

        while let Some(completion) = client.perform(|_, _| StreamControl::Abort) {
            let Some(index) = running.remove(&completion.handle) else {
                continue;
            };
            let target = &mut self.targets[index];
            let namespace = target.desc.mirror_namespace.clone();
            if let (Some(mirror_index), Some(mirrors)) =
                (target.current_mirror, self.mirror_map.get_mut(&namespace))
            {
                mirrors[mirror_index].transfer_ended();
            }
            target.close_attempt();
            target.complete(TransferStatus::Failed, Some(DownloadError::Cancelled));
        }

        for target in &mut self.targets {
            if !target.is_terminal() {
                target.complete(TransferStatus::Failed, Some(DownloadError::Cancelled));
            }
        }
    }

    /// Sleep until the earliest mirror retry deadline (bounded, so a
    /// cancel from another thread is noticed promptly).
    fn idle_sleep(&self) {
        let now = Instant::now();
        let delay = self
            .mirror_map
            .earliest_retry(now)
            .map(|deadline| deadline - now)
            .unwrap_or(IDLE_TICK)
            .min(MAX_IDLE_SLEEP);
        thread::sleep(delay);
    }
}

impl std::fmt::Debug for Downloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Downloader")
            .field("config", &self.config)
            .field("targets", &self.targets.len())
            .field("namespaces", &self.mirror_map.iter().count())
            .finish_non_exhaustive()
    }
}

/// Spend one unit of the retry budget; fail the target if it is gone.
fn retry_or_fail(target: &mut Target, config: &DownloaderConfig) {
    target.retries += 1;
    if target.retries > config.max_retries {
        let retries = target.retries;
        let error = target
            .take_last_error()
            .unwrap_or_else(|| DownloadError::RetriesExhausted {
                path: target.desc.path.clone(),
                retries,
            });
        tracing::warn!(
            path = %target.desc.path,
            retries,
            "retry budget exhausted"
        );
        target.complete(TransferStatus::Failed, Some(error));
    } else {
        target.state = TargetState::Waiting;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mirror::Mirror;
    use crate::transport::{Request, StreamSink, TransportError};
    use tempfile::TempDir;

    /// Transport that refuses everything with a connect error.
    struct DeadTransport;

    impl Transport for DeadTransport {
        fn fetch(
            &self,
            _request: &Request,
            _sink: &mut dyn StreamSink,
        ) -> Result<(), TransportError> {
            Err(TransportError::Connect("no route".into()))
        }
    }

    fn test_config() -> DownloaderConfig {
        DownloaderConfig {
            retries_per_mirror: 0,
            backoff_base: Duration::from_millis(1),
            backoff_cap: Duration::from_millis(2),
            ..Default::default()
        }
    }

    #[test]
    fn test_empty_batch_succeeds() {
        let mut downloader = Downloader::with_transport(Arc::new(DeadTransport), test_config());
        assert!(downloader.download());
    }

    #[test]
    fn test_unknown_namespace_fails_target() {
        let temp = TempDir::new().unwrap();
        let mut downloader = Downloader::with_transport(Arc::new(DeadTransport), test_config());
        downloader.add(DownloadTarget::new("a", "nowhere", temp.path().join("a")));

        assert!(!downloader.download());
        let results = downloader.results();
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0].1.error,
            Some(DownloadError::UnknownNamespace(_))
        ));
    }

    #[test]
    fn test_dead_transport_exhausts_mirrors() {
        let temp = TempDir::new().unwrap();
        let mut downloader = Downloader::with_transport(Arc::new(DeadTransport), test_config());

        let mut map = MirrorMap::new();
        map.insert("ns", vec![Mirror::new("http://m1"), Mirror::new("http://m2")]);
        downloader.set_mirror_map(map);
        downloader.add(DownloadTarget::new("a", "ns", temp.path().join("a")));

        assert!(!downloader.download());
        let results = downloader.results();
        // Both mirrors were tried before the terminal failure.
        let mirrors = downloader.mirrors("ns").unwrap();
        assert_eq!(mirrors[0].failed_transfers(), 1);
        assert_eq!(mirrors[1].failed_transfers(), 1);
        assert!(results[0].1.error.is_some());
    }

    #[test]
    fn test_cancel_before_run_fails_everything() {
        let temp = TempDir::new().unwrap();
        let mut downloader = Downloader::with_transport(Arc::new(DeadTransport), test_config());
        let mut map = MirrorMap::new();
        map.insert("ns", vec![Mirror::new("http://m1")]);
        downloader.set_mirror_map(map);
        downloader.add(DownloadTarget::new("a", "ns", temp.path().join("a")));
        downloader.add(DownloadTarget::new("b", "ns", temp.path().join("b")));

        downloader.cancel_token().cancel();
        assert!(!downloader.download());

        for (_, result) in downloader.results() {
            assert!(matches!(result.error, Some(DownloadError::Cancelled)));
        }
    }
}
