//! Download targets and the per-target state machine.
//!
//! A [`DownloadTarget`] describes what the caller wants: a logical path in
//! a mirror namespace, a destination, optional size and checksum
//! declarations, and a resume flag. The runtime [`Target`] wraps one
//! descriptor and carries everything a single download needs to survive
//! partial failure: the mirror it is on, the mirrors it has burned, the
//! byte offset it started at, streaming digest contexts, and the sticky
//! flags that downgrade resume after a range refusal or a verification
//! failure.
//!
//! # State machine
//!
//! ```text
//! Waiting ──select_mirror──▶ Preparing ──prepare_ok──▶ Running
//!    ▲                           │                       │
//!    │                           └──prepare_fail──┐      │
//!    │                                            ▼      ▼
//!    └──────────retryable_failure──────────(evaluate outcome)
//!                                                  │
//!                                        fatal ────┴──▶ Failed
//!                                      success ───────▶ Finished
//! ```
//!
//! Header and body events are applied on the scheduler thread; the
//! completion evaluation turns the attempt's observations into a verdict
//! (finish, retry same mirror, retry another mirror, fail) plus the mirror
//! and adapter effects the scheduler must apply.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;

use crate::adapter::TransferOutcome;
use crate::checksum::{Checksum, DigestSet};
use crate::config::DownloaderConfig;
use crate::error::DownloadError;
use crate::transport::{Request, ResponseHead, StreamControl, TransportError};

/// Progress observer: `(total_expected_or_unknown, bytes_this_attempt)`.
///
/// Invoked at write boundaries; must not block or re-enter the downloader.
pub type ProgressCallback = Box<dyn FnMut(Option<u64>, u64) + Send>;

/// End observer, invoked exactly once when the target reaches a terminal
/// state.
pub type EndCallback = Box<dyn FnMut(&TransferResult) + Send>;

/// Suffix appended to the destination path while a transfer is in flight.
const PARTIAL_SUFFIX: &str = ".partial";

/// Terminal status of one target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Finished,
    Failed,
}

/// What a target ended as, handed to the end callback and retained for
/// [`Downloader::results`](crate::Downloader::results).
#[derive(Debug)]
pub struct TransferResult {
    pub status: TransferStatus,
    /// HTTP status of the last attempt, when one was observed.
    pub http_status: Option<u16>,
    /// URL of the last attempt, after redirects.
    pub final_url: Option<String>,
    /// Bytes of the assembled file (on success) or of the last attempt's
    /// progress (on failure).
    pub bytes_transferred: u64,
    /// The error that terminated the target, absent on success.
    pub error: Option<DownloadError>,
}

impl TransferResult {
    pub fn is_success(&self) -> bool {
        self.status == TransferStatus::Finished
    }
}

/// One desired download, immutable during transfer.
pub struct DownloadTarget {
    /// Logical resource path within the mirror namespace.
    pub path: String,
    /// Key into the mirror map.
    pub mirror_namespace: String,
    /// Where the verified file ends up.
    pub destination: PathBuf,
    /// When set, a transfer producing any other byte count fails.
    pub expected_size: Option<u64>,
    /// All declared checksums must verify.
    pub checksums: Vec<Checksum>,
    /// Continue from an existing partial file when possible.
    pub resume: bool,
    pub(crate) progress_callback: Option<ProgressCallback>,
    pub(crate) end_callback: Option<EndCallback>,
}

impl DownloadTarget {
    pub fn new(
        path: impl Into<String>,
        mirror_namespace: impl Into<String>,
        destination: impl Into<PathBuf>,
    ) -> Self {
        Self {
            path: path.into(),
            mirror_namespace: mirror_namespace.into(),
            destination: destination.into(),
            expected_size: None,
            checksums: Vec::new(),
            resume: false,
            progress_callback: None,
            end_callback: None,
        }
    }

    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn with_checksum(mut self, checksum: Checksum) -> Self {
        self.checksums.push(checksum);
        self
    }

    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn with_end_callback(mut self, callback: EndCallback) -> Self {
        self.end_callback = Some(callback);
        self
    }
}

impl fmt::Debug for DownloadTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTarget")
            .field("path", &self.path)
            .field("mirror_namespace", &self.mirror_namespace)
            .field("destination", &self.destination)
            .field("expected_size", &self.expected_size)
            .field("checksums", &self.checksums)
            .field("resume", &self.resume)
            .field("progress_callback", &self.progress_callback.is_some())
            .field("end_callback", &self.end_callback.is_some())
            .finish()
    }
}

/// Lifecycle state of a runtime target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    /// Not yet admitted, or re-queued after a retryable failure.
    Waiting,
    /// Mirror selected, adapter preparation in progress.
    Preparing,
    /// One active transfer in the transfer client.
    Running,
    /// Destination written and verified.
    Finished,
    /// Terminal failure; see the retained [`TransferResult`].
    Failed,
}

/// Why the header/write path cut an attempt short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum InterruptReason {
    /// Server answered 2xx-but-not-206 to a ranged request.
    RangeNotSupported,
    /// Announced total contradicts the declared size.
    SizeMismatch,
    /// More bytes arrived than the declared size allows.
    SizeExceeded,
    /// Non-2xx status; the error body is not worth streaming.
    HttpError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HeaderState {
    Initial,
    Done,
    Interrupted(InterruptReason),
}

/// What the scheduler should do with the target after an attempt.
#[derive(Debug)]
pub(crate) enum AttemptVerdict {
    /// Destination verified and renamed into place.
    Finished,
    /// Re-queue on the same mirror (transient error under the cap, range
    /// downgrade, one-shot credential refresh).
    RetrySameMirror,
    /// Re-queue and pick a different mirror; `mark_tried` permanently
    /// excludes the current one for this target.
    RetryAnotherMirror { mark_tried: bool },
    /// Terminal failure.
    Fatal(DownloadError),
}

/// Mirror bookkeeping the scheduler applies after an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum MirrorEffect {
    Success,
    /// Count a failure in the stats window; no retry deadline.
    Failure,
    /// Count a failure and put the mirror behind a backoff deadline.
    SoftFailure,
    /// Leave the mirror's record untouched.
    Neutral,
}

#[derive(Debug)]
pub(crate) struct Evaluation {
    pub verdict: AttemptVerdict,
    pub mirror_effect: MirrorEffect,
    pub adapter_outcome: TransferOutcome,
}

impl Evaluation {
    fn new(verdict: AttemptVerdict, mirror_effect: MirrorEffect, adapter_outcome: TransferOutcome) -> Self {
        Self {
            verdict,
            mirror_effect,
            adapter_outcome,
        }
    }
}

/// Runtime state for one in-flight [`DownloadTarget`].
pub(crate) struct Target {
    pub desc: DownloadTarget,
    pub state: TargetState,
    pub tried_mirrors: std::collections::HashSet<usize>,
    pub current_mirror: Option<usize>,
    /// Total attempts consumed, across all mirrors.
    pub retries: u32,
    /// Transient-error retries burned on the current mirror.
    pub retries_on_current_mirror: u32,
    /// Ranged attempts started on the current file.
    pub resume_count: u32,
    /// One-shot credential refresh consumed.
    pub auth_retried: bool,
    /// Next attempt must reuse `current_mirror` (transient retry, range
    /// downgrade, credential refresh).
    pub sticky_mirror: bool,
    /// Sticky: the server ignored a range request once; never range again.
    pub range_fail: bool,
    /// Sticky: a verification failure poisoned the partial; always restart
    /// from zero.
    resume_disabled: bool,
    /// Byte offset the current attempt began at.
    pub original_offset: u64,
    /// Bytes written during the current attempt.
    pub writecb_received: u64,
    pub header_state: HeaderState,
    pub http_status: Option<u16>,
    pub final_url: Option<String>,
    /// Full entity size announced by the server for this attempt.
    announced_total: Option<u64>,
    /// Request prepared for `current_mirror`, reused while the adapter
    /// reports no preparation is needed.
    pub prepared: Option<(usize, Request)>,
    digests: Option<DigestSet>,
    /// Open only while Running; closed before any rename or delete.
    writer: Option<BufWriter<File>>,
    local_error: Option<DownloadError>,
    last_error: Option<DownloadError>,
    temp_file: PathBuf,
    pub result: Option<TransferResult>,
}

impl Target {
    pub fn new(desc: DownloadTarget) -> Self {
        let mut temp = desc.destination.clone().into_os_string();
        temp.push(PARTIAL_SUFFIX);
        Self {
            desc,
            state: TargetState::Waiting,
            tried_mirrors: std::collections::HashSet::new(),
            current_mirror: None,
            retries: 0,
            retries_on_current_mirror: 0,
            resume_count: 0,
            auth_retried: false,
            sticky_mirror: false,
            range_fail: false,
            resume_disabled: false,
            original_offset: 0,
            writecb_received: 0,
            header_state: HeaderState::Initial,
            http_status: None,
            final_url: None,
            announced_total: None,
            prepared: None,
            digests: None,
            writer: None,
            local_error: None,
            last_error: None,
            temp_file: PathBuf::from(temp),
            result: None,
        }
    }

    pub fn temp_file(&self) -> &PathBuf {
        &self.temp_file
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, TargetState::Finished | TargetState::Failed)
    }

    /// Set up the next attempt: compute the effective byte offset and seed
    /// fresh digest contexts with any partial content being resumed.
    ///
    /// The partial file itself is opened lazily on the first body chunk, so
    /// an attempt that dies before its first byte neither truncates an
    /// existing partial nor litters an empty one.
    pub fn begin_attempt(&mut self) -> Result<(), DownloadError> {
        self.header_state = HeaderState::Initial;
        self.http_status = None;
        self.final_url = None;
        self.announced_total = None;
        self.writecb_received = 0;
        self.local_error = None;
        self.writer = None;

        let mut digests = DigestSet::new(&self.desc.checksums);
        let resume_allowed = self.desc.resume && !self.range_fail && !self.resume_disabled;

        let offset = if resume_allowed && self.temp_file.exists() {
            digests
                .seed_from_file(&self.temp_file)
                .map_err(|e| DownloadError::io(&self.temp_file, e))?
        } else {
            0
        };

        if offset > 0 {
            self.resume_count += 1;
            tracing::debug!(
                path = %self.desc.path,
                offset,
                resume_count = self.resume_count,
                "resuming from partial file"
            );
        }

        self.original_offset = offset;
        self.digests = Some(digests);
        Ok(())
    }

    /// Apply the response head. Runs on the scheduler thread, before any
    /// body event for the same attempt.
    pub fn on_head(&mut self, head: &ResponseHead) -> StreamControl {
        self.http_status = Some(head.status);
        self.final_url = Some(head.final_url.clone());

        if !(200..300).contains(&head.status) {
            // The error body is useless; cut the stream and let the
            // completion evaluation look at the status.
            self.header_state = HeaderState::Interrupted(InterruptReason::HttpError);
            return StreamControl::Abort;
        }

        if self.original_offset > 0 && head.status != 206 {
            // Full body to a ranged request: the server ignored the range.
            self.range_fail = true;
            self.header_state = HeaderState::Interrupted(InterruptReason::RangeNotSupported);
            tracing::debug!(
                path = %self.desc.path,
                status = head.status,
                "server ignored range request, falling back to full transfer"
            );
            return StreamControl::Abort;
        }

        // For a 206 the Content-Length covers the returned range only.
        self.announced_total = head.content_length.map(|len| self.original_offset + len);

        if let (Some(expected), Some(total)) = (self.desc.expected_size, self.announced_total) {
            if total != expected {
                self.header_state = HeaderState::Interrupted(InterruptReason::SizeMismatch);
                tracing::debug!(
                    path = %self.desc.path,
                    expected,
                    announced = total,
                    "announced size contradicts declaration"
                );
                return StreamControl::Abort;
            }
        }

        self.header_state = HeaderState::Done;
        StreamControl::Continue
    }

    /// Apply one body chunk: append to the partial file, feed the digests,
    /// enforce the declared size, and report progress.
    pub fn on_body(&mut self, chunk: &[u8]) -> StreamControl {
        if self.header_state != HeaderState::Done {
            return StreamControl::Abort;
        }

        if self.writer.is_none() {
            match self.open_writer() {
                Ok(writer) => self.writer = Some(writer),
                Err(e) => {
                    self.local_error = Some(e);
                    return StreamControl::Abort;
                }
            }
        }

        if let Some(writer) = self.writer.as_mut() {
            if let Err(e) = writer.write_all(chunk) {
                self.local_error = Some(DownloadError::io(&self.temp_file, e));
                return StreamControl::Abort;
            }
        }

        if let Some(digests) = self.digests.as_mut() {
            digests.update(chunk);
        }
        self.writecb_received += chunk.len() as u64;

        if let Some(expected) = self.desc.expected_size {
            if self.original_offset + self.writecb_received > expected {
                self.header_state = HeaderState::Interrupted(InterruptReason::SizeExceeded);
                return StreamControl::Abort;
            }
        }

        let total = self.desc.expected_size.or(self.announced_total);
        let received = self.writecb_received;
        if let Some(callback) = self.desc.progress_callback.as_mut() {
            callback(total, received);
        }

        StreamControl::Continue
    }

    fn open_writer(&mut self) -> Result<BufWriter<File>, DownloadError> {
        if let Some(parent) = self.desc.destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| DownloadError::io(parent, e))?;
            }
        }
        let file = if self.original_offset > 0 {
            OpenOptions::new().append(true).open(&self.temp_file)
        } else {
            File::create(&self.temp_file)
        }
        .map_err(|e| DownloadError::io(&self.temp_file, e))?;
        Ok(BufWriter::new(file))
    }

    /// Close the current attempt's file and digest state without judging
    /// it. Used on cancellation; the partial stays for future resume.
    pub fn close_attempt(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            let _ = writer.flush();
        }
        self.digests = None;
    }

    /// Turn the finished attempt into a verdict plus the mirror/adapter
    /// effects the scheduler must apply.
    pub fn evaluate(
        &mut self,
        transport_result: Result<(), TransportError>,
        config: &DownloaderConfig,
    ) -> Evaluation {
        // The file is closed before any rename or delete.
        if let Some(mut writer) = self.writer.take() {
            if let Err(e) = writer.flush() {
                self.local_error
                    .get_or_insert(DownloadError::io(&self.temp_file, e));
            }
        }
        let digests = self.digests.take();

        if let Some(error) = self.local_error.take() {
            // No mirror switch helps a broken local disk.
            return Evaluation::new(
                AttemptVerdict::Fatal(error),
                MirrorEffect::Neutral,
                TransferOutcome::FatalFailure,
            );
        }

        match self.header_state {
            HeaderState::Interrupted(InterruptReason::RangeNotSupported) => {
                // Downgrade to a full transfer on the same mirror; the
                // mirror itself did nothing wrong.
                return Evaluation::new(
                    AttemptVerdict::RetrySameMirror,
                    MirrorEffect::Neutral,
                    TransferOutcome::TransientFailure,
                );
            }
            HeaderState::Interrupted(InterruptReason::SizeMismatch)
            | HeaderState::Interrupted(InterruptReason::SizeExceeded) => {
                return self.verification_failure(DownloadError::SizeMismatch {
                    path: self.desc.destination.clone(),
                    expected: self.desc.expected_size.unwrap_or_default(),
                    actual: self.original_offset + self.writecb_received,
                });
            }
            HeaderState::Interrupted(InterruptReason::HttpError)
            | HeaderState::Done
            | HeaderState::Initial => {}
        }

        if let Err(error) = &transport_result {
            // An abort raised by the non-2xx header shortcut falls through
            // to the status table below; anything else is a flaky stream.
            if !matches!(
                self.header_state,
                HeaderState::Interrupted(InterruptReason::HttpError)
            ) {
                return self.transient_failure(error, config);
            }
        }

        match self.http_status {
            None => {
                // Stream "succeeded" without ever delivering a head; treat
                // like a flaky connection.
                self.transient_failure(&TransportError::Read("no response head".into()), config)
            }
            Some(status) if (200..300).contains(&status) => self.finalize(digests),
            Some(status @ (401 | 403)) => {
                let url = self.attempt_url();
                self.last_error = Some(DownloadError::HttpStatus { status, url });
                if !self.auth_retried {
                    // One-shot credential refresh: notify the adapter with
                    // a fatal outcome so it drops cached credentials, then
                    // prepare afresh on the same mirror.
                    self.auth_retried = true;
                    self.prepared = None;
                    Evaluation::new(
                        AttemptVerdict::RetrySameMirror,
                        MirrorEffect::Neutral,
                        TransferOutcome::FatalFailure,
                    )
                } else {
                    Evaluation::new(
                        AttemptVerdict::RetryAnotherMirror { mark_tried: true },
                        MirrorEffect::Failure,
                        TransferOutcome::FatalFailure,
                    )
                }
            }
            Some(status) if status == 429 || status >= 500 => {
                let url = self.attempt_url();
                self.last_error = Some(DownloadError::HttpStatus { status, url });
                // Soft failure: back the mirror off but keep it usable for
                // a later tick.
                Evaluation::new(
                    AttemptVerdict::RetryAnotherMirror { mark_tried: false },
                    MirrorEffect::SoftFailure,
                    TransferOutcome::TransientFailure,
                )
            }
            Some(status) => {
                let url = self.attempt_url();
                self.last_error = Some(DownloadError::HttpStatus { status, url });
                Evaluation::new(
                    AttemptVerdict::RetryAnotherMirror { mark_tried: true },
                    MirrorEffect::Failure,
                    TransferOutcome::FatalFailure,
                )
            }
        }
    }

    fn transient_failure(&mut self, error: &TransportError, config: &DownloaderConfig) -> Evaluation {
        self.last_error = Some(DownloadError::Transport {
            url: self.attempt_url(),
            reason: error.to_string(),
        });
        if self.retries_on_current_mirror < config.retries_per_mirror {
            self.retries_on_current_mirror += 1;
            Evaluation::new(
                AttemptVerdict::RetrySameMirror,
                MirrorEffect::Failure,
                TransferOutcome::TransientFailure,
            )
        } else {
            Evaluation::new(
                AttemptVerdict::RetryAnotherMirror { mark_tried: true },
                MirrorEffect::Failure,
                TransferOutcome::TransientFailure,
            )
        }
    }

    /// Size or checksum failure on an otherwise complete transfer: the
    /// partial is poisoned, the mirror is burned, and resume is off for
    /// every later attempt.
    fn verification_failure(&mut self, error: DownloadError) -> Evaluation {
        if self.temp_file.exists() {
            let _ = fs::remove_file(&self.temp_file);
        }
        self.resume_disabled = true;
        tracing::warn!(path = %self.desc.path, error = %error, "verification failed, discarding partial");
        self.last_error = Some(error);
        Evaluation::new(
            AttemptVerdict::RetryAnotherMirror { mark_tried: true },
            MirrorEffect::Failure,
            TransferOutcome::FatalFailure,
        )
    }

    fn finalize(&mut self, digests: Option<DigestSet>) -> Evaluation {
        let bytes_total = self.original_offset + self.writecb_received;

        if let Some(expected) = self.desc.expected_size {
            if bytes_total != expected {
                return self.verification_failure(DownloadError::SizeMismatch {
                    path: self.desc.destination.clone(),
                    expected,
                    actual: bytes_total,
                });
            }
        }

        if let Some(digests) = digests {
            if let Err(failure) = digests.verify() {
                return self.verification_failure(DownloadError::ChecksumMismatch {
                    path: self.desc.destination.clone(),
                    algorithm: failure.expected.algorithm,
                    expected: failure.expected.hex_digest,
                    actual: failure.actual,
                });
            }
        }

        // A zero-byte transfer never opened the writer; materialize the
        // empty partial so the rename below has something to move.
        if !self.temp_file.exists() {
            if let Err(e) = File::create(&self.temp_file) {
                return Evaluation::new(
                    AttemptVerdict::Fatal(DownloadError::io(&self.temp_file, e)),
                    MirrorEffect::Neutral,
                    TransferOutcome::FatalFailure,
                );
            }
        }

        if let Err(e) = fs::rename(&self.temp_file, &self.desc.destination) {
            return Evaluation::new(
                AttemptVerdict::Fatal(DownloadError::io(&self.desc.destination, e)),
                MirrorEffect::Neutral,
                TransferOutcome::FatalFailure,
            );
        }

        tracing::info!(
            path = %self.desc.path,
            destination = %self.desc.destination.display(),
            bytes = bytes_total,
            "download finished"
        );
        Evaluation::new(
            AttemptVerdict::Finished,
            MirrorEffect::Success,
            TransferOutcome::Success,
        )
    }

    fn attempt_url(&self) -> String {
        self.final_url.clone().unwrap_or_else(|| self.desc.path.clone())
    }

    /// The error recorded by the most recent failed attempt.
    pub fn take_last_error(&mut self) -> Option<DownloadError> {
        self.last_error.take()
    }

    /// Record a failure observed outside the event path (e.g. adapter
    /// preparation).
    pub fn note_failure(&mut self, error: DownloadError) {
        self.last_error = Some(error);
    }

    /// Move to a terminal state and invoke the end callback exactly once.
    pub fn complete(&mut self, status: TransferStatus, error: Option<DownloadError>) {
        self.state = match status {
            TransferStatus::Finished => TargetState::Finished,
            TransferStatus::Failed => TargetState::Failed,
        };
        let result = TransferResult {
            status,
            http_status: self.http_status,
            final_url: self.final_url.clone(),
            bytes_transferred: self.original_offset + self.writecb_received,
            error,
        };
        if let Some(callback) = self.desc.end_callback.as_mut() {
            callback(&result);
        }
        self.result = Some(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::Checksum;
    use tempfile::TempDir;

    const HELLO_SHA256: &str = "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9";

    fn head(status: u16) -> ResponseHead {
        ResponseHead {
            status,
            final_url: "http://m1/pkg".to_string(),
            content_length: None,
            content_range: None,
            accept_ranges: false,
        }
    }

    fn head_with_length(status: u16, length: u64) -> ResponseHead {
        ResponseHead {
            content_length: Some(length),
            ..head(status)
        }
    }

    fn target_in(temp: &TempDir, desc_mutator: impl FnOnce(DownloadTarget) -> DownloadTarget) -> Target {
        let desc = DownloadTarget::new("pkg", "ns", temp.path().join("pkg"));
        Target::new(desc_mutator(desc))
    }

    #[test]
    fn test_temp_file_uses_partial_suffix() {
        let temp = TempDir::new().unwrap();
        let target = target_in(&temp, |d| d);
        assert_eq!(
            target.temp_file().file_name().unwrap().to_str().unwrap(),
            "pkg.partial"
        );
    }

    #[test]
    fn test_happy_path_writes_and_renames() {
        let temp = TempDir::new().unwrap();
        let mut target = target_in(&temp, |d| {
            d.with_expected_size(11).with_checksum(Checksum::sha256(HELLO_SHA256))
        });

        target.begin_attempt().unwrap();
        assert_eq!(target.on_head(&head_with_length(200, 11)), StreamControl::Continue);
        assert_eq!(target.on_body(b"hello "), StreamControl::Continue);
        assert_eq!(target.on_body(b"world"), StreamControl::Continue);

        let evaluation = target.evaluate(Ok(()), &DownloaderConfig::default());
        assert!(matches!(evaluation.verdict, AttemptVerdict::Finished));
        assert_eq!(evaluation.mirror_effect, MirrorEffect::Success);
        assert_eq!(evaluation.adapter_outcome, TransferOutcome::Success);

        let destination = temp.path().join("pkg");
        assert_eq!(fs::read(&destination).unwrap(), b"hello world");
        assert!(!target.temp_file().exists());
    }

    #[test]
    fn test_http_error_aborts_before_body() {
        let temp = TempDir::new().unwrap();
        let mut target = target_in(&temp, |d| d);

        target.begin_attempt().unwrap();
        assert_eq!(target.on_head(&head(404)), StreamControl::Abort);

        let evaluation = target.evaluate(
            Err(TransportError::Aborted),
            &DownloaderConfig::default(),
        );
        assert!(matches!(
            evaluation.verdict,
            AttemptVerdict::RetryAnotherMirror { mark_tried: true }
        ));
        assert_eq!(evaluation.mirror_effect, MirrorEffect::Failure);
        // No body ever arrived, so no partial was created.
        assert!(!target.temp_file().exists());
    }

    #[test]
    fn test_5xx_is_soft_failure_without_marking_tried() {
        let temp = TempDir::new().unwrap();
        let mut target = target_in(&temp, |d| d);

        target.begin_attempt().unwrap();
        target.on_head(&head(503));
        let evaluation = target.evaluate(Err(TransportError::Aborted), &DownloaderConfig::default());
        assert!(matches!(
            evaluation.verdict,
            AttemptVerdict::RetryAnotherMirror { mark_tried: false }
        ));
        assert_eq!(evaluation.mirror_effect, MirrorEffect::SoftFailure);
    }

    #[test]
    fn test_transient_error_retries_same_mirror_up_to_cap() {
        let temp = TempDir::new().unwrap();
        let mut target = target_in(&temp, |d| d);
        let config = DownloaderConfig {
            retries_per_mirror: 1,
            ..Default::default()
        };

        target.begin_attempt().unwrap();
        let evaluation = target.evaluate(Err(TransportError::Timeout("t".into())), &config);
        assert!(matches!(evaluation.verdict, AttemptVerdict::RetrySameMirror));

        target.begin_attempt().unwrap();
        let evaluation = target.evaluate(Err(TransportError::Timeout("t".into())), &config);
        assert!(matches!(
            evaluation.verdict,
            AttemptVerdict::RetryAnotherMirror { mark_tried: true }
        ));
    }

    #[test]
    fn test_range_refusal_sets_sticky_flag_and_retries_same_mirror() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("pkg.partial"), b"hello ").unwrap();
        let mut target = target_in(&temp, |d| d.with_resume(true));

        target.begin_attempt().unwrap();
        assert_eq!(target.original_offset, 6);
        assert_eq!(target.resume_count, 1);

        // 200 with a full body means the server ignored the range.
        assert_eq!(target.on_head(&head(200)), StreamControl::Abort);
        assert!(target.range_fail);

        let evaluation = target.evaluate(Err(TransportError::Aborted), &DownloaderConfig::default());
        assert!(matches!(evaluation.verdict, AttemptVerdict::RetrySameMirror));
        assert_eq!(evaluation.mirror_effect, MirrorEffect::Neutral);

        // The next attempt must start from zero.
        target.begin_attempt().unwrap();
        assert_eq!(target.original_offset, 0);
    }

    #[test]
    fn test_resume_seeds_digests_over_whole_file() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("pkg.partial"), b"hello ").unwrap();
        let mut target = target_in(&temp, |d| {
            d.with_resume(true)
                .with_expected_size(11)
                .with_checksum(Checksum::sha256(HELLO_SHA256))
        });

        target.begin_attempt().unwrap();
        assert_eq!(target.original_offset, 6);

        let resumed = ResponseHead {
            content_length: Some(5),
            content_range: Some("bytes 6-10/11".to_string()),
            ..head(206)
        };
        assert_eq!(target.on_head(&resumed), StreamControl::Continue);
        assert_eq!(target.on_body(b"world"), StreamControl::Continue);
        assert_eq!(target.writecb_received, 5);

        let evaluation = target.evaluate(Ok(()), &DownloaderConfig::default());
        assert!(matches!(evaluation.verdict, AttemptVerdict::Finished));
        assert_eq!(fs::read(temp.path().join("pkg")).unwrap(), b"hello world");
    }

    #[test]
    fn test_size_exceeded_interrupts_mid_stream() {
        let temp = TempDir::new().unwrap();
        let mut target = target_in(&temp, |d| d.with_expected_size(4));

        target.begin_attempt().unwrap();
        target.on_head(&head(200));
        assert_eq!(target.on_body(b"too many bytes"), StreamControl::Abort);
        assert_eq!(
            target.header_state,
            HeaderState::Interrupted(InterruptReason::SizeExceeded)
        );

        let evaluation = target.evaluate(Err(TransportError::Aborted), &DownloaderConfig::default());
        assert!(matches!(
            evaluation.verdict,
            AttemptVerdict::RetryAnotherMirror { mark_tried: true }
        ));
        assert!(!target.temp_file().exists(), "poisoned partial must be deleted");
    }

    #[test]
    fn test_announced_size_mismatch_interrupts_at_header() {
        let temp = TempDir::new().unwrap();
        let mut target = target_in(&temp, |d| d.with_expected_size(1024));

        target.begin_attempt().unwrap();
        assert_eq!(target.on_head(&head_with_length(200, 999)), StreamControl::Abort);
        assert_eq!(
            target.header_state,
            HeaderState::Interrupted(InterruptReason::SizeMismatch)
        );
    }

    #[test]
    fn test_checksum_mismatch_deletes_partial_and_disables_resume() {
        let temp = TempDir::new().unwrap();
        let mut target = target_in(&temp, |d| {
            d.with_resume(true).with_checksum(Checksum::sha256(HELLO_SHA256))
        });

        target.begin_attempt().unwrap();
        target.on_head(&head(200));
        target.on_body(b"wrong bytes");

        let evaluation = target.evaluate(Ok(()), &DownloaderConfig::default());
        assert!(matches!(
            evaluation.verdict,
            AttemptVerdict::RetryAnotherMirror { mark_tried: true }
        ));
        assert_eq!(evaluation.adapter_outcome, TransferOutcome::FatalFailure);
        assert!(!target.temp_file().exists());
        assert!(!temp.path().join("pkg").exists(), "destination must not appear");

        // Even though a partial would normally be resumed, the mismatch
        // forces a restart from zero.
        fs::write(target.temp_file(), b"stale").unwrap();
        target.begin_attempt().unwrap();
        assert_eq!(target.original_offset, 0);
    }

    #[test]
    fn test_auth_error_gets_one_refresh_then_burns_mirror() {
        let temp = TempDir::new().unwrap();
        let mut target = target_in(&temp, |d| d);

        target.begin_attempt().unwrap();
        target.on_head(&head(401));
        let evaluation = target.evaluate(Err(TransportError::Aborted), &DownloaderConfig::default());
        assert!(matches!(evaluation.verdict, AttemptVerdict::RetrySameMirror));
        assert_eq!(evaluation.adapter_outcome, TransferOutcome::FatalFailure);
        assert!(target.auth_retried);

        target.begin_attempt().unwrap();
        target.on_head(&head(401));
        let evaluation = target.evaluate(Err(TransportError::Aborted), &DownloaderConfig::default());
        assert!(matches!(
            evaluation.verdict,
            AttemptVerdict::RetryAnotherMirror { mark_tried: true }
        ));
    }

    #[test]
    fn test_progress_callback_sees_attempt_bytes() {
        let temp = TempDir::new().unwrap();
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen_clone = std::sync::Arc::clone(&seen);
        let mut target = target_in(&temp, move |d| {
            d.with_expected_size(11)
                .with_progress_callback(Box::new(move |total, received| {
                    seen_clone.lock().unwrap().push((total, received));
                }))
        });

        target.begin_attempt().unwrap();
        target.on_head(&head_with_length(200, 11));
        target.on_body(b"hello ");
        target.on_body(b"world");

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![(Some(11), 6), (Some(11), 11)]);
    }

    #[test]
    fn test_complete_invokes_end_callback_once() {
        let temp = TempDir::new().unwrap();
        let calls = std::sync::Arc::new(std::sync::Mutex::new(0u32));
        let calls_clone = std::sync::Arc::clone(&calls);
        let mut target = target_in(&temp, move |d| {
            d.with_end_callback(Box::new(move |result| {
                assert_eq!(result.status, TransferStatus::Failed);
                *calls_clone.lock().unwrap() += 1;
            }))
        });

        target.complete(TransferStatus::Failed, Some(DownloadError::Cancelled));
        assert_eq!(*calls.lock().unwrap(), 1);
        assert_eq!(target.state, TargetState::Failed);
        assert!(target.result.as_ref().unwrap().error.is_some());
    }
}
