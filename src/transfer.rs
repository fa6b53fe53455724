//! Multi-handle transfer client.
//!
//! The client multiplexes N concurrent byte streams while keeping all
//! state-machine work on one thread. Each added request gets a worker
//! thread that drives the [`Transport`] and forwards head/body/finished
//! events over a bounded channel; [`TransferClient::perform`] drains that
//! channel on the caller's thread, hands each event to the supplied
//! callback, and returns when some handle finishes.
//!
//! ```text
//! add(request) ──► worker thread ──► Transport::fetch
//!                       │ Head / Body / Finished
//!                       ▼
//!                 bounded channel ──► perform(on_event)   (caller thread)
//! ```
//!
//! Ordering: events for one handle arrive in byte order, with the head
//! strictly first; ordering across handles is unspecified. Abort is
//! cooperative — [`TransferClient::abort`] sets a flag the worker honors at
//! the next chunk boundary, after which the handle finishes with
//! [`TransportError::Aborted`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::transport::{Request, ResponseHead, StreamControl, StreamSink, Transport, TransportError};

/// Depth of the event channel. Workers block on a full channel, which
/// bounds how far the network can run ahead of the disk.
const EVENT_QUEUE_DEPTH: usize = 64;

/// Identifies one in-flight transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransferHandle(u64);

/// Event delivered to the `perform` callback.
#[derive(Debug)]
pub enum TransferEvent<'a> {
    Head(&'a ResponseHead),
    Body(&'a [u8]),
}

/// A finished transfer: which handle, and how the stream ended.
///
/// `Ok(())` means the byte stream completed; whether the bytes are any
/// good (HTTP status, size, checksums) is the consumer's verdict to make
/// from the events it saw.
#[derive(Debug)]
pub struct Completion {
    pub handle: TransferHandle,
    pub result: Result<(), TransportError>,
}

enum WireEvent {
    Head(ResponseHead),
    Body(Vec<u8>),
    Finished(Result<(), TransportError>),
}

struct ActiveTransfer {
    abort: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

/// Multiplexes concurrent transfers over a shared [`Transport`].
pub struct TransferClient {
    transport: Arc<dyn Transport>,
    tx: SyncSender<(TransferHandle, WireEvent)>,
    rx: Receiver<(TransferHandle, WireEvent)>,
    active: HashMap<TransferHandle, ActiveTransfer>,
    next_handle: u64,
}

impl TransferClient {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (tx, rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
        Self {
            transport,
            tx,
            rx,
            active: HashMap::new(),
            next_handle: 0,
        }
    }

    /// Number of transfers currently in flight.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Enqueue a request and start streaming it on a worker thread.
    pub fn add(&mut self, request: Request) -> TransferHandle {
        let handle = TransferHandle(self.next_handle);
        self.next_handle += 1;

        let abort = Arc::new(AtomicBool::new(false));
        let transport = Arc::clone(&self.transport);
        let tx = self.tx.clone();
        let worker_abort = Arc::clone(&abort);

        let worker = thread::spawn(move || {
            let mut sink = WorkerSink {
                handle,
                tx: &tx,
                abort: &worker_abort,
            };
            let result = transport.fetch(&request, &mut sink);
            // Best effort: the receiver may already be gone on teardown.
            let _ = tx.send((handle, WireEvent::Finished(result)));
        });

        self.active.insert(
            handle,
            ActiveTransfer {
                abort,
                worker: Some(worker),
            },
        );
        handle
    }

    /// Request cooperative abort of one transfer. The handle still
    /// completes (with [`TransportError::Aborted`]) through `perform`.
    pub fn abort(&mut self, handle: TransferHandle) {
        if let Some(transfer) = self.active.get(&handle) {
            transfer.abort.store(true, Ordering::SeqCst);
        }
    }

    /// Request cooperative abort of every active transfer.
    pub fn abort_all(&mut self) {
        for transfer in self.active.values() {
            transfer.abort.store(true, Ordering::SeqCst);
        }
    }

    /// Drive active transfers until one finishes.
    ///
    /// Head and body events are handed to `on_event` as they arrive; a
    /// [`StreamControl::Abort`] return aborts that handle's stream.
    /// Returns `None` when no transfers are active.
    pub fn perform<F>(&mut self, mut on_event: F) -> Option<Completion>
    where
        F: FnMut(TransferHandle, TransferEvent<'_>) -> StreamControl,
    {
        if self.active.is_empty() {
            return None;
        }

        loop {
            // Cannot fail: we hold a sender ourselves.
            let (handle, event) = self.rx.recv().ok()?;
            match event {
                WireEvent::Head(head) => {
                    if on_event(handle, TransferEvent::Head(&head)) == StreamControl::Abort {
                        self.abort(handle);
                    }
                }
                WireEvent::Body(chunk) => {
                    if on_event(handle, TransferEvent::Body(&chunk)) == StreamControl::Abort {
                        self.abort(handle);
                    }
                }
                WireEvent::Finished(result) => {
                    if let Some(mut transfer) = self.active.remove(&handle) {
                        if let Some(worker) = transfer.worker.take() {
                            let _ = worker.join();
                        }
                        return Some(Completion { handle, result });
                    }
                    // Stale event for a handle already torn down; keep
                    // draining.
                }
            }
        }
    }
}

impl Drop for TransferClient {
    fn drop(&mut self) {
        self.abort_all();
        // Drain so no worker stays blocked on a full channel.
        while !self.active.is_empty() {
            match self.rx.recv() {
                Ok((handle, WireEvent::Finished(_))) => {
                    if let Some(mut transfer) = self.active.remove(&handle) {
                        if let Some(worker) = transfer.worker.take() {
                            let _ = worker.join();
                        }
                    }
                }
                Ok(_) => {}
                Err(_) => break,
            }
        }
    }
}

struct WorkerSink<'a> {
    handle: TransferHandle,
    tx: &'a SyncSender<(TransferHandle, WireEvent)>,
    abort: &'a AtomicBool,
}

impl WorkerSink<'_> {
    fn forward(&mut self, event: WireEvent) -> StreamControl {
        if self.abort.load(Ordering::SeqCst) {
            return StreamControl::Abort;
        }
        if self.tx.send((self.handle, event)).is_err() {
            return StreamControl::Abort;
        }
        StreamControl::Continue
    }
}

impl StreamSink for WorkerSink<'_> {
    fn on_head(&mut self, head: ResponseHead) -> StreamControl {
        self.forward(WireEvent::Head(head))
    }

    fn on_body(&mut self, chunk: &[u8]) -> StreamControl {
        self.forward(WireEvent::Body(chunk.to_vec()))
    }
}
