//! Scripted transport for driving the downloader without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use mirrorfetch::{Request, ResponseHead, StreamControl, StreamSink, Transport, TransportError};

/// One scripted reaction to a request.
#[derive(Debug, Clone)]
pub enum Script {
    Respond(ScriptedResponse),
    Fail(TransportError),
}

/// A canned HTTP response.
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub status: u16,
    pub body: Vec<u8>,
    /// Honor `Range` requests with a 206 over the body suffix. When false,
    /// a ranged request still gets a 200 with the full body, which is
    /// exactly how a range-ignoring server misbehaves.
    pub serve_range: bool,
    pub chunk_size: usize,
    /// Pause between chunks, for tests that race cancellation against an
    /// in-flight stream.
    pub chunk_delay: Option<Duration>,
}

impl ScriptedResponse {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            serve_range: false,
            chunk_size: 4096,
            chunk_delay: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            serve_range: false,
            chunk_size: 4096,
            chunk_delay: None,
        }
    }

    pub fn with_range_support(mut self) -> Self {
        self.serve_range = true;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn with_chunk_delay(mut self, delay: Duration) -> Self {
        self.chunk_delay = Some(delay);
        self
    }
}

/// In-memory transport serving per-URL script queues.
///
/// Each request pops the next script for its URL; the final script is
/// sticky, so retries against a stable server just see the same answer
/// again. Every request is recorded for assertions.
#[derive(Default)]
pub struct MockTransport {
    scripts: Mutex<HashMap<String, VecDeque<Script>>>,
    requests: Mutex<Vec<Request>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, url: &str, script: Script) {
        self.scripts
            .lock()
            .unwrap()
            .entry(url.to_string())
            .or_default()
            .push_back(script);
    }

    pub fn respond(&self, url: &str, response: ScriptedResponse) {
        self.script(url, Script::Respond(response));
    }

    pub fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_for(&self, url: &str) -> Vec<Request> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url == url)
            .cloned()
            .collect()
    }
}

impl Transport for MockTransport {
    fn fetch(&self, request: &Request, sink: &mut dyn StreamSink) -> Result<(), TransportError> {
        self.requests.lock().unwrap().push(request.clone());

        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            let queue = scripts
                .get_mut(&request.url)
                .ok_or_else(|| TransportError::Connect(format!("unscripted url {}", request.url)))?;
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
            .ok_or_else(|| TransportError::Connect(format!("script exhausted for {}", request.url)))?
        };

        let response = match script {
            Script::Fail(error) => return Err(error),
            Script::Respond(response) => response,
        };

        let (status, body, content_range) = match (request.range_start, response.serve_range) {
            (Some(start), true) => {
                let start = start as usize;
                let total = response.body.len();
                let suffix = response.body.get(start..).unwrap_or_default().to_vec();
                (
                    206,
                    suffix,
                    Some(format!("bytes {}-{}/{}", start, total.saturating_sub(1), total)),
                )
            }
            // Range ignored (or never requested): full body, plain status.
            _ => (response.status, response.body.clone(), None),
        };

        let head = ResponseHead {
            status,
            final_url: request.url.clone(),
            content_length: Some(body.len() as u64),
            content_range,
            accept_ranges: response.serve_range,
        };
        if sink.on_head(head) == StreamControl::Abort {
            return Err(TransportError::Aborted);
        }

        for chunk in body.chunks(response.chunk_size) {
            if let Some(delay) = response.chunk_delay {
                std::thread::sleep(delay);
            }
            if sink.on_body(chunk) == StreamControl::Abort {
                return Err(TransportError::Aborted);
            }
        }
        Ok(())
    }
}

/// Lowercase hex SHA-256 of a byte slice.
pub fn sha256_hex(data: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    format!("{:x}", Sha256::digest(data))
}
