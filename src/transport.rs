//! HTTP byte-stream abstraction for testability.
//!
//! The engine only needs one operation from HTTP: stream a (possibly
//! ranged) GET, exposing the response head before the first body chunk and
//! allowing the consumer to abort between chunks. [`Transport`] captures
//! exactly that, so tests can substitute scripted transports while
//! production uses [`ReqwestTransport`].

use std::io::Read;
use std::time::Duration;

use thiserror::Error;

/// Buffer size for reading response bodies (64KB).
const BUFFER_SIZE: usize = 64 * 1024;

/// A concrete request produced by a mirror adapter, plus the byte offset
/// the core adds when resuming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub url: String,
    /// Extra headers (auth tokens, signatures) supplied by the adapter.
    pub headers: Vec<(String, String)>,
    /// When set, the transport sends `Range: bytes={start}-`.
    pub range_start: Option<u64>,
}

impl Request {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            headers: Vec::new(),
            range_start: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// The parts of a response head the engine inspects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub status: u16,
    /// URL after redirects.
    pub final_url: String,
    /// `Content-Length`, when the server declares one. For a 206 response
    /// this is the length of the returned range, not the full entity.
    pub content_length: Option<u64>,
    /// Raw `Content-Range` value, present on 206 responses.
    pub content_range: Option<String>,
    /// Whether the server advertised `Accept-Ranges: bytes` (advisory).
    pub accept_ranges: bool,
}

/// Consumer verdict after each head/body delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamControl {
    Continue,
    /// Terminate the transfer at the next opportunity; the transport
    /// returns [`TransportError::Aborted`].
    Abort,
}

/// Receives the response head and body chunks, in order, on the thread
/// driving the transfer. Implementations must not block.
pub trait StreamSink {
    fn on_head(&mut self, head: ResponseHead) -> StreamControl;
    fn on_body(&mut self, chunk: &[u8]) -> StreamControl;
}

/// Transport-level failures, classified for the retry policy.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// Could not establish a connection (DNS, refused, TLS).
    #[error("connection failed: {0}")]
    Connect(String),

    /// The request or a read timed out.
    #[error("request timed out: {0}")]
    Timeout(String),

    /// The connection died mid-stream.
    #[error("read failed: {0}")]
    Read(String),

    /// The sink requested termination; not a network failure.
    #[error("transfer aborted")]
    Aborted,
}

impl TransportError {
    /// Whether retrying the same mirror could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::Aborted)
    }
}

/// One streaming GET. The head is delivered before any body chunk; body
/// chunks arrive in byte order.
pub trait Transport: Send + Sync {
    fn fetch(&self, request: &Request, sink: &mut dyn StreamSink) -> Result<(), TransportError>;
}

/// Production transport backed by a blocking reqwest client.
#[derive(Debug)]
pub struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    /// Create a transport with the given whole-request timeout.
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Connect(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }
}

impl Transport for ReqwestTransport {
    fn fetch(&self, request: &Request, sink: &mut dyn StreamSink) -> Result<(), TransportError> {
        let mut builder = self.client.get(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(start) = request.range_start {
            builder = builder.header(reqwest::header::RANGE, format!("bytes={}-", start));
        }

        let mut response = builder.send().map_err(classify_reqwest_error)?;

        let headers = response.headers();
        let head = ResponseHead {
            status: response.status().as_u16(),
            final_url: response.url().to_string(),
            content_length: headers
                .get(reqwest::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok()),
            content_range: headers
                .get(reqwest::header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            accept_ranges: headers
                .get(reqwest::header::ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == "bytes"),
        };

        if sink.on_head(head) == StreamControl::Abort {
            return Err(TransportError::Aborted);
        }

        let mut buffer = vec![0u8; BUFFER_SIZE];
        loop {
            let bytes_read = response
                .read(&mut buffer)
                .map_err(|e| TransportError::Read(e.to_string()))?;
            if bytes_read == 0 {
                return Ok(());
            }
            if sink.on_body(&buffer[..bytes_read]) == StreamControl::Abort {
                return Err(TransportError::Aborted);
            }
        }
    }
}

fn classify_reqwest_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(e.to_string())
    } else if e.is_connect() {
        TransportError::Connect(e.to_string())
    } else {
        TransportError::Read(e.to_string())
    }
}
