//! HTTP/1.1 transport.
//!
//! A thin wrapper over hyper's pooled client. Keep-alive connection reuse,
//! the idle-socket timeout and TCP_NODELAY are configured here; everything
//! about building requests and interpreting outcomes lives in the pipeline.
//!
//! # The body-streaming gate
//!
//! A PUT payload is handed to the client as a one-shot byte stream that is
//! usually not replayable. The stream therefore lives in a shared slot
//! ([`StreamSource`]) rather than inside any single request: hyper only
//! polls a request body once a connection, fresh or reused, is established
//! and writable, so an attempt that dies during connection setup leaves the
//! slot untouched and the operation can be replayed against the next
//! endpoint. The `started` latch flips when the first chunk is handed over,
//! and from that point on a failure is terminal for the operation.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::Stream;
use hyper::body::{Body, Frame, Incoming, SizeHint};
use hyper::{Request, Response};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioTimer};

use crate::config::SproxydConfig;

/// Shared handle to a caller-supplied payload stream.
///
/// Cloning is cheap; every per-attempt [`RequestBody`] built from the same
/// source polls the same underlying stream and observes the same latches.
#[derive(Clone)]
pub(crate) struct StreamSource {
    stream: Arc<Mutex<Option<BoxStream<'static, io::Result<Bytes>>>>>,
    started: Arc<AtomicBool>,
    aborted: Arc<AtomicBool>,
    size: u64,
}

impl StreamSource {
    pub fn new(stream: BoxStream<'static, io::Result<Bytes>>, size: u64) -> Self {
        Self {
            stream: Arc::new(Mutex::new(Some(stream))),
            started: Arc::new(AtomicBool::new(false)),
            aborted: Arc::new(AtomicBool::new(false)),
            size,
        }
    }

    /// Whether at least one payload chunk has been handed to the transport.
    pub fn streaming_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Whether the caller's stream itself reported an error.
    pub fn source_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Declared payload size, used for the content-length header.
    pub fn size(&self) -> u64 {
        self.size
    }
}

/// Request body for one attempt.
pub(crate) enum RequestBody {
    Empty,
    Full(Option<Bytes>),
    Streaming(StreamSource),
}

impl RequestBody {
    pub fn full(payload: Bytes) -> Self {
        RequestBody::Full(Some(payload))
    }
}

impl Body for RequestBody {
    type Data = Bytes;
    type Error = io::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Bytes>, io::Error>>> {
        match self.get_mut() {
            RequestBody::Empty => Poll::Ready(None),
            RequestBody::Full(slot) => Poll::Ready(
                slot.take()
                    .filter(|payload| !payload.is_empty())
                    .map(|payload| Ok(Frame::data(payload))),
            ),
            RequestBody::Streaming(source) => {
                let mut guard = source.stream.lock().unwrap();
                let stream = match guard.as_mut() {
                    Some(stream) => stream,
                    None => return Poll::Ready(None),
                };
                match stream.as_mut().poll_next(cx) {
                    Poll::Ready(Some(Ok(chunk))) => {
                        source.started.store(true, Ordering::SeqCst);
                        Poll::Ready(Some(Ok(Frame::data(chunk))))
                    }
                    Poll::Ready(Some(Err(e))) => {
                        source.aborted.store(true, Ordering::SeqCst);
                        Poll::Ready(Some(Err(e)))
                    }
                    Poll::Ready(None) => {
                        *guard = None;
                        Poll::Ready(None)
                    }
                    Poll::Pending => Poll::Pending,
                }
            }
        }
    }

    fn is_end_stream(&self) -> bool {
        match self {
            RequestBody::Empty => true,
            RequestBody::Full(slot) => slot.as_ref().map_or(true, |payload| payload.is_empty()),
            RequestBody::Streaming(_) => false,
        }
    }

    fn size_hint(&self) -> SizeHint {
        match self {
            RequestBody::Empty => SizeHint::with_exact(0),
            RequestBody::Full(slot) => {
                SizeHint::with_exact(slot.as_ref().map_or(0, |payload| payload.len() as u64))
            }
            RequestBody::Streaming(source) => SizeHint::with_exact(source.size),
        }
    }
}

/// Keep-alive HTTP/1.1 client with a bounded per-request timeout.
#[derive(Clone)]
pub(crate) struct Transport {
    client: Client<HttpConnector, RequestBody>,
    request_timeout: Duration,
}

impl Transport {
    pub fn new(config: &SproxydConfig) -> Self {
        let mut connector = HttpConnector::new();
        // latency trumps coalescing for small requests
        connector.set_nodelay(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(config.idle_timeout)
            .pool_timer(TokioTimer::new())
            .build(connector);
        Self {
            client,
            request_timeout: config.request_timeout,
        }
    }

    /// Sends one request and waits for the response head.
    ///
    /// Failures come back as plain text; the pipeline classifies them based
    /// on how far body streaming had progressed.
    pub async fn send(
        &self,
        request: Request<RequestBody>,
    ) -> Result<Response<Incoming>, String> {
        match tokio::time::timeout(self.request_timeout, self.client.request(request)).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(e)) => Err(describe_error(&e)),
            Err(_) => Err(format!(
                "request timed out after {}ms",
                self.request_timeout.as_millis()
            )),
        }
    }
}

/// Renders an error with its full source chain, which is where hyper keeps
/// the interesting part (ECONNREFUSED, ECONNRESET, ...).
fn describe_error(err: &(dyn std::error::Error + 'static)) -> String {
    let mut text = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        text.push_str(": ");
        text.push_str(&cause.to_string());
        source = cause.source();
    }
    text
}
