//! Request pipeline: builds one HTTP request per attempt, drives it through
//! the transport and classifies the outcome.
//!
//! Classification is the part failover depends on:
//!
//! - a failure before any payload byte was handed to the transport is a
//!   `Transport` error and may be retried against another endpoint;
//! - a failure after streaming began is `MidStream` and terminal, because
//!   the payload source is not replayable;
//! - an error produced by the payload source itself is `Aborted`;
//! - a 4xx response is a definite answer (`Http`), never retried;
//! - any other non-success status is `Server` and eligible for failover.

use bytes::Bytes;
use hyper::body::Incoming;
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};

use sproxyd_common::error::{Result, SproxydError};

use crate::endpoint::Endpoint;
use crate::transport::{RequestBody, StreamSource, Transport};

pub(crate) const HDR_REQUEST_UIDS: &str = "X-Scal-Request-Uids";
pub(crate) const HDR_TRACE_IDS: &str = "X-Scal-Trace-Ids";
pub(crate) const HDR_REPLICA_POLICY: &str = "X-Scal-Replica-Policy";
pub(crate) const HDR_USERMD: &str = "x-scal-usermd";

pub(crate) const CONTENT_TYPE_OBJECT: &str = "application/octet-stream";
pub(crate) const CONTENT_TYPE_JSON: &str = "application/json";

/// Wire body of a batch delete request.
#[derive(Serialize)]
pub(crate) struct BatchDeleteRequest {
    pub keys: Vec<String>,
}

/// One logical operation, independent of the endpoint it will run against.
pub(crate) struct Operation {
    pub method: Method,
    /// Absolute request path, base path included.
    pub target: String,
    /// First UID of the caller's trace chain; empty when none was supplied.
    pub req_uid: String,
    pub range: Option<(u64, u64)>,
    pub usermd: Option<String>,
    pub content_type: &'static str,
    pub body: OperationBody,
}

pub(crate) enum OperationBody {
    None,
    Full(Bytes),
    Stream(StreamSource),
}

impl Operation {
    pub fn content_length(&self) -> u64 {
        match &self.body {
            OperationBody::None => 0,
            OperationBody::Full(payload) => payload.len() as u64,
            OperationBody::Stream(source) => source.size(),
        }
    }

    pub fn streaming_started(&self) -> bool {
        match &self.body {
            OperationBody::Stream(source) => source.streaming_started(),
            _ => false,
        }
    }

    pub fn source_aborted(&self) -> bool {
        match &self.body {
            OperationBody::Stream(source) => source.source_aborted(),
            _ => false,
        }
    }

    fn attempt_body(&self) -> RequestBody {
        match &self.body {
            OperationBody::None => RequestBody::Empty,
            OperationBody::Full(payload) => RequestBody::full(payload.clone()),
            OperationBody::Stream(source) => RequestBody::Streaming(source.clone()),
        }
    }
}

/// Builds and dispatches per-attempt requests.
#[derive(Clone)]
pub(crate) struct RequestPipeline {
    transport: Transport,
    immutable: bool,
}

impl RequestPipeline {
    pub fn new(transport: Transport, immutable: bool) -> Self {
        Self {
            transport,
            immutable,
        }
    }

    /// Runs one attempt of `op` against `endpoint`.
    pub async fn dispatch(&self, op: &Operation, endpoint: &Endpoint) -> Result<Response<Incoming>> {
        let request = self.build_request(op, endpoint)?;
        debug!(endpoint = %endpoint, method = %op.method, target = %op.target, "dispatching request");
        match self.transport.send(request).await {
            Ok(response) => self.check_status(op, endpoint, response),
            Err(failure) => Err(classify_failure(op, endpoint, failure)),
        }
    }

    fn build_request(&self, op: &Operation, endpoint: &Endpoint) -> Result<Request<RequestBody>> {
        let uri = format!("http://{}{}", endpoint, op.target);
        let mut builder = Request::builder()
            .method(op.method.clone())
            .uri(uri)
            .header(CONTENT_LENGTH, op.content_length())
            .header(CONTENT_TYPE, op.content_type);
        if !op.req_uid.is_empty() {
            builder = builder
                .header(HDR_REQUEST_UIDS, op.req_uid.as_str())
                .header(HDR_TRACE_IDS, op.req_uid.as_str());
        }
        if self.immutable {
            builder = builder.header(HDR_REPLICA_POLICY, "immutable");
        }
        if let Some((start, end)) = op.range {
            builder = builder.header(RANGE, format!("bytes={}-{}", start, end));
        }
        if let Some(usermd) = &op.usermd {
            builder = builder.header(HDR_USERMD, usermd.as_str());
        }
        builder
            .body(op.attempt_body())
            .map_err(|e| SproxydError::InvalidArgument(format!("cannot build request: {}", e)))
    }

    fn check_status(
        &self,
        op: &Operation,
        endpoint: &Endpoint,
        response: Response<Incoming>,
    ) -> Result<Response<Incoming>> {
        let status = response.status();
        let success = match status {
            StatusCode::OK => true,
            StatusCode::PARTIAL_CONTENT => op.range.is_some(),
            // an immutable replica being reclaimed elsewhere; the backend
            // guarantees eventual absence, which is what the caller wanted
            StatusCode::LOCKED if op.method == Method::DELETE => {
                debug!(endpoint = %endpoint, target = %op.target, "delete on locked immutable replica, treated as done");
                true
            }
            _ => false,
        };
        if success {
            return Ok(response);
        }
        if status.is_client_error() {
            debug!(endpoint = %endpoint, target = %op.target, status = status.as_u16(), "backend returned a definite non-success status");
            Err(SproxydError::Http {
                status: status.as_u16(),
            })
        } else {
            warn!(endpoint = %endpoint, target = %op.target, status = status.as_u16(), "unexpected status from endpoint");
            Err(SproxydError::Server {
                status: status.as_u16(),
            })
        }
    }
}

fn classify_failure(op: &Operation, endpoint: &Endpoint, failure: String) -> SproxydError {
    let text = format!("{}: {}", endpoint, failure);
    if op.source_aborted() {
        SproxydError::Aborted(text)
    } else if op.streaming_started() {
        SproxydError::MidStream(text)
    } else {
        SproxydError::Transport(text)
    }
}
