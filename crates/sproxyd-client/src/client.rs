//! The public client surface.
//!
//! All verbs run through the same machinery: build an [`Operation`], hand it
//! to the failover controller, interpret the response. Payload uploads take
//! any `Stream` of byte chunks; downloads hand the hyper response back to
//! the caller, who streams the body at their own pace.

use std::io;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Stream, StreamExt, TryStreamExt};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::{Method, Response};
use md5::{Digest, Md5};
use rand::Rng;
use tracing::{debug, error, info, warn};

use sproxyd_common::error::{Result, SproxydError};
use sproxyd_common::key::{generate_key, validate_key, RoutingParams};

use crate::config::SproxydConfig;
use crate::endpoint::{Endpoint, EndpointPool};
use crate::failover::FailoverController;
use crate::pipeline::{
    BatchDeleteRequest, Operation, OperationBody, RequestPipeline, CONTENT_TYPE_JSON,
    CONTENT_TYPE_OBJECT, HDR_USERMD,
};
use crate::transport::{StreamSource, Transport};

/// Fixed key of the batch delete endpoint.
const BATCH_DELETE_KEY: &str = ".batch_delete";

/// Fixed key of the healthcheck endpoint.
const HEALTHCHECK_KEY: &str = ".conf";

/// Largest number of keys sent in one batch delete sub-request.
const BATCH_MAX_KEYS: usize = 1000;

/// Largest number of batch delete sub-requests in flight at once.
const BATCH_CONCURRENCY: usize = 5;

/// Client for a ring of sproxyd storage endpoints.
///
/// Cloning is cheap and shares the endpoint pool and the keep-alive
/// connection pool, so one client per process is the normal setup.
#[derive(Clone)]
pub struct SproxydClient {
    pool: Arc<EndpointPool>,
    failover: FailoverController,
    base_path: String,
    cos: u8,
}

impl SproxydClient {
    /// Creates a client from a configuration, permuting the bootstrap list
    /// with the thread RNG.
    pub fn new(config: SproxydConfig) -> Result<Self> {
        Self::with_rng(config, &mut rand::thread_rng())
    }

    /// Creates a client with a caller-supplied RNG for the bootstrap
    /// shuffle. Mostly useful for reproducible tests.
    pub fn with_rng(config: SproxydConfig, rng: &mut impl Rng) -> Result<Self> {
        let pool = Arc::new(EndpointPool::new(&config.bootstrap, rng)?);
        let transport = Transport::new(&config);
        let pipeline = RequestPipeline::new(transport, config.immutable);
        let base_path = config.base_path();
        info!(
            endpoints = pool.len(),
            path = %base_path,
            immutable = config.immutable,
            "sproxyd client initialized"
        );
        Ok(Self {
            failover: FailoverController::new(Arc::clone(&pool), pipeline),
            pool,
            base_path,
            cos: config.cos(),
        })
    }

    /// Stores a payload under a freshly generated key and returns the key.
    ///
    /// `size` must be the exact byte count the stream will produce; it is
    /// sent as the content-length header and chunked transfer is never used.
    pub async fn put<S>(
        &self,
        body: S,
        size: u64,
        params: &RoutingParams,
        req_uid: &str,
    ) -> Result<String>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let key = generate_key(params, self.cos)?;
        self.put_stream(&key, body.boxed(), size, req_uid).await?;
        Ok(key)
    }

    /// Stores a payload under a caller-supplied key.
    pub async fn put_with_key<S>(
        &self,
        key: &str,
        body: S,
        size: u64,
        req_uid: &str,
    ) -> Result<()>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        validate_key(key)?;
        self.put_stream(key, body.boxed(), size, req_uid).await
    }

    /// Stores a payload while checking it against a caller-supplied MD5.
    ///
    /// The digest is computed as the payload streams out. On mismatch the
    /// just-written key is deleted on a best-effort basis and the operation
    /// fails with [`SproxydError::InvalidDigest`].
    pub async fn put_with_digest<S>(
        &self,
        body: S,
        size: u64,
        content_md5: &str,
        params: &RoutingParams,
        req_uid: &str,
    ) -> Result<String>
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
    {
        let key = generate_key(params, self.cos)?;
        let hasher = Arc::new(Mutex::new(Md5::new()));
        let tracker = Arc::clone(&hasher);
        let hashed = body.inspect_ok(move |chunk: &Bytes| tracker.lock().unwrap().update(chunk));
        self.put_stream(&key, hashed.boxed(), size, req_uid).await?;

        let computed = hex::encode(hasher.lock().unwrap().clone().finalize());
        if !computed.eq_ignore_ascii_case(content_md5) {
            warn!(key = %key, computed = %computed, "payload digest mismatch, removing the object");
            if let Err(e) = self.delete(&key, req_uid).await {
                warn!(key = %key, error = %e, "cleanup delete after digest mismatch failed");
            }
            return Err(SproxydError::InvalidDigest {
                expected: content_md5.to_string(),
                computed,
            });
        }
        Ok(key)
    }

    /// Stores an empty object carrying opaque user metadata.
    pub async fn put_empty_object(&self, key: &str, usermd_hex: &str, req_uid: &str) -> Result<()> {
        validate_key(key)?;
        debug!(key, "put empty object");
        let op = Operation {
            method: Method::PUT,
            target: self.target(key),
            req_uid: first_uid(req_uid),
            range: None,
            usermd: Some(usermd_hex.to_string()),
            content_type: CONTENT_TYPE_OBJECT,
            body: OperationBody::None,
        };
        let response = self.failover.execute(&op).await?;
        drain_response(response).await;
        Ok(())
    }

    /// Fetches an object, optionally a byte range of it.
    ///
    /// The response body is not buffered; the caller consumes it from the
    /// returned response at their own pace, and drops it to cancel.
    pub async fn get(
        &self,
        key: &str,
        range: Option<(u64, u64)>,
        req_uid: &str,
    ) -> Result<Response<Incoming>> {
        validate_key(key)?;
        debug!(key, ?range, "get");
        let op = Operation {
            method: Method::GET,
            target: self.target(key),
            req_uid: first_uid(req_uid),
            range,
            usermd: None,
            content_type: CONTENT_TYPE_OBJECT,
            body: OperationBody::None,
        };
        self.failover.execute(&op).await
    }

    /// Probes an object's user metadata without fetching the payload.
    ///
    /// Returns the stored `x-scal-usermd` value, or `None` when the object
    /// carries no user metadata.
    pub async fn head(&self, key: &str, req_uid: &str) -> Result<Option<String>> {
        validate_key(key)?;
        debug!(key, "head");
        let op = Operation {
            method: Method::HEAD,
            target: self.target(key),
            req_uid: first_uid(req_uid),
            range: None,
            usermd: None,
            content_type: CONTENT_TYPE_OBJECT,
            body: OperationBody::None,
        };
        let response = self.failover.execute(&op).await?;
        Ok(response
            .headers()
            .get(HDR_USERMD)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.to_string()))
    }

    /// Deletes an object. A locked immutable replica (status 423) counts as
    /// success, the backend guarantees its eventual absence.
    pub async fn delete(&self, key: &str, req_uid: &str) -> Result<()> {
        validate_key(key)?;
        debug!(key, "delete");
        let op = Operation {
            method: Method::DELETE,
            target: self.target(key),
            req_uid: first_uid(req_uid),
            range: None,
            usermd: None,
            content_type: CONTENT_TYPE_OBJECT,
            body: OperationBody::None,
        };
        let response = self.failover.execute(&op).await?;
        drain_response(response).await;
        Ok(())
    }

    /// Deletes many keys, batching them into sub-requests of at most 1000
    /// keys with at most 5 in flight at once.
    ///
    /// All sub-batches run to completion; the first error observed, if any,
    /// is reported after the last one finishes.
    pub async fn batch_delete(&self, keys: &[String], req_uid: &str) -> Result<()> {
        if keys.is_empty() {
            return Err(SproxydError::InvalidArgument(
                "batch delete requires at least one key".to_string(),
            ));
        }
        for key in keys {
            validate_key(key)?;
        }
        let batches: Vec<Vec<String>> = keys
            .chunks(BATCH_MAX_KEYS)
            .map(|chunk| chunk.to_vec())
            .collect();
        debug!(keys = keys.len(), batches = batches.len(), "batch delete");

        let results: Vec<Result<()>> =
            futures::stream::iter(batches.into_iter().map(|batch| self.delete_batch(batch, req_uid)))
                .buffer_unordered(BATCH_CONCURRENCY)
                .collect()
                .await;
        results.into_iter().find(|r| r.is_err()).unwrap_or(Ok(()))
    }

    async fn delete_batch(&self, keys: Vec<String>, req_uid: &str) -> Result<()> {
        let payload = serde_json::to_vec(&BatchDeleteRequest { keys })
            .map_err(|e| SproxydError::Internal(format!("cannot encode batch body: {}", e)))?;
        let op = Operation {
            method: Method::POST,
            target: self.target(BATCH_DELETE_KEY),
            req_uid: first_uid(req_uid),
            range: None,
            usermd: None,
            content_type: CONTENT_TYPE_JSON,
            body: OperationBody::Full(Bytes::from(payload)),
        };
        let response = self.failover.execute(&op).await?;
        drain_response(response).await;
        Ok(())
    }

    /// Probes the ring by fetching the configuration document of the
    /// current endpoint. The full response is handed back to the caller.
    pub async fn healthcheck(&self) -> Result<Response<Incoming>> {
        let op = Operation {
            method: Method::GET,
            target: self.target(HEALTHCHECK_KEY),
            req_uid: String::new(),
            range: None,
            usermd: None,
            content_type: CONTENT_TYPE_OBJECT,
            body: OperationBody::None,
        };
        self.failover.execute(&op).await
    }

    /// The endpoint new operations will try first.
    pub fn current_endpoint(&self) -> Endpoint {
        self.pool.current()
    }

    /// All configured endpoints, in pool order.
    pub fn endpoints(&self) -> &[Endpoint] {
        self.pool.endpoints()
    }

    /// Releases this handle's share of the connection pool. Idle sockets
    /// close once the last clone is gone; in-flight operations finish
    /// through their normal paths.
    pub fn destroy(self) {
        debug!("sproxyd client destroyed");
    }

    async fn put_stream(
        &self,
        key: &str,
        body: BoxStream<'static, io::Result<Bytes>>,
        size: u64,
        req_uid: &str,
    ) -> Result<()> {
        debug!(key, size, "put");
        let op = Operation {
            method: Method::PUT,
            target: self.target(key),
            req_uid: first_uid(req_uid),
            range: None,
            usermd: None,
            content_type: CONTENT_TYPE_OBJECT,
            body: OperationBody::Stream(StreamSource::new(body, size)),
        };
        let response = self.failover.execute(&op).await?;
        drain_response(response).await;
        Ok(())
    }

    fn target(&self, key: &str) -> String {
        format!("{}{}", self.base_path, key)
    }
}

/// The trace chain is colon-joined; outbound headers carry its first UID.
fn first_uid(req_uid: &str) -> String {
    req_uid.split(':').next().unwrap_or("").to_string()
}

/// Consumes a response body whose content the operation does not need.
///
/// The outcome was already decided by the status line; a stream error at
/// this point must not produce a second completion, so it is only logged.
async fn drain_response(response: Response<Incoming>) {
    if let Err(e) = response.into_body().collect().await {
        error!(error = %e, "response stream errored after the outcome was delivered");
    }
}
