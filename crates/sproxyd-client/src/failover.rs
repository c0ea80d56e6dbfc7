use std::sync::Arc;

use hyper::body::Incoming;
use hyper::Response;
use tracing::{debug, info, warn};

use sproxyd_common::error::Result;

use crate::endpoint::EndpointPool;
use crate::pipeline::{Operation, RequestPipeline};

/// Wraps one logical operation in the retry loop over the endpoint pool.
///
/// The retry budget is the pool length: each endpoint gets at most one shot
/// per operation. The endpoint used by an attempt is snapshotted before
/// dispatch and handed back to `rotate_past`, so concurrent operations that
/// hit the same failing head collectively advance it once.
#[derive(Clone)]
pub(crate) struct FailoverController {
    pool: Arc<EndpointPool>,
    pipeline: RequestPipeline,
}

impl FailoverController {
    pub fn new(pool: Arc<EndpointPool>, pipeline: RequestPipeline) -> Self {
        Self { pool, pipeline }
    }

    pub async fn execute(&self, op: &Operation) -> Result<Response<Incoming>> {
        let mut attempts = 0;
        loop {
            let endpoint = self.pool.current();
            match self.pipeline.dispatch(op, &endpoint).await {
                Ok(response) => {
                    if attempts > 0 {
                        info!(
                            endpoint = %endpoint,
                            attempts = attempts + 1,
                            target = %op.target,
                            "request succeeded after failover"
                        );
                    }
                    return Ok(response);
                }
                Err(err) if err.is_expected() => {
                    debug!(endpoint = %endpoint, target = %op.target, status = ?err.status(), "definite answer, no retry");
                    return Err(err);
                }
                Err(err) => {
                    attempts += 1;
                    // a consumed payload stream cannot be replayed, whatever
                    // the error kind says
                    let replayable = !op.streaming_started();
                    if !err.is_retryable() || !replayable || attempts >= self.pool.len() {
                        warn!(
                            endpoint = %endpoint,
                            target = %op.target,
                            error = %err,
                            attempts,
                            "request failed"
                        );
                        return Err(err);
                    }
                    warn!(
                        endpoint = %endpoint,
                        target = %op.target,
                        error = %err,
                        attempt = attempts,
                        "endpoint failed, rotating to the next one"
                    );
                    self.pool.rotate_past(&endpoint);
                }
            }
        }
    }
}
