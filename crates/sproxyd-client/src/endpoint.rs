use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};

use rand::seq::SliceRandom;
use rand::Rng;

use sproxyd_common::error::{Result, SproxydError};

/// One `(host, port)` HTTP target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    /// Parses a `"host:port"` bootstrap string.
    pub fn parse(addr: &str) -> Result<Self> {
        let (host, port) = addr.rsplit_once(':').ok_or_else(|| {
            SproxydError::InvalidArgument(format!(
                "bootstrap entry {:?} is not of the form host:port",
                addr
            ))
        })?;
        let port = port.parse::<u16>().map_err(|_| {
            SproxydError::InvalidArgument(format!("bootstrap entry {:?} has an invalid port", addr))
        })?;
        if host.is_empty() {
            return Err(SproxydError::InvalidArgument(format!(
                "bootstrap entry {:?} has an empty host",
                addr
            )));
        }
        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Ordered endpoint list with a rotating head.
///
/// The list itself never changes after construction; failover only moves the
/// head preference forward. There is no eviction and no health tracking, so
/// every configured endpoint stays reachable through rotation.
#[derive(Debug)]
pub struct EndpointPool {
    endpoints: Vec<Endpoint>,
    head: AtomicUsize,
}

impl EndpointPool {
    /// Builds a pool from bootstrap strings, permuting the list once with
    /// `rng` to spread initial load across client instances.
    pub fn new(bootstrap: &[String], rng: &mut impl Rng) -> Result<Self> {
        if bootstrap.is_empty() {
            return Err(SproxydError::InvalidArgument(
                "bootstrap list must not be empty".to_string(),
            ));
        }
        let mut endpoints = bootstrap
            .iter()
            .map(|addr| Endpoint::parse(addr))
            .collect::<Result<Vec<_>>>()?;
        endpoints.shuffle(rng);
        Ok(Self {
            endpoints,
            head: AtomicUsize::new(0),
        })
    }

    /// The current head endpoint.
    pub fn current(&self) -> Endpoint {
        self.endpoints[self.head.load(Ordering::Acquire)].clone()
    }

    /// Rotates the head past `failed`, but only if the head still points at
    /// it. Two operations that observed the same failing head therefore
    /// advance it once, not twice; a stale caller whose endpoint was already
    /// rotated away is a no-op.
    pub fn rotate_past(&self, failed: &Endpoint) {
        let idx = self.head.load(Ordering::Acquire);
        if self.endpoints[idx] == *failed {
            let next = (idx + 1) % self.endpoints.len();
            let _ = self
                .head
                .compare_exchange(idx, next, Ordering::AcqRel, Ordering::Acquire);
        }
    }

    /// Number of endpoints in the pool. Also the retry budget of one
    /// logical operation.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// All endpoints, in pool order starting from position zero.
    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }
}
