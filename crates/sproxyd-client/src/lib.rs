//! Client for sproxyd key-addressed object storage rings.
//!
//! # Overview
//!
//! A [`SproxydClient`] talks HTTP/1.1 to a pool of storage endpoints.
//! Callers hand it a byte stream plus routing parameters and get back an
//! opaque 40-hex-character key; the key later retrieves, probes or deletes
//! the payload. The client owns three responsibilities:
//!
//! - **Key generation**: a 20-byte identifier whose layout encodes routing
//!   hints, so the ring places objects without a catalog.
//! - **Failover**: endpoints are tried in pool order with a rotating head;
//!   outcomes are classified retryable or definite.
//! - **Streaming**: payloads are piped straight from the caller's stream
//!   into the socket once a connection is writable, and response bodies are
//!   streamed back without buffering.
//!
//! # Usage
//!
//! ```rust,no_run
//! use bytes::Bytes;
//! use sproxyd_client::{RoutingParams, SproxydClient, SproxydConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SproxydConfig {
//!         bootstrap: vec!["localhost:8181".to_string()],
//!         ..Default::default()
//!     };
//!     let client = SproxydClient::new(config)?;
//!
//!     let params = RoutingParams::new("bucket", "namespace", "owner");
//!     let payload = futures::stream::once(async { Ok(Bytes::from_static(b"hello")) });
//!     let key = client.put(payload, 5, &params, "req-uid-1").await?;
//!
//!     let response = client.get(&key, None, "req-uid-2").await?;
//!     drop(response);
//!     client.delete(&key, "req-uid-3").await?;
//!     Ok(())
//! }
//! ```
//!
//! # Connection management
//!
//! Sockets are kept alive and reused across requests by hyper's connection
//! pool; idle sockets are closed after the configured idle timeout and
//! every request is bounded by a total timeout. TCP_NODELAY is set on every
//! socket.

pub mod client;
pub mod config;
pub mod endpoint;

mod failover;
mod pipeline;
mod transport;

pub use client::SproxydClient;
pub use config::SproxydConfig;
pub use endpoint::{Endpoint, EndpointPool};

pub use sproxyd_common::error::{Result, SproxydError};
pub use sproxyd_common::key::{
    generate_key, validate_key, RoutingParams, DEFAULT_COS, KEY_LENGTH, SERVICE_ID,
};
