//! Object key generation.
//!
//! A key is 20 bytes rendered as 40 uppercase hex characters. The byte
//! layout encodes routing hints so the ring can place and locate the object
//! without a catalog:
//!
//! ```text
//! [0..8]   random
//! [8]      md5(namespace)[0]
//! [9]      md5(namespace)[1] ^ md5(owner)[0]
//! [10]     md5(owner)[1]
//! [11]     md5(owner)[2] ^ md5(bucket)[0]
//! [12..15] md5(bucket)[1..4]
//! [15]     service id (0x59)
//! [16..19] random
//! [19]     class of service
//! ```
//!
//! The layout is parsed byte-for-byte by the backend; every position is
//! load-bearing.

use md5::{Digest, Md5};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::{Result, SproxydError};

/// Service id byte embedded at offset 15 of every key.
pub const SERVICE_ID: u8 = 0x59;

/// Default class-of-service byte.
pub const DEFAULT_COS: u8 = 0x02;

/// Length of a rendered key, in hex characters.
pub const KEY_LENGTH: usize = 40;

/// Routing inputs for key generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingParams {
    pub bucket_name: String,
    pub namespace: String,
    pub owner: String,
}

impl RoutingParams {
    pub fn new(
        bucket_name: impl Into<String>,
        namespace: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            namespace: namespace.into(),
            owner: owner.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.bucket_name.is_empty() || self.namespace.is_empty() || self.owner.is_empty() {
            return Err(SproxydError::InvalidArgument(
                "routing params bucketName, namespace and owner must be non-empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Generates a new object key for the given routing params and cos byte.
///
/// Consumes 11 bytes from the OS entropy source; apart from that the
/// function is pure. Entropy failure is the only error path.
pub fn generate_key(params: &RoutingParams, cos: u8) -> Result<String> {
    params.validate()?;

    let hash_namespace = Md5::digest(params.namespace.as_bytes());
    let hash_owner = Md5::digest(params.owner.as_bytes());
    let hash_bucket = Md5::digest(params.bucket_name.as_bytes());

    let mut random = [0u8; 11];
    OsRng
        .try_fill_bytes(&mut random)
        .map_err(|e| SproxydError::Internal(format!("random source failure: {}", e)))?;

    let mut key = [0u8; 20];
    key[..8].copy_from_slice(&random[..8]);
    key[8] = hash_namespace[0];
    key[9] = hash_namespace[1] ^ hash_owner[0];
    key[10] = hash_owner[1];
    key[11] = hash_owner[2] ^ hash_bucket[0];
    key[12..15].copy_from_slice(&hash_bucket[1..4]);
    key[15] = SERVICE_ID;
    key[16..19].copy_from_slice(&random[8..11]);
    key[19] = cos;

    Ok(hex::encode_upper(key))
}

/// Validates a caller-supplied key.
///
/// The check counts characters, not bytes. The key alphabet is `[0-9A-F]` so
/// the two coincide, but the contract is a 40-character string.
pub fn validate_key(key: &str) -> Result<()> {
    if key.chars().count() != KEY_LENGTH {
        return Err(SproxydError::InvalidArgument(format!(
            "key must be exactly {} characters, got {:?}",
            KEY_LENGTH, key
        )));
    }
    Ok(())
}
