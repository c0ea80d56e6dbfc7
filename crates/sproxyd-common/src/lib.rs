//! Shared types for the sproxyd client: the object key format and the error
//! taxonomy. Everything that talks HTTP lives in `sproxyd-client`.

pub mod error;
pub mod key;

pub use error::{Result, SproxydError};
pub use key::{generate_key, validate_key, RoutingParams, DEFAULT_COS, KEY_LENGTH, SERVICE_ID};
