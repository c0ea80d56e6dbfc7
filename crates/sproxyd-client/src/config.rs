use std::time::Duration;

use sproxyd_common::key::DEFAULT_COS;

/// Base path used when no override is configured.
pub const DEFAULT_PATH: &str = "/proxy/arc/";

/// Base path selected when a chord cos is configured.
pub const CHORD_PATH: &str = "/proxy/chord/";

/// Client configuration.
///
/// The enumerated fields mirror what deployments put in their config files;
/// the surrounding application parses those and hands the result here.
#[derive(Debug, Clone)]
pub struct SproxydConfig {
    /// Seed endpoints, as `"host:port"` strings. The pool is built from this
    /// list; it must not be empty.
    pub bootstrap: Vec<String>,
    /// URL base path override. When unset the path is derived from the cos
    /// configuration.
    pub path: Option<String>,
    /// Overrides the default class-of-service byte and selects the chord
    /// base path.
    pub chord_cos: Option<u8>,
    /// Marks every write immutable via `X-Scal-Replica-Policy`.
    pub immutable: bool,
    /// Total per-request timeout, covering connect, transfer and response.
    pub request_timeout: Duration,
    /// How long an idle keep-alive socket is retained before being closed.
    pub idle_timeout: Duration,
}

impl Default for SproxydConfig {
    fn default() -> Self {
        Self {
            bootstrap: vec!["localhost:8181".to_string()],
            path: None,
            chord_cos: None,
            immutable: false,
            request_timeout: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl SproxydConfig {
    /// The effective class-of-service byte.
    pub fn cos(&self) -> u8 {
        self.chord_cos.unwrap_or(DEFAULT_COS)
    }

    /// The effective base path, always with a trailing slash.
    pub fn base_path(&self) -> String {
        let mut path = match &self.path {
            Some(p) => p.clone(),
            None if self.chord_cos.is_some() => CHORD_PATH.to_string(),
            None => DEFAULT_PATH.to_string(),
        };
        if !path.ends_with('/') {
            path.push('/');
        }
        path
    }
}
