use thiserror::Error;

#[derive(Error, Debug)]
pub enum SproxydError {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Content digest mismatch: expected {expected}, computed {computed}")]
    InvalidDigest { expected: String, computed: String },

    #[error("Request failed with status {status}")]
    Http { status: u16 },

    #[error("Server error: status {status}")]
    Server { status: u16 },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection lost while streaming request body: {0}")]
    MidStream(String),

    #[error("Request body aborted by caller: {0}")]
    Aborted(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SproxydError {
    /// Whether a failover attempt against another endpoint may succeed.
    ///
    /// Transport failures happen before any request body byte was sent, so
    /// the request can be replayed. Server errors (5xx) indicate a daemon in
    /// a bad state; another endpoint of the ring may hold a healthy copy.
    /// Everything else has a definite answer or an unreplayable body.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SproxydError::Transport(_) | SproxydError::Server { .. }
        )
    }

    /// Whether the error is an expected, definite answer from the backend
    /// (e.g. 404 on a key never written). Log sinks downgrade these.
    pub fn is_expected(&self) -> bool {
        matches!(self, SproxydError::Http { .. })
    }

    /// The HTTP status carried by the error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            SproxydError::Http { status } | SproxydError::Server { status } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, SproxydError>;
