use crate::state::FailureKind;

/// Error type returned by [`RequestHandler::fetch`](crate::RequestHandler::fetch).
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// Network or request execution error from `reqwest`.
    #[error("transport error: {0}")]
    Transport(reqwest::Error),
    /// The per-attempt cancellation timer fired before a response arrived.
    #[error("request to {url} timed out after {timeout_ms} ms")]
    Timeout { url: String, timeout_ms: u64 },
    /// Server answered with a 5xx status.
    #[error("server error: {status}")]
    Server { status: u16 },
    /// Server answered with 429 Too Many Requests.
    #[error("rate limited")]
    RateLimited,
    /// Server answered with 401; the stored credential has been cleared.
    #[error("unauthorized")]
    Unauthorized,
    /// The request could not be built (bad method, header or URL). Treated
    /// like a transport failure: retried, queued and eventually archived.
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl FetchError {
    /// Returns the failure classification used by the retry state machine.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Transport(_) | Self::InvalidRequest(_) => FailureKind::Transport,
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::Server { .. } => FailureKind::ServerError,
            Self::RateLimited => FailureKind::RateLimited,
            Self::Unauthorized => FailureKind::Unauthorized,
        }
    }

    /// Whether another attempt may succeed.
    pub fn is_retryable(&self) -> bool {
        self.kind().is_retryable()
    }
}

/// Error raised by a [`Storage`](crate::Storage) backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Filesystem error from a file-backed store.
    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
    /// Stored value is not valid JSON for the expected shape.
    #[error("storage decode error: {0}")]
    Json(#[from] serde_json::Error),
    /// Key contains characters that cannot be mapped to a storage slot.
    #[error("invalid storage key '{0}'")]
    InvalidKey(String),
}
