use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("server rejected subscription with status {0}")]
    Rejected(u16),
    #[error("stream read failed: {0}")]
    Read(String),
}

/// Failure to load an authoritative snapshot. `Display` is the message shown
/// to the user; the cache is left untouched when this is returned.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("session {0} not found")]
    NotFound(String),
    #[error("server returned status {status}: {message}")]
    Status { status: u16, message: String },
    #[error("network error: {0}")]
    Network(String),
    #[error("invalid response body: {0}")]
    Decode(String),
}
