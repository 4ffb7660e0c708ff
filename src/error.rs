use thiserror::Error;

/// Error taxonomy for the sync core.
///
/// `Transport` is recoverable by reconnect/backoff. `Malformed` and
/// `UnknownEventType` are dropped with a logged warning and never end the
/// stream loop. `Unauthorized` forces a session-level logout.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport failure: {0}")]
    Transport(#[from] anyhow::Error),
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("unknown event type '{0}'")]
    UnknownEventType(String),
    #[error("resource not found")]
    NotFound,
    #[error("authorization rejected by server")]
    Unauthorized,
    #[error("server rejected request with status {status}")]
    Api { status: u16 },
    #[error("client is not connected")]
    NotConnected,
}

pub type Result<T> = std::result::Result<T, ClientError>;
