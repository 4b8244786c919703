use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("negotiation failed: {0}")]
    Negotiation(String),
    #[error("channel is not open")]
    NotOpen,
    #[error("channel closed")]
    ChannelClosed,
    #[error("peer closed before it became ready")]
    PeerClosed,
    #[error("already joined a room")]
    AlreadyJoined,
    #[error("join() must be called first")]
    NotJoined,
    #[error("signalling error: {0}")]
    Signalling(String),
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("json codec error: {0}")]
    Json(#[from] serde_json::Error),
}

pub(crate) fn to_setup_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

pub(crate) fn to_negotiation_error<E: std::fmt::Display>(err: E) -> TransportError {
    TransportError::Negotiation(err.to_string())
}
