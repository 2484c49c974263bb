use serde::Serialize;
use thiserror::Error;

/// A malformed upstream buffer. Recorded on the frame, never returned as `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DecodeError {
    #[error("empty frame buffer")]
    Empty,
    #[error("frame buffer length {len} is not a multiple of 4")]
    Misaligned { len: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[error("invalid {field}: {reason}")]
pub struct ValidationError {
    pub field: String,
    pub reason: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectionError {
    #[error("upstream url must not be empty")]
    EmptyUrl,
    #[error("failed to connect to {url}: {reason}")]
    Unreachable { url: String, reason: String },
    #[error("timed out connecting to {url}")]
    Timeout { url: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("client transport closed")]
    Closed,
    #[error("client send failed: {0}")]
    Send(String),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BroadcasterError {
    #[error("client {client_id:?} is already registered")]
    Conflict { client_id: String },
    #[error("client limit of {max} reached")]
    CapacityExceeded { max: usize },
    #[error("client {client_id:?} is not registered")]
    UnknownClient { client_id: String },
    #[error("broadcaster has been destroyed")]
    Closed,
    #[error(transparent)]
    Validation(#[from] ValidationError),
}
