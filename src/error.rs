//! Error types
//!
//!  Nothing here is fatal to the process: the worst outcome of any error is
//!  the loss of the message that caused it.

use thiserror::Error;

/// Failure to turn a raw payload into a canonical event.
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("payload is not valid UTF-8")]
    Utf8(#[from] std::str::Utf8Error),
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed CoT XML: {0}")]
    Xml(&'static str),
    #[error("unrecognized payload shape")]
    Unrecognized,
}

/// Transport failure on a listener.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
    #[error("message bus error: {0}")]
    Bus(#[from] zeromq::ZmqError),
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("gave up after {0} consecutive failures")]
    Exhausted(u32),
}

/// Failure reported by an outbound sink.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink rejected event: {0}")]
    Rejected(String),
    #[error("sink I/O error: {0}")]
    Io(#[from] std::io::Error),
}
