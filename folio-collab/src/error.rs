//! Error types shared across the collaboration layer.

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Errors raised by the document replica and the editor-facing HTML seam.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CollabError {
    #[error("Invalid room identifier: {0}")]
    InvalidRoom(String),
    #[error("Malformed update delta: {0}")]
    MalformedDelta(String),
    #[error("Malformed state vector: {0}")]
    MalformedStateVector(String),
    #[error("Failed to merge update: {0}")]
    Merge(String),
    #[error("No {expected} at path {path:?}")]
    InvalidPath { path: Vec<u32>, expected: &'static str },
    #[error("Index {index} out of range (length {len}) at path {path:?}")]
    OutOfRange { path: Vec<u32>, index: u32, len: u32 },
    #[error("Invalid tag, attribute or mark name: {0:?}")]
    InvalidName(String),
    #[error("Malformed HTML: {0}")]
    Html(String),
}

/// Errors raised by the transport bridge connection lifecycle.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Server rejected the session credentials")]
    Unauthorized,
    #[error("Gave up after {attempts} failed connection attempts")]
    RetriesExhausted { attempts: u32 },
    #[error("Transport was closed")]
    Closed,
    #[error("Invalid connection request: {0}")]
    InvalidRequest(String),
    #[error("Connection attempt timed out")]
    Timeout,
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
