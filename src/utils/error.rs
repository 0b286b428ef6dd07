//! Error types for every layer of the server.
//!
//! All of them are connection-scoped except [`ServerError`]: a failing
//! connection ends in one of these values being logged at the connection
//! boundary, never in a panic or in the listener stopping.

use std::io;

use thiserror::Error;
use tungstenite::http::StatusCode;

/// Reasons an HTTP upgrade request does not become a WebSocket session.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("i/o error during handshake: {0}")]
    Io(#[from] io::Error),

    #[error("peer closed the connection before sending a complete request")]
    Closed,

    #[error("malformed upgrade request: {0}")]
    Malformed(String),

    #[error("request head exceeds {0} bytes")]
    RequestTooLarge(usize),

    #[error("request is not a websocket upgrade")]
    NotUpgrade,

    #[error("no websocket endpoint at {0}")]
    WrongPath(String),

    #[error("unsupported websocket version")]
    UnsupportedVersion,
}

impl HandshakeError {
    /// HTTP status answered to the peer, if any response is sent at all.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            HandshakeError::Io(_) | HandshakeError::Closed => None,
            HandshakeError::Malformed(_)
            | HandshakeError::RequestTooLarge(_)
            | HandshakeError::NotUpgrade => Some(StatusCode::BAD_REQUEST),
            HandshakeError::WrongPath(_) => Some(StatusCode::NOT_FOUND),
            HandshakeError::UnsupportedVersion => Some(StatusCode::UPGRADE_REQUIRED),
        }
    }
}

/// Why a single connection terminated abnormally.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("binary frames are not supported")]
    UnsupportedFrame,

    #[error("transport failure: {0}")]
    Transport(#[from] tungstenite::Error),

    #[error("outbound writer stopped while the connection was open")]
    WriterStopped,
}

/// Fatal errors of the listener itself.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}
