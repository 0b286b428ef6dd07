//! The `transport` module is responsible for the network side of the server.
//!
//! `handshake` turns an HTTP upgrade request into a WebSocket stream or an
//! HTTP error answer; `websocket` runs the listener and drives each accepted
//! connection through its `ConnectionHandler`.

pub mod handshake;
pub mod websocket;

pub use websocket::{BroadcastServer, start_websocket_server};

#[cfg(test)]
mod websocket_tests;
