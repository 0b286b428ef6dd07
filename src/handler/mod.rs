//! The `handler` module holds the per-connection state machine.
//!
//! A [`ConnectionHandler`] is created for every accepted socket and turns the
//! connection's lifecycle events and inbound frames into registry actions.
//! The transport drives it through the [`ConnectionEvents`] trait and never
//! inspects frames itself.

pub mod connection_handler;
pub mod message;

use tokio::sync::mpsc;
use tungstenite::protocol::Message as WsMessage;

use crate::utils::error::ConnectionError;

pub use connection_handler::{ConnectionHandler, ConnectionState};
pub use message::{
    BROADCAST_SEPARATOR, InboundMessage, OutboundEnvelope, Target, format_broadcast,
    format_timestamp,
};

/// Callbacks a transport driver invokes on a connection.
pub trait ConnectionEvents {
    /// The handshake completed; `outbound` feeds the connection's writer.
    fn handle_connect(&mut self, outbound: mpsc::Sender<WsMessage>);

    /// One frame arrived. An error means the connection must be failed.
    fn handle_frame(&mut self, message: InboundMessage) -> Result<(), ConnectionError>;

    /// The server is shutting down; start the closing handshake.
    fn handle_shutdown(&mut self);

    /// The transport is gone. Safe to call any number of times.
    fn handle_disconnect(&mut self);

    fn state(&self) -> ConnectionState;
}
