use std::sync::Arc;

use chrono::Local;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::{CloseFrame, Message as WsMessage};

use super::ConnectionEvents;
use super::message::{InboundMessage, OutboundEnvelope, Target, format_broadcast};
use crate::registry::{Connection, ConnectionId, ConnectionRegistry, SendOutcome};
use crate::utils::error::ConnectionError;

/// Lifecycle of one connection. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Per-connection state and frame dispatch.
///
/// The handler owns the connection's registry membership: it registers on
/// [`handle_connect`](ConnectionEvents::handle_connect) and unregisters on
/// [`handle_disconnect`](ConnectionEvents::handle_disconnect) or when it is
/// dropped, whichever comes first.
#[derive(Debug)]
pub struct ConnectionHandler {
    id: ConnectionId,
    state: ConnectionState,
    registry: Arc<ConnectionRegistry>,
    connection: Option<Connection>,
}

impl ConnectionHandler {
    pub fn new(id: ConnectionId, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            id,
            state: ConnectionState::Connecting,
            registry,
            connection: None,
        }
    }

    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Decides what one frame turns into. Only meaningful while `Open`;
    /// frames arriving in any other state are ignored.
    pub fn dispatch(
        &mut self,
        message: InboundMessage,
    ) -> Result<Option<OutboundEnvelope>, ConnectionError> {
        if self.state != ConnectionState::Open {
            debug!(conn_id = %self.id, state = ?self.state, "ignoring frame outside open state");
            return Ok(None);
        }

        match message {
            InboundMessage::Text(text) => {
                info!(conn_id = %self.id, "received message: [{text}]");
                let payload = format_broadcast(&Local::now(), &self.id, &text);
                Ok(Some(OutboundEnvelope::broadcast(WsMessage::text(payload))))
            }
            // tungstenite also answers pings on its own; peers may see two pongs
            InboundMessage::Ping(data) => Ok(Some(OutboundEnvelope::reply(WsMessage::Pong(data)))),
            InboundMessage::Pong(_) => Ok(None),
            InboundMessage::Close(frame) => {
                debug!(conn_id = %self.id, ?frame, "peer started closing handshake");
                self.state = ConnectionState::Closing;
                Ok(Some(OutboundEnvelope::reply(WsMessage::Close(frame))))
            }
            InboundMessage::BinaryRejected => {
                self.state = ConnectionState::Closing;
                Err(ConnectionError::UnsupportedFrame)
            }
        }
    }

    /// Hands an envelope to the registry or to this connection's own queue.
    fn deliver(&self, envelope: OutboundEnvelope) {
        match envelope.target {
            Target::Broadcast => {
                self.registry.broadcast(&envelope.message);
            }
            Target::RespondToSender => self.reply(envelope.message),
        }
    }

    fn reply(&self, message: WsMessage) {
        let Some(connection) = &self.connection else {
            return;
        };
        // Replies share the queue with broadcasts so they stay in order.
        match connection.send(message) {
            SendOutcome::Queued => {}
            SendOutcome::Dropped => warn!(conn_id = %self.id, "outbound queue full, dropping reply"),
            SendOutcome::Closed => debug!(conn_id = %self.id, "reply after writer stopped"),
        }
    }
}

impl ConnectionEvents for ConnectionHandler {
    fn handle_connect(&mut self, outbound: mpsc::Sender<WsMessage>) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        let connection = Connection::new(self.id.clone(), outbound);
        self.registry.add(connection.clone());
        self.connection = Some(connection);
        self.state = ConnectionState::Open;
        info!(conn_id = %self.id, "client connected");
    }

    fn handle_frame(&mut self, message: InboundMessage) -> Result<(), ConnectionError> {
        match self.dispatch(message) {
            Ok(Some(envelope)) => {
                self.deliver(envelope);
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                error!(conn_id = %self.id, error = %e, "closing connection on protocol violation");
                Err(e)
            }
        }
    }

    fn handle_shutdown(&mut self) {
        if self.state != ConnectionState::Open {
            return;
        }
        self.state = ConnectionState::Closing;
        self.reply(WsMessage::Close(Some(CloseFrame {
            code: CloseCode::Away,
            reason: "server shutting down".into(),
        })));
    }

    fn handle_disconnect(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        let was_registered = self.state != ConnectionState::Connecting;
        self.state = ConnectionState::Closed;
        self.connection = None;
        if was_registered && self.registry.remove(&self.id) {
            info!(conn_id = %self.id, "client disconnected");
        }
    }

    fn state(&self) -> ConnectionState {
        self.state
    }
}

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.handle_disconnect();
    }
}
