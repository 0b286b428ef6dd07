//! The `registry` module tracks every open WebSocket session and fans
//! broadcasts out to them.
//!
//! [`ConnectionRegistry`] is the only state shared between connections. It is
//! created once by the caller and handed to the server and to every
//! connection handler explicitly.

pub mod connection;

use std::collections::HashMap;

use parking_lot::RwLock;
use tracing::{debug, warn};
use tungstenite::protocol::Message as WsMessage;

pub use connection::{Connection, ConnectionId, SendOutcome};

/// The set of connections eligible for broadcast, keyed by id.
///
/// A connection is present exactly while its socket is open and past the
/// handshake. The lock is only held while frames are queued, never while
/// they are written, so it is safe to call every method from any task.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
        }
    }

    /// Registers a connection. Adding an id that is already present keeps
    /// the existing entry and returns `false`.
    pub fn add(&self, connection: Connection) -> bool {
        let mut connections = self.connections.write();
        if connections.contains_key(&connection.id) {
            return false;
        }
        debug!(conn_id = %connection.id, "registered connection");
        connections.insert(connection.id.clone(), connection);
        true
    }

    /// Removes a connection. Returns `false` if it was not registered, which
    /// makes repeated cleanup from racing failure paths harmless.
    pub fn remove(&self, id: &ConnectionId) -> bool {
        let removed = self.connections.write().remove(id).is_some();
        if removed {
            debug!(conn_id = %id, "removed connection");
        }
        removed
    }

    /// Queues `message` for every registered connection and returns how many
    /// accepted it.
    ///
    /// Delivery to one peer never waits on another: a full queue drops the
    /// frame for that peer only. Failed deliveries never unregister anyone;
    /// that is left to the connection's own lifecycle.
    pub fn broadcast(&self, message: &WsMessage) -> usize {
        let connections = self.connections.read();
        let mut queued = 0;
        for connection in connections.values() {
            match connection.send(message.clone()) {
                SendOutcome::Queued => queued += 1,
                SendOutcome::Dropped => warn!(
                    conn_id = %connection.id,
                    total_drops = connection.dropped_count(),
                    "outbound queue full, dropping broadcast"
                ),
                SendOutcome::Closed => {
                    debug!(conn_id = %connection.id, "skipping broadcast to closed connection")
                }
            }
        }
        debug!(recipients = connections.len(), queued, "broadcast message");
        queued
    }

    /// Queues `message` for a single connection.
    #[cfg(test)]
    pub fn send_to(&self, id: &ConnectionId, message: WsMessage) -> Option<SendOutcome> {
        self.connections
            .read()
            .get(id)
            .map(|connection| connection.send(message))
    }

    pub fn contains(&self, id: &ConnectionId) -> bool {
        self.connections.read().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Ids of the currently registered connections, in no particular order.
    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.read().keys().cloned().collect()
    }
}
