use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::{self, error::TrySendError};
use tungstenite::protocol::Message as WsMessage;

/// Identifier assigned to a connection when it is accepted.
///
/// Rendered as 32 lower-case hex digits; it is part of every broadcast payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Outcome of queueing one frame for a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Queued,
    /// The peer's queue is full; the frame was dropped for this peer only.
    Dropped,
    /// The peer's writer is gone.
    Closed,
}

/// Represents a live, post-handshake WebSocket session.
///
/// Frames are never written to the socket from here: they are queued on a
/// bounded channel drained by the connection's own writer task, so a slow
/// peer only ever fills its own queue.
#[derive(Debug, Clone)]
pub struct Connection {
    /// Unique identifier for the connection.
    pub id: ConnectionId,

    /// Channel feeding the connection's writer task.
    pub sender: mpsc::Sender<WsMessage>,

    dropped: Arc<AtomicU64>,
}

impl Connection {
    pub fn new(id: ConnectionId, sender: mpsc::Sender<WsMessage>) -> Self {
        Self {
            id,
            sender,
            dropped: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Queues `message` without waiting for queue space.
    pub fn send(&self, message: WsMessage) -> SendOutcome {
        match self.sender.try_send(message) {
            Ok(()) => SendOutcome::Queued,
            Err(TrySendError::Full(_)) => {
                let _ = self.dropped.fetch_add(1, Ordering::Relaxed);
                SendOutcome::Dropped
            }
            Err(TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }

    /// False once the writer task has stopped draining the queue.
    #[cfg(test)]
    pub fn is_alive(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Frames dropped so far because the queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
