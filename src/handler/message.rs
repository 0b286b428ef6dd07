use std::fmt::Display;

use bytes::Bytes;
use chrono::{DateTime, TimeZone};
use tungstenite::protocol::CloseFrame;
use tungstenite::protocol::Message as WsMessage;

use crate::registry::ConnectionId;

/// Separator between the sender prefix and the original text.
pub const BROADCAST_SEPARATOR: &str = "===>>>";

/// One frame received from a peer, as seen by the handler.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Text(String),
    Ping(Bytes),
    Pong(Bytes),
    Close(Option<CloseFrame>),
    /// A binary (or otherwise unsupported) frame. Never processed.
    BinaryRejected,
}

impl From<WsMessage> for InboundMessage {
    fn from(message: WsMessage) -> Self {
        match message {
            WsMessage::Text(text) => InboundMessage::Text(text.as_str().to_owned()),
            WsMessage::Ping(data) => InboundMessage::Ping(data),
            WsMessage::Pong(data) => InboundMessage::Pong(data),
            WsMessage::Close(frame) => InboundMessage::Close(frame),
            WsMessage::Binary(_) | WsMessage::Frame(_) => InboundMessage::BinaryRejected,
        }
    }
}

/// Who receives an [`OutboundEnvelope`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Broadcast,
    RespondToSender,
}

/// A frame produced by the handler together with where it goes.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundEnvelope {
    pub message: WsMessage,
    pub target: Target,
}

impl OutboundEnvelope {
    pub fn broadcast(message: WsMessage) -> Self {
        Self {
            message,
            target: Target::Broadcast,
        }
    }

    pub fn reply(message: WsMessage) -> Self {
        Self {
            message,
            target: Target::RespondToSender,
        }
    }
}

/// Renders a timestamp the way existing clients expect it,
/// e.g. `Tue Jun 02 21:12:00 +08:00 2020`.
pub fn format_timestamp<Tz>(at: &DateTime<Tz>) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    at.format("%a %b %d %H:%M:%S %:z %Y").to_string()
}

/// Builds the broadcast payload `<timestamp><id>===>>><text>`.
pub fn format_broadcast<Tz>(at: &DateTime<Tz>, id: &ConnectionId, text: &str) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    format!(
        "{}{}{}{}",
        format_timestamp(at),
        id,
        BROADCAST_SEPARATOR,
        text
    )
}
