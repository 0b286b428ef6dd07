//! # wsbroadcast
//!
//! `wsbroadcast` is a small WebSocket broadcast server. Every text message a
//! client sends is rebroadcast to every connected client, prefixed with a
//! timestamp and the sender's connection id:
//! `<timestamp><connection-id>===>>><text>`.
//!
//! ## Core Modules
//!
//! - `registry`: the shared set of open connections and the broadcast fan-out.
//! - `handler`: the per-connection state machine that turns frames into actions.
//! - `transport`: the HTTP upgrade handshake and the listener driving each connection.
//! - `config`: loading server settings from files and the environment.
//! - `utils`: error types and logging setup.

pub mod config;
pub mod handler;
pub mod registry;
pub mod transport;
pub mod utils;
