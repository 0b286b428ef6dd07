//! WebSocket transport
//!
//! This file implements the broadcast server. Responsibilities:
//! - Accept TCP connections and run the HTTP upgrade for each of them
//! - Create a `ConnectionHandler` per connection and feed it inbound frames
//! - Drain each connection's outbound queue on a dedicated writer task
//! - Keep failures and panics confined to the connection they happen on
//! - Stop accepting on shutdown and give open connections a grace period

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tracing::{Instrument, debug, error, info, info_span, warn};
use tungstenite::protocol::{Message as WsMessage, WebSocketConfig};

use crate::config::Settings;
use crate::handler::{ConnectionEvents, ConnectionHandler, ConnectionState, InboundMessage};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::transport::handshake;
use crate::utils::error::{ConnectionError, HandshakeError, ServerError};

/// How long a cleanly closing connection may take to flush its last frames.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(1);

/// What every connection task needs from the server.
#[derive(Debug, Clone)]
struct ConnectionContext {
    registry: Arc<ConnectionRegistry>,
    path: Arc<str>,
    max_request_bytes: usize,
    queue_capacity: usize,
    ws_config: WebSocketConfig,
}

/// Accepts connections and wires each one to a handler and the shared registry.
pub struct BroadcastServer {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    settings: Settings,
}

impl BroadcastServer {
    /// Binds the listener described by `settings.server`.
    pub async fn bind(
        settings: Settings,
        registry: Arc<ConnectionRegistry>,
    ) -> Result<Self, ServerError> {
        let addr = settings.server.bind_addr();
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(Self {
            listener,
            registry,
            settings,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    /// Serves until `shutdown` resolves, then closes every open connection.
    ///
    /// Connections get `server.shutdown_grace_secs` to finish their closing
    /// handshake before they are aborted.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let ctx = ConnectionContext {
            registry: self.registry.clone(),
            path: Arc::from(self.settings.server.path.as_str()),
            max_request_bytes: self.settings.connection.max_request_bytes,
            queue_capacity: self.settings.connection.outbound_queue_capacity.max(1),
            ws_config: WebSocketConfig::default()
                .max_message_size(Some(self.settings.connection.max_message_bytes)),
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut connections = JoinSet::new();

        if let Ok(addr) = self.listener.local_addr() {
            info!("WebSocket server listening on ws://{addr}{}", ctx.path);
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                biased;

                () = &mut shutdown => {
                    info!("Shutdown signal received, no longer accepting connections.");
                    break;
                }

                Some(res) = connections.join_next() => log_task_outcome(res),

                res = self.listener.accept() => match res {
                    Ok((stream, peer)) => {
                        let _ = connections.spawn(serve_connection(
                            stream,
                            peer,
                            ctx.clone(),
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "failed to accept connection"),
                },
            }
        }

        drop(self.listener);
        if shutdown_tx.send(true).is_err() {
            debug!("no connection is listening for shutdown");
        }

        let grace = Duration::from_secs(self.settings.server.shutdown_grace_secs);
        let drained = tokio::time::timeout(grace, async {
            while let Some(res) = connections.join_next().await {
                log_task_outcome(res);
            }
        })
        .await;
        if drained.is_err() {
            warn!(
                remaining = connections.len(),
                "grace period elapsed, aborting open connections"
            );
            connections.shutdown().await;
        }
        info!("Server shutdown complete.");
    }
}

/// Binds with `settings` and serves until `shutdown` resolves.
pub async fn start_websocket_server<F>(
    settings: Settings,
    registry: Arc<ConnectionRegistry>,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()>,
{
    let server = BroadcastServer::bind(settings, registry).await?;
    server.run(shutdown).await;
    Ok(())
}

fn log_task_outcome(res: Result<(), JoinError>) {
    match res {
        Ok(()) => {}
        Err(e) if e.is_panic() => error!("A connection handler panicked: {e:?}"),
        Err(e) => debug!("connection task cancelled: {e}"),
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    ctx: ConnectionContext,
    shutdown: watch::Receiver<bool>,
) {
    let id = ConnectionId::generate();
    let span = info_span!("connection", conn_id = %id, %peer);

    async move {
        debug!("accepted connection");
        let mut handler = ConnectionHandler::new(id, ctx.registry.clone());
        match drive_connection(stream, &mut handler, &ctx, shutdown).await {
            Ok(()) => {}
            Err(ConnectionError::Handshake(HandshakeError::Closed)) => {
                debug!("peer left before completing the handshake")
            }
            Err(ConnectionError::Handshake(e)) => info!(error = %e, "handshake rejected"),
            // already logged by the handler
            Err(ConnectionError::UnsupportedFrame) => {}
            Err(e) => warn!(error = %e, "connection terminated"),
        }
        handler.handle_disconnect();
    }
    .instrument(span)
    .await
}

/// Runs one connection from the first request byte until the handler is done.
async fn drive_connection<S, E>(
    mut stream: S,
    events: &mut E,
    ctx: &ConnectionContext,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ConnectionError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    E: ConnectionEvents,
{
    let (request, tail) = match handshake::read_request(&mut stream, ctx.max_request_bytes).await {
        Ok(parsed) => parsed,
        Err(e) => {
            reject(&mut stream, &e).await;
            return Err(e.into());
        }
    };
    if let Err(e) = handshake::validate_upgrade(&request, &ctx.path) {
        reject(&mut stream, &e).await;
        return Err(e.into());
    }
    let Some(handshaker) = handshake::try_handshake(&request) else {
        let e = HandshakeError::UnsupportedVersion;
        reject(&mut stream, &e).await;
        return Err(e.into());
    };

    let ws_stream = handshaker
        .complete(stream, tail, ctx.ws_config.clone())
        .await?;
    let (sink, mut source) = ws_stream.split();
    let (tx, rx) = mpsc::channel::<WsMessage>(ctx.queue_capacity);
    let mut writer = spawn_writer(sink, rx);

    events.handle_connect(tx);
    let result = read_frames(&mut source, events, &mut writer, shutdown).await;
    // unregisters and releases the handler's sender, which lets the writer finish
    events.handle_disconnect();

    // `read_frames` only returns Ok while the writer is still unjoined
    match result {
        Ok(()) => {
            if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut writer)
                .await
                .is_err()
            {
                debug!("writer did not drain in time, aborting it");
                writer.abort();
            }
        }
        Err(_) => writer.abort(),
    }
    result
}

async fn reject<S>(stream: &mut S, err: &HandshakeError)
where
    S: AsyncWrite + Unpin,
{
    if let Err(e) = handshake::reject(stream, err).await {
        debug!(error = %e, "failed to send handshake rejection");
    }
}

fn spawn_writer<K>(
    mut sink: K,
    mut outbound: mpsc::Receiver<WsMessage>,
) -> JoinHandle<Result<(), tungstenite::Error>>
where
    K: futures_util::Sink<WsMessage, Error = tungstenite::Error> + Unpin + Send + 'static,
{
    tokio::spawn(
        async move {
            let mut outcome = Ok(());
            while let Some(message) = outbound.recv().await {
                let is_close = message.is_close();
                if let Err(e) = sink.send(message).await {
                    // a close after the peer's close is answered by the protocol layer
                    if !is_close {
                        debug!(error = %e, "failed to write frame");
                        outcome = Err(e);
                    }
                    break;
                }
                if is_close {
                    break;
                }
            }
            if let Err(e) = sink.close().await {
                debug!(error = %e, "failed to close sink");
            }
            debug!("send loop closed");
            outcome
        }
        .in_current_span(),
    )
}

/// Feeds inbound frames to `events` until the connection leaves `Open`.
///
/// Also returns when the writer ends first: a connection that can no longer
/// be written to is closed even if its read side is still healthy.
pub(super) async fn read_frames<R, E>(
    source: &mut R,
    events: &mut E,
    writer: &mut JoinHandle<Result<(), tungstenite::Error>>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ConnectionError>
where
    R: futures_util::Stream<Item = Result<WsMessage, tungstenite::Error>> + Unpin,
    E: ConnectionEvents,
{
    while events.state() == ConnectionState::Open {
        let frame = tokio::select! {
            frame = source.next() => frame,
            outcome = &mut *writer => {
                return Err(match outcome {
                    Ok(Err(e)) => ConnectionError::Transport(e),
                    Ok(Ok(())) | Err(_) => ConnectionError::WriterStopped,
                });
            }
            _ = shutdown.changed() => {
                events.handle_shutdown();
                return Ok(());
            }
        };

        match frame {
            None
            | Some(Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed)) => {
                return Ok(());
            }
            Some(Err(e)) => return Err(ConnectionError::Transport(e)),
            Some(Ok(message)) => events.handle_frame(InboundMessage::from(message))?,
        }
    }
    Ok(())
}
