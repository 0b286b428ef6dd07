use crate::config::Settings;
use crate::handler::{ConnectionEvents, ConnectionHandler};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::transport::websocket::{BroadcastServer, read_frames};
use crate::utils::error::ConnectionError;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const STEP: Duration = Duration::from_secs(5);

struct TestServer {
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry>,
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl TestServer {
    fn url(&self) -> String {
        format!("ws://{}/websocket", self.addr)
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        timeout(STEP, self.handle)
            .await
            .expect("server did not stop")
            .expect("server task failed");
    }
}

async fn setup_server() -> TestServer {
    let mut settings = Settings::default();
    settings.server.host = "127.0.0.1".to_string();
    settings.server.port = 0;
    settings.server.shutdown_grace_secs = 2;

    let registry = Arc::new(ConnectionRegistry::new());
    let server = BroadcastServer::bind(settings, registry.clone())
        .await
        .expect("bind failed");
    let addr = server.local_addr().expect("local addr");
    let (tx, rx) = oneshot::channel::<()>();
    let handle = tokio::spawn(server.run(async {
        let _ = rx.await;
    }));

    TestServer {
        addr,
        registry,
        shutdown: Some(tx),
        handle,
    }
}

async fn connect(server: &TestServer, expected: usize) -> Client {
    let (ws, _response) = connect_async(server.url())
        .await
        .expect("WebSocket handshake failed");
    wait_for_len(&server.registry, expected).await;
    ws
}

async fn wait_for_len(registry: &ConnectionRegistry, expected: usize) {
    timeout(STEP, async {
        while registry.len() != expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("registry never reached {expected} connections"));
}

async fn next_text(ws: &mut Client) -> String {
    loop {
        let msg = timeout(STEP, ws.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("read failed");
        match msg {
            WsMessage::Text(text) => return text.as_str().to_owned(),
            WsMessage::Pong(_) => continue,
            other => panic!("Expected a text message, got {other:?}"),
        }
    }
}

async fn assert_silent(ws: &mut Client) {
    if let Ok(msg) = timeout(Duration::from_millis(200), ws.next()).await {
        panic!("Expected no message, got {msg:?}");
    }
}

/// Splits `<timestamp><id>===>>><text>` into the 32-digit id and the text.
fn split_payload(payload: &str) -> (String, String) {
    let (prefix, text) = payload
        .split_once("===>>>")
        .unwrap_or_else(|| panic!("missing separator in {payload}"));
    assert!(prefix.len() > 32, "missing timestamp in {payload}");
    let id = &prefix[prefix.len() - 32..];
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    (id.to_string(), text.to_string())
}

async fn raw_request(addr: SocketAddr, request: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.expect("Failed to connect");
    stream.write_all(request.as_bytes()).await.unwrap();
    let mut response = Vec::new();
    timeout(STEP, stream.read_to_end(&mut response))
        .await
        .expect("server did not close the connection")
        .unwrap();
    String::from_utf8(response).unwrap()
}

fn upgrade_request(path: &str) -> String {
    format!(
        "GET {path} HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n"
    )
}

async fn read_response_head(stream: &mut TcpStream) -> String {
    let mut head = Vec::new();
    let mut byte = [0u8; 1];
    while !head.ends_with(b"\r\n\r\n") {
        timeout(STEP, stream.read_exact(&mut byte))
            .await
            .expect("timed out reading the response head")
            .unwrap();
        head.push(byte[0]);
    }
    String::from_utf8(head).unwrap()
}

#[tokio::test]
async fn test_broadcast_reaches_every_connection() {
    let server = setup_server().await;
    let mut a = connect(&server, 1).await;
    let mut b = connect(&server, 2).await;
    let mut c = connect(&server, 3).await;

    b.send(WsMessage::text("hi all")).await.unwrap();

    let payload_a = next_text(&mut a).await;
    let payload_b = next_text(&mut b).await;
    let payload_c = next_text(&mut c).await;
    assert_eq!(payload_a, payload_b);
    assert_eq!(payload_b, payload_c);
    let (id, text) = split_payload(&payload_a);
    assert_eq!(text, "hi all");
    assert!(server.registry.ids().iter().any(|known| known.as_str() == id));

    assert_silent(&mut a).await;
    server.stop().await;
}

#[tokio::test]
async fn test_messages_from_one_sender_arrive_in_order() {
    let server = setup_server().await;
    let mut a = connect(&server, 1).await;
    let mut b = connect(&server, 2).await;

    for i in 0..50 {
        a.send(WsMessage::text(format!("m{i}"))).await.unwrap();
    }

    for i in 0..50 {
        let (_, text) = split_payload(&next_text(&mut b).await);
        assert_eq!(text, format!("m{i}"));
    }
    server.stop().await;
}

#[tokio::test]
async fn test_ping_is_answered_to_sender_only() {
    let server = setup_server().await;
    let mut a = connect(&server, 1).await;
    let mut b = connect(&server, 2).await;

    a.send(WsMessage::Ping(Bytes::from_static(b"heartbeat")))
        .await
        .unwrap();

    let reply = timeout(STEP, a.next())
        .await
        .expect("no pong")
        .expect("stream ended")
        .unwrap();
    assert_eq!(reply, WsMessage::Pong(Bytes::from_static(b"heartbeat")));
    assert_silent(&mut b).await;
    assert_eq!(server.registry.len(), 2);
    server.stop().await;
}

#[tokio::test]
async fn test_binary_frame_closes_only_that_connection() {
    let server = setup_server().await;
    let mut a = connect(&server, 1).await;
    let mut b = connect(&server, 2).await;

    a.send(WsMessage::Binary(Bytes::from_static(&[1, 2, 3])))
        .await
        .unwrap();

    wait_for_len(&server.registry, 1).await;
    match timeout(STEP, a.next()).await.expect("connection not closed") {
        None | Some(Err(_)) => {}
        Some(Ok(msg)) => panic!("Expected the connection to drop, got {msg:?}"),
    }
    assert_silent(&mut b).await;

    b.send(WsMessage::text("still here")).await.unwrap();
    let (_, text) = split_payload(&next_text(&mut b).await);
    assert_eq!(text, "still here");
    server.stop().await;
}

#[tokio::test]
async fn test_request_without_upgrade_gets_400() {
    let server = setup_server().await;

    let response = raw_request(
        server.addr,
        "GET /websocket HTTP/1.1\r\nHost: localhost\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    assert!(response.ends_with("\r\n\r\n400 Bad Request"), "{response}");
    assert!(server.registry.is_empty());
    server.stop().await;
}

#[tokio::test]
async fn test_malformed_request_gets_400() {
    let server = setup_server().await;

    let response = raw_request(server.addr, "\u{1}\u{2} nonsense\r\n\r\n").await;

    assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{response}");
    assert!(server.registry.is_empty());
    server.stop().await;
}

#[tokio::test]
async fn test_wrong_path_gets_404() {
    let server = setup_server().await;

    let response = raw_request(server.addr, &upgrade_request("/chat")).await;

    assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"), "{response}");
    assert!(response.ends_with("404 Not Found"), "{response}");
    server.stop().await;
}

#[tokio::test]
async fn test_unsupported_version_gets_426() {
    let server = setup_server().await;

    let response = raw_request(
        server.addr,
        "GET /websocket HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
         Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 8\r\n\r\n",
    )
    .await;

    assert!(response.starts_with("HTTP/1.1 426 Upgrade Required\r\n"), "{response}");
    assert!(response.contains("Sec-WebSocket-Version: 13\r\n"), "{response}");
    assert!(server.registry.is_empty());
    server.stop().await;
}

#[tokio::test]
async fn test_end_to_end_close_and_rebroadcast() {
    let server = setup_server().await;
    let mut a = connect(&server, 1).await;
    let a_id = server.registry.ids()[0].clone();
    let mut b = connect(&server, 2).await;
    let b_id = server
        .registry
        .ids()
        .into_iter()
        .find(|id| *id != a_id)
        .unwrap();

    a.send(WsMessage::text("hello")).await.unwrap();
    let to_a = next_text(&mut a).await;
    let to_b = next_text(&mut b).await;
    assert_eq!(to_a, to_b);
    assert_eq!(split_payload(&to_a), (a_id.to_string(), "hello".to_string()));

    a.close(None).await.unwrap();
    wait_for_len(&server.registry, 1).await;
    assert!(server.registry.contains(&b_id));

    b.send(WsMessage::text("ping-test")).await.unwrap();
    let echoed = next_text(&mut b).await;
    assert_eq!(
        split_payload(&echoed),
        (b_id.to_string(), "ping-test".to_string())
    );
    server.stop().await;
}

#[tokio::test]
async fn test_abrupt_disconnect_unregisters() {
    let server = setup_server().await;
    let a = connect(&server, 1).await;
    let _b = connect(&server, 2).await;

    drop(a);

    wait_for_len(&server.registry, 1).await;
    server.stop().await;
}

#[tokio::test]
async fn test_shutdown_sends_going_away_and_drains_registry() {
    let server = setup_server().await;
    let mut a = connect(&server, 1).await;
    let registry = server.registry.clone();

    let addr = server.addr;
    server.stop().await;

    match timeout(STEP, a.next()).await.expect("no close frame") {
        Some(Ok(WsMessage::Close(Some(frame)))) => assert_eq!(frame.code, CloseCode::Away),
        other => panic!("Expected a going-away close frame, got {other:?}"),
    }
    assert!(registry.is_empty());
    assert!(TcpStream::connect(addr).await.is_err());
}

#[tokio::test]
async fn test_stalled_writer_is_stopped_when_its_connection_closes() {
    let server = setup_server().await;
    let metrics = tokio::runtime::Handle::current().metrics();
    let mut flooder = connect(&server, 1).await;

    // a peer that completes the handshake and then never reads
    let socket = TcpSocket::new_v4().unwrap();
    socket.set_recv_buffer_size(4096).unwrap();
    let mut stalled = socket.connect(server.addr).await.unwrap();
    stalled
        .write_all(upgrade_request("/websocket").as_bytes())
        .await
        .unwrap();
    let head = read_response_head(&mut stalled).await;
    assert!(head.starts_with("HTTP/1.1 101 Switching Protocols\r\n"), "{head}");
    wait_for_len(&server.registry, 2).await;

    let text = "x".repeat(60 * 1024);
    for _ in 0..200 {
        flooder.send(WsMessage::text(text.clone())).await.unwrap();
    }
    tokio::time::sleep(Duration::from_millis(300)).await;

    // masked, empty close frame
    stalled
        .write_all(&[0x88, 0x80, 0, 0, 0, 0])
        .await
        .unwrap();
    wait_for_len(&server.registry, 1).await;
    drop(flooder);
    wait_for_len(&server.registry, 0).await;

    // only the server task itself may remain
    timeout(STEP, async {
        while metrics.num_alive_tasks() > 1 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("a writer task outlived its connection");

    drop(stalled);
    server.stop().await;
}

#[tokio::test]
async fn test_failed_writer_ends_read_loop() {
    let registry = Arc::new(ConnectionRegistry::new());
    let mut handler = ConnectionHandler::new(ConnectionId::generate(), registry.clone());
    let (tx, rx) = mpsc::channel::<WsMessage>(4);
    handler.handle_connect(tx);
    assert!(registry.contains(handler.id()));

    let mut writer = tokio::spawn(async move {
        drop(rx);
        Err::<(), _>(tokio_tungstenite::tungstenite::Error::AlreadyClosed)
    });
    let mut source = futures::stream::pending::<
        Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
    >();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let result = timeout(
        STEP,
        read_frames(&mut source, &mut handler, &mut writer, shutdown_rx),
    )
    .await
    .expect("read loop kept waiting after the writer stopped");

    assert!(matches!(result, Err(ConnectionError::Transport(_))));
    handler.handle_disconnect();
    assert!(!registry.contains(handler.id()));
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_writer_ending_early_stops_read_loop() {
    let registry = Arc::new(ConnectionRegistry::new());
    let mut handler = ConnectionHandler::new(ConnectionId::generate(), registry.clone());
    let (tx, _rx) = mpsc::channel::<WsMessage>(4);
    handler.handle_connect(tx);

    let mut writer = tokio::spawn(async { Ok(()) });
    let mut source = futures::stream::pending::<
        Result<WsMessage, tokio_tungstenite::tungstenite::Error>,
    >();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);

    let result = timeout(
        STEP,
        read_frames(&mut source, &mut handler, &mut writer, shutdown_rx),
    )
    .await
    .expect("read loop kept waiting after the writer stopped");

    assert!(matches!(result, Err(ConnectionError::WriterStopped)));
}
