//! HTTP upgrade handling in front of the WebSocket protocol.
//!
//! The request head is read and checked here so that rejected requests get a
//! proper HTTP answer (status line text as body) before the socket is closed.
//! Frame encoding and the accept-key derivation come from `tungstenite`.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::WebSocketStream;
use tungstenite::handshake::derive_accept_key;
use tungstenite::http::{Method, Request, StatusCode, Version, header};
use tungstenite::protocol::{Role, WebSocketConfig};

use crate::utils::error::HandshakeError;

const MAX_HEADERS: usize = 64;
const READ_CHUNK: usize = 4096;

/// The only protocol version this server speaks.
pub const WEBSOCKET_VERSION: &str = "13";

/// Reads one HTTP request head from `stream`.
///
/// Returns the parsed request and any bytes received after the head; those
/// belong to the WebSocket stream.
pub async fn read_request<S>(
    stream: &mut S,
    max_bytes: usize,
) -> Result<(Request<()>, Vec<u8>), HandshakeError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; READ_CHUNK];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandshakeError::Closed);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some((head_len, request)) = parse_request_head(&buf)? {
            let tail = buf.split_off(head_len);
            return Ok((request, tail));
        }
        if buf.len() > max_bytes {
            return Err(HandshakeError::RequestTooLarge(max_bytes));
        }
    }
}

/// Parses a complete request head, or returns `None` if more bytes are needed.
pub fn parse_request_head(buf: &[u8]) -> Result<Option<(usize, Request<()>)>, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    let head_len = match parsed.parse(buf) {
        Ok(httparse::Status::Complete(len)) => len,
        Ok(httparse::Status::Partial) => return Ok(None),
        Err(e) => return Err(HandshakeError::Malformed(e.to_string())),
    };

    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };
    let mut builder = Request::builder()
        .method(parsed.method.unwrap_or_default())
        .uri(parsed.path.unwrap_or_default())
        .version(version);
    for h in parsed.headers.iter() {
        builder = builder.header(h.name, h.value);
    }

    builder
        .body(())
        .map(|request| Some((head_len, request)))
        .map_err(|e| HandshakeError::Malformed(e.to_string()))
}

/// Checks that `request` asks for a WebSocket session at `path`.
///
/// The `Upgrade` header must be exactly `websocket`.
pub fn validate_upgrade(request: &Request<()>, path: &str) -> Result<(), HandshakeError> {
    if *request.method() != Method::GET {
        return Err(HandshakeError::Malformed(format!(
            "method {} not allowed",
            request.method()
        )));
    }
    if header_str(request, header::UPGRADE) != Some("websocket") {
        return Err(HandshakeError::NotUpgrade);
    }
    if request.uri().path() != path {
        return Err(HandshakeError::WrongPath(request.uri().path().to_string()));
    }
    if request.headers().get(header::SEC_WEBSOCKET_KEY).is_none() {
        return Err(HandshakeError::Malformed(
            "missing Sec-WebSocket-Key".to_string(),
        ));
    }
    Ok(())
}

fn header_str<K>(request: &Request<()>, key: K) -> Option<&str>
where
    K: header::AsHeaderName,
{
    request.headers().get(key).and_then(|v| v.to_str().ok())
}

/// A negotiated, not yet answered, WebSocket handshake.
#[derive(Debug)]
pub struct Handshaker {
    accept_key: String,
}

/// Negotiates the protocol version. `None` means the client asked for a
/// version this server does not speak.
pub fn try_handshake(request: &Request<()>) -> Option<Handshaker> {
    if header_str(request, header::SEC_WEBSOCKET_VERSION) != Some(WEBSOCKET_VERSION) {
        return None;
    }
    let key = request.headers().get(header::SEC_WEBSOCKET_KEY)?;
    Some(Handshaker {
        accept_key: derive_accept_key(key.as_bytes()),
    })
}

impl Handshaker {
    pub fn accept_key(&self) -> &str {
        &self.accept_key
    }

    /// Writes the `101 Switching Protocols` answer and wraps the socket.
    ///
    /// `tail` holds bytes already read past the request head.
    pub async fn complete<S>(
        self,
        mut stream: S,
        tail: Vec<u8>,
        config: WebSocketConfig,
    ) -> Result<WebSocketStream<S>, HandshakeError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let response = format!(
            "HTTP/1.1 101 Switching Protocols\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: {}\r\n\r\n",
            self.accept_key
        );
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await?;

        Ok(WebSocketStream::from_partially_read(stream, tail, Role::Server, Some(config)).await)
    }
}

/// Writes a complete HTTP response and shuts the write side down.
pub async fn send_http_response<S>(
    stream: &mut S,
    status: StatusCode,
    headers: &[(&str, &str)],
    body: &str,
) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut response = format!("HTTP/1.1 {status}\r\n");
    for (name, value) in headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str(&format!(
        "Content-Type: text/plain; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    ));
    response.push_str(body);

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    stream.shutdown().await
}

/// Answers a request whose WebSocket version could not be negotiated.
pub async fn send_unsupported_version_response<S>(stream: &mut S) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    send_http_response(
        stream,
        StatusCode::UPGRADE_REQUIRED,
        &[("Sec-WebSocket-Version", WEBSOCKET_VERSION)],
        "",
    )
    .await
}

/// Sends whatever answer `err` calls for. The body is the status line text,
/// e.g. `400 Bad Request`.
pub async fn reject<S>(stream: &mut S, err: &HandshakeError) -> std::io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    match err {
        HandshakeError::UnsupportedVersion => send_unsupported_version_response(stream).await,
        other => match other.status() {
            Some(status) => send_http_response(stream, status, &[], &status.to_string()).await,
            None => Ok(()),
        },
    }
}
