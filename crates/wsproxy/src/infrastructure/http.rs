//! Minimal HTTP/1.1 handling for the listener.
//!
//! The listener has to look at a request *before* deciding what it is: a
//! static-file request, or an Upgrade that must pass the authentication gate
//! before the WebSocket handshake is answered.  This module:
//!
//! 1. Reads the request head (request line + headers) from the socket.
//! 2. Parses it into an `http::Request<()>` with `httparse`.
//! 3. Builds the `101 Switching Protocols` answer (RFC 6455 §4.2.2), or the
//!    plain responses used for static files and rejections.
//!
//! Only the head is consumed.  The reader is a `BufReader`, so any bytes the
//! client pipelined after the head stay buffered for the WebSocket stream.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::http::{self, header, Method, Request, StatusCode, Version};

/// Largest request head accepted, in bytes.
pub const MAX_HEAD_LEN: usize = 8 * 1024;

/// Largest number of header fields accepted.
pub const MAX_HEADERS: usize = 64;

/// Sent verbatim to a client the authentication gate rejected.
pub const UNAUTHORIZED_RESPONSE: &[u8] = b"HTTP/1.1 401 Unauthorized\r\n\r\n";

/// Errors while reading or validating a request head.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("I/O error while reading request: {0}")]
    Io(#[from] io::Error),

    #[error("connection closed before the request head was complete")]
    ConnectionClosed,

    #[error("request head exceeds {MAX_HEAD_LEN} bytes")]
    HeadTooLarge,

    #[error("malformed request: {0}")]
    Malformed(String),

    #[error("invalid WebSocket upgrade: {0}")]
    InvalidUpgrade(&'static str),
}

impl HandshakeError {
    /// Whether the peer is still there to receive a `400 Bad Request`.
    pub fn warrants_bad_request(&self) -> bool {
        matches!(
            self,
            HandshakeError::HeadTooLarge
                | HandshakeError::Malformed(_)
                | HandshakeError::InvalidUpgrade(_)
        )
    }
}

// ── Request head ──────────────────────────────────────────────────────────────

/// Reads one request head, up to and including the blank line.
///
/// Leading empty lines are skipped (RFC 9112 §2.2).
///
/// # Errors
///
/// Returns [`HandshakeError::ConnectionClosed`] on EOF before the blank line,
/// or [`HandshakeError::HeadTooLarge`] past [`MAX_HEAD_LEN`] bytes.
pub async fn read_request_head<R>(reader: &mut R) -> Result<Vec<u8>, HandshakeError>
where
    R: AsyncBufRead + Unpin,
{
    // One byte over the limit is enough to tell "too large" from "exactly full".
    let mut limited = reader.take(MAX_HEAD_LEN as u64 + 1);
    let mut head = Vec::with_capacity(1024);

    loop {
        let start = head.len();
        let n = limited.read_until(b'\n', &mut head).await?;
        if n == 0 {
            return Err(if head.len() > MAX_HEAD_LEN {
                HandshakeError::HeadTooLarge
            } else {
                HandshakeError::ConnectionClosed
            });
        }

        let line = &head[start..];
        if line == b"\r\n" || line == b"\n" {
            if start == 0 {
                head.clear();
                continue;
            }
            return Ok(head);
        }
    }
}

/// Parses a complete request head.
///
/// # Errors
///
/// Returns [`HandshakeError::Malformed`] if `httparse` rejects the head or the
/// method/URI/headers are not valid `http` types.
pub fn parse_request_head(head: &[u8]) -> Result<Request<()>, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut parsed = httparse::Request::new(&mut headers);

    match parsed.parse(head) {
        Ok(httparse::Status::Complete(_)) => {}
        Ok(httparse::Status::Partial) => {
            return Err(HandshakeError::Malformed("incomplete request head".to_string()))
        }
        Err(e) => return Err(HandshakeError::Malformed(e.to_string())),
    }

    let version = match parsed.version {
        Some(0) => Version::HTTP_10,
        _ => Version::HTTP_11,
    };

    let mut builder = Request::builder()
        .method(parsed.method.unwrap_or("GET"))
        .uri(parsed.path.unwrap_or("/"))
        .version(version);
    for h in parsed.headers.iter() {
        builder = builder.header(h.name, h.value);
    }

    builder
        .body(())
        .map_err(|e: http::Error| HandshakeError::Malformed(e.to_string()))
}

/// Returns `true` if `request` asks for a protocol upgrade.
///
/// This is the same test a Node or Go HTTP server uses to route a request to
/// its upgrade handler: a `Connection` header listing `upgrade` plus an
/// `Upgrade` header.  Whether the upgrade is a *valid WebSocket* upgrade is
/// checked later by [`switching_protocols_response`].
pub fn is_upgrade_request(request: &Request<()>) -> bool {
    let connection_upgrade = request
        .headers()
        .get_all(header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    connection_upgrade && request.headers().contains_key(header::UPGRADE)
}

/// Builds the `101 Switching Protocols` response for a WebSocket upgrade.
///
/// If the client offered subprotocols, the first one is selected.
///
/// # Errors
///
/// Returns [`HandshakeError::InvalidUpgrade`] if the request is not a
/// well-formed RFC 6455 opening handshake.
pub fn switching_protocols_response(request: &Request<()>) -> Result<String, HandshakeError> {
    if request.method() != Method::GET {
        return Err(HandshakeError::InvalidUpgrade("method must be GET"));
    }

    let headers = request.headers();
    let is_websocket = headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.trim().eq_ignore_ascii_case("websocket"));
    if !is_websocket {
        return Err(HandshakeError::InvalidUpgrade("Upgrade header is not 'websocket'"));
    }

    let version_13 = headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .is_some_and(|v| v.as_bytes() == b"13");
    if !version_13 {
        return Err(HandshakeError::InvalidUpgrade("Sec-WebSocket-Version must be 13"));
    }

    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .ok_or(HandshakeError::InvalidUpgrade("missing Sec-WebSocket-Key"))?;

    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n",
        derive_accept_key(key.as_bytes())
    );

    let protocol = headers
        .get(header::SEC_WEBSOCKET_PROTOCOL)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').map(str::trim).find(|p| !p.is_empty()));
    if let Some(protocol) = protocol {
        response.push_str(&format!("Sec-WebSocket-Protocol: {protocol}\r\n"));
    }

    response.push_str("\r\n");
    Ok(response)
}

// ── Responses ─────────────────────────────────────────────────────────────────

/// A complete non-upgrade response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// A `text/plain` response whose body is `message` plus a newline.
    pub fn text(status: StatusCode, message: &str) -> Self {
        Self {
            status,
            content_type: Some("text/plain".to_string()),
            body: format!("{message}\n").into_bytes(),
        }
    }

    /// Serializes the status line, headers and (unless `head_only`) the body.
    ///
    /// Every response carries `Connection: close`; the listener serves one
    /// request per plain HTTP connection.
    pub fn to_bytes(&self, head_only: bool) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 {} {}\r\n",
            self.status.as_u16(),
            self.status.canonical_reason().unwrap_or("Unknown")
        );
        if let Some(content_type) = &self.content_type {
            out.push_str(&format!("Content-Type: {content_type}\r\n"));
        }
        out.push_str(&format!("Content-Length: {}\r\n", self.body.len()));
        out.push_str("Connection: close\r\n\r\n");

        let mut bytes = out.into_bytes();
        if !head_only {
            bytes.extend_from_slice(&self.body);
        }
        bytes
    }
}

/// Writes `response` and flushes.
///
/// # Errors
///
/// Returns the underlying I/O error if the client has gone away.
pub async fn write_response<W>(
    writer: &mut W,
    response: &HttpResponse,
    head_only: bool,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&response.to_bytes(head_only)).await?;
    writer.flush().await
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;
    use tokio_test::io::Builder;

    const UPGRADE_HEAD: &[u8] = b"GET /websockify?token=abc HTTP/1.1\r\n\
Host: localhost:6080\r\n\
Upgrade: websocket\r\n\
Connection: keep-alive, Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
Sec-WebSocket-Version: 13\r\n\
Sec-WebSocket-Protocol: binary, base64\r\n\
\r\n";

    fn parse(head: &[u8]) -> Request<()> {
        parse_request_head(head).expect("head must parse")
    }

    #[tokio::test]
    async fn test_read_request_head_stops_at_blank_line() {
        // Arrange: the head is followed by a pipelined WebSocket frame.
        let mock = Builder::new()
            .read(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n")
            .read(&[0x82, 0x00])
            .build();
        let mut reader = BufReader::new(mock);

        // Act
        let head = read_request_head(&mut reader).await.unwrap();

        // Assert: the head is returned and the frame bytes stay unread.
        assert_eq!(head, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
        let mut rest = [0u8; 2];
        reader.read_exact(&mut rest).await.unwrap();
        assert_eq!(rest, [0x82, 0x00]);
    }

    #[tokio::test]
    async fn test_read_request_head_handles_split_reads() {
        let mock = Builder::new()
            .read(b"GET / HT")
            .read(b"TP/1.1\r\nHo")
            .read(b"st: x\r\n")
            .read(b"\r\n")
            .build();
        let mut reader = BufReader::new(mock);

        let head = read_request_head(&mut reader).await.unwrap();

        assert_eq!(head, b"GET / HTTP/1.1\r\nHost: x\r\n\r\n");
    }

    #[tokio::test]
    async fn test_read_request_head_skips_leading_blank_lines() {
        let mock = Builder::new().read(b"\r\nGET / HTTP/1.1\r\n\r\n").build();
        let mut reader = BufReader::new(mock);

        let head = read_request_head(&mut reader).await.unwrap();

        assert_eq!(head, b"GET / HTTP/1.1\r\n\r\n");
    }

    #[tokio::test]
    async fn test_read_request_head_eof_is_connection_closed() {
        let mock = Builder::new().read(b"GET / HTTP/1.1\r\n").build();
        let mut reader = BufReader::new(mock);

        let result = read_request_head(&mut reader).await;

        assert!(matches!(result, Err(HandshakeError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn test_read_request_head_rejects_oversized_head() {
        // Exactly one byte over, so the mock is fully drained.
        let huge = vec![b'a'; MAX_HEAD_LEN + 1];
        let mock = Builder::new().read(&huge).build();
        let mut reader = BufReader::new(mock);

        let result = read_request_head(&mut reader).await;

        assert!(matches!(result, Err(HandshakeError::HeadTooLarge)));
    }

    #[test]
    fn test_parse_request_head_extracts_method_uri_headers() {
        let request = parse(UPGRADE_HEAD);
        assert_eq!(request.method(), Method::GET);
        assert_eq!(request.uri().path(), "/websockify");
        assert_eq!(request.uri().query(), Some("token=abc"));
        assert_eq!(request.headers()["host"], "localhost:6080");
    }

    #[test]
    fn test_parse_request_head_rejects_garbage() {
        let result = parse_request_head(b"\x16\x03\x01 not http\r\n\r\n");
        assert!(matches!(result, Err(HandshakeError::Malformed(_))));
    }

    #[test]
    fn test_is_upgrade_request_detects_connection_token_list() {
        assert!(is_upgrade_request(&parse(UPGRADE_HEAD)));
    }

    #[test]
    fn test_plain_get_is_not_upgrade() {
        let request = parse(b"GET /index.html HTTP/1.1\r\nHost: x\r\n\r\n");
        assert!(!is_upgrade_request(&request));
    }

    #[test]
    fn test_upgrade_header_without_connection_upgrade_is_not_upgrade() {
        let request = parse(b"GET / HTTP/1.1\r\nUpgrade: websocket\r\n\r\n");
        assert!(!is_upgrade_request(&request));
    }

    #[test]
    fn test_switching_protocols_uses_rfc6455_accept_key() {
        // Key/accept pair from RFC 6455 §1.3.
        let response = switching_protocols_response(&parse(UPGRADE_HEAD)).unwrap();

        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.ends_with("\r\n\r\n"));
    }

    #[test]
    fn test_switching_protocols_selects_first_subprotocol() {
        let response = switching_protocols_response(&parse(UPGRADE_HEAD)).unwrap();
        assert!(response.contains("Sec-WebSocket-Protocol: binary\r\n"));
    }

    #[test]
    fn test_switching_protocols_omits_subprotocol_when_none_offered() {
        let head = b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\nSec-WebSocket-Version: 13\r\n\r\n";
        let response = switching_protocols_response(&parse(head)).unwrap();
        assert!(!response.contains("Sec-WebSocket-Protocol"));
    }

    #[test]
    fn test_switching_protocols_requires_key() {
        let head = b"GET / HTTP/1.1\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\
Sec-WebSocket-Version: 13\r\n\r\n";
        let result = switching_protocols_response(&parse(head));
        assert!(matches!(result, Err(HandshakeError::InvalidUpgrade(_))));
    }

    #[test]
    fn test_switching_protocols_rejects_non_websocket_upgrade() {
        let head = b"GET / HTTP/1.1\r\nUpgrade: h2c\r\nConnection: Upgrade\r\n\r\n";
        let result = switching_protocols_response(&parse(head));
        assert!(matches!(result, Err(HandshakeError::InvalidUpgrade(_))));
    }

    #[test]
    fn test_unauthorized_response_is_bare_status_line() {
        assert_eq!(UNAUTHORIZED_RESPONSE, b"HTTP/1.1 401 Unauthorized\r\n\r\n");
    }

    #[test]
    fn test_text_response_serialization() {
        let response = HttpResponse::text(StatusCode::NOT_FOUND, "404 Not Found");

        let bytes = response.to_bytes(false);

        assert_eq!(
            String::from_utf8(bytes).unwrap(),
            "HTTP/1.1 404 Not Found\r\nContent-Type: text/plain\r\nContent-Length: 14\r\n\
Connection: close\r\n\r\n404 Not Found\n"
        );
    }

    #[test]
    fn test_head_only_response_keeps_length_but_drops_body() {
        let response = HttpResponse {
            status: StatusCode::OK,
            content_type: None,
            body: b"hello".to_vec(),
        };

        let text = String::from_utf8(response.to_bytes(true)).unwrap();

        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_write_response_writes_serialized_bytes() {
        let response = HttpResponse::text(StatusCode::FORBIDDEN, "403 Permission Denied");
        let expected = response.to_bytes(false);
        let mut mock = Builder::new().write(&expected).build();

        write_response(&mut mock, &response, false).await.unwrap();
    }
}
