//! Server side of the RFC6455 opening handshake.
//!
//! The request is read up to the blank line (at most [`MAX_HEADER_SIZE`]
//! bytes, within [`HANDSHAKE_TIMEOUT`]), validated, and answered with either
//! `101 Switching Protocols` or an error response that closes the
//! connection. The handler never retries; the caller gets one result.

use std::collections::HashMap;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use sha1::{Digest, Sha1};
use tether_types::{Result, TetherError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::debug;

use super::extension::{self, NegotiatedExtension};
use crate::settings::WebSocketSettings;

pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
pub const MAX_HEADER_SIZE: usize = 1024;
const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    BadRequest,
    RequestTimeout,
}

impl HandshakeStatus {
    pub fn code(self) -> u16 {
        match self {
            HandshakeStatus::BadRequest => 400,
            HandshakeStatus::RequestTimeout => 408,
        }
    }

    pub fn reason(self) -> &'static str {
        match self {
            HandshakeStatus::BadRequest => "Bad Request",
            HandshakeStatus::RequestTimeout => "Request Timeout",
        }
    }

    fn into_error(self, detail: String) -> TetherError {
        match self {
            HandshakeStatus::BadRequest => TetherError::InvalidArgument(detail),
            HandshakeStatus::RequestTimeout => TetherError::ResourceExhausted(detail),
        }
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeFailure {
    pub status: HandshakeStatus,
    pub detail: String,
}

impl HandshakeFailure {
    fn bad_request(detail: impl Into<String>) -> Self {
        Self {
            status: HandshakeStatus::BadRequest,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeRequest {
    pub method: String,
    pub uri: String,
    pub version: String,
    /// Lower-cased names, trimmed values; the last duplicate wins.
    pub headers: HashMap<String, String>,
}

impl HandshakeRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

pub fn parse_request(text: &str) -> std::result::Result<HandshakeRequest, HandshakeFailure> {
    let (request_line, rest) = text
        .split_once("\r\n")
        .ok_or_else(|| HandshakeFailure::bad_request("missing request line"))?;

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(uri), Some(version), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(HandshakeFailure::bad_request(format!("malformed request line '{request_line}'")));
    };
    if !method.eq_ignore_ascii_case("GET") {
        return Err(HandshakeFailure::bad_request(format!("unsupported method {method}")));
    }
    if !version.eq_ignore_ascii_case("HTTP/1.1") {
        return Err(HandshakeFailure::bad_request(format!("unsupported version {version}")));
    }

    let mut headers = HashMap::new();
    for line in rest.split("\r\n").filter(|l| !l.is_empty()) {
        let (key, value) = line
            .split_once(':')
            .ok_or_else(|| HandshakeFailure::bad_request(format!("malformed header line '{line}'")))?;
        headers.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
    }

    Ok(HandshakeRequest {
        method: method.to_string(),
        uri: uri.to_string(),
        version: version.to_string(),
        headers,
    })
}

/// Check the upgrade headers and return the `Sec-WebSocket-Accept` value.
pub fn validate(request: &HandshakeRequest) -> std::result::Result<String, HandshakeFailure> {
    let connection = request.header("connection").unwrap_or_default();
    if !connection
        .split(',')
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    {
        return Err(HandshakeFailure::bad_request("connection header lacks upgrade"));
    }
    if !request
        .header("upgrade")
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    {
        return Err(HandshakeFailure::bad_request("upgrade header is not websocket"));
    }
    if request.header("sec-websocket-version") != Some("13") {
        return Err(HandshakeFailure::bad_request("unsupported websocket version"));
    }
    match request.header("sec-websocket-key") {
        Some(key) if !key.is_empty() => Ok(compute_accept_key(key)),
        _ => Err(HandshakeFailure::bad_request("missing sec-websocket-key")),
    }
}

pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

pub fn build_ok_response(accept_key: &str, extensions: Option<&str>) -> String {
    let mut response = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {accept_key}\r\n"
    );
    if let Some(extensions) = extensions {
        response.push_str(&format!("Sec-WebSocket-Extensions: {extensions}\r\n"));
    }
    response.push_str("\r\n");
    response
}

pub fn build_error_response(status: HandshakeStatus) -> String {
    let body = status.reason();
    format!(
        "HTTP/1.1 {} {}\r\n\
         Connection: close\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {body}",
        status.code(),
        status.reason(),
        body.len()
    )
}

/// Result of an accepted handshake.
#[derive(Debug, Default)]
pub struct HandshakeOutcome {
    pub extension: Option<NegotiatedExtension>,
    /// Bytes received after the request headers; they belong to the first
    /// frames.
    pub leftover: Vec<u8>,
}

enum ReadFailure {
    Io(TetherError),
    Rejected(HandshakeFailure),
}

pub struct HandshakeHandler {
    settings: WebSocketSettings,
    timeout: Duration,
}

impl HandshakeHandler {
    pub fn new(settings: WebSocketSettings) -> Self {
        Self {
            settings,
            timeout: HANDSHAKE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn handle<S>(&self, stream: &mut S) -> Result<HandshakeOutcome>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send,
    {
        let read = tokio::time::timeout(self.timeout, read_request(stream)).await;
        let (request, leftover) = match read {
            Err(_) => {
                let status = HandshakeStatus::RequestTimeout;
                return Err(reject(stream, status, "handshake timed out".into()).await);
            }
            Ok(Err(ReadFailure::Io(e))) => return Err(e),
            Ok(Err(ReadFailure::Rejected(failure))) => {
                return Err(reject(stream, failure.status, failure.detail).await);
            }
            Ok(Ok(read)) => read,
        };

        let accept_key = match validate(&request) {
            Ok(key) => key,
            Err(failure) => return Err(reject(stream, failure.status, failure.detail).await),
        };
        let extension = request
            .header("sec-websocket-extensions")
            .and_then(|header| extension::negotiate(header, &self.settings));

        let response = build_ok_response(&accept_key, extension.as_ref().map(|e| e.response.as_str()));
        stream.write_all(response.as_bytes()).await?;
        stream.flush().await?;
        debug!(uri = %request.uri, deflate = extension.is_some(), "websocket handshake accepted");

        Ok(HandshakeOutcome { extension, leftover })
    }
}

async fn read_request<S>(stream: &mut S) -> std::result::Result<(HandshakeRequest, Vec<u8>), ReadFailure>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; MAX_HEADER_SIZE];
    let mut filled = 0;
    loop {
        if filled == buf.len() {
            return Err(ReadFailure::Rejected(HandshakeFailure::bad_request(format!(
                "request headers exceed {MAX_HEADER_SIZE} bytes"
            ))));
        }
        let n = stream
            .read(&mut buf[filled..])
            .await
            .map_err(|e| ReadFailure::Io(e.into()))?;
        if n == 0 {
            return Err(ReadFailure::Io(TetherError::connection_closed()));
        }
        filled += n;
        if let Some(pos) = buf[..filled]
            .windows(HEADER_TERMINATOR.len())
            .position(|w| w == HEADER_TERMINATOR)
        {
            let end = pos + HEADER_TERMINATOR.len();
            let text = std::str::from_utf8(&buf[..end])
                .map_err(|_| ReadFailure::Rejected(HandshakeFailure::bad_request("request is not utf-8")))?;
            let request = parse_request(text).map_err(ReadFailure::Rejected)?;
            return Ok((request, buf[end..filled].to_vec()));
        }
    }
}

async fn reject<S>(stream: &mut S, status: HandshakeStatus, detail: String) -> TetherError
where
    S: AsyncWrite + Unpin,
{
    debug!(status = status.code(), detail = %detail, "websocket handshake rejected");
    let response = build_error_response(status);
    // The peer may already be gone; the handshake error is what matters.
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.shutdown().await;
    status.into_error(detail)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "dGhlIHNhbXBsZSBub25jZQ==";

    fn request_text(extra: &str) -> String {
        format!(
            "GET /chat HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\nConnection: keep-alive, Upgrade\r\n\
             Sec-WebSocket-Key: {KEY}\r\nSec-WebSocket-Version: 13\r\n{extra}\r\n"
        )
    }

    #[test]
    fn accept_key_matches_rfc_vector() {
        assert_eq!(compute_accept_key(KEY), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn parse_lowercases_keys_and_keeps_last_duplicate() {
        let request = parse_request("get / http/1.1\r\nX-Thing: a\r\nx-thing:  b \r\n\r\n").unwrap();
        assert_eq!(request.header("x-thing"), Some("b"));
        assert_eq!(request.uri, "/");
    }

    #[test]
    fn validation_matrix() {
        let ok = parse_request(&request_text("")).unwrap();
        assert_eq!(validate(&ok).unwrap(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");

        let cases = [
            ("connection", "keep-alive"),
            ("upgrade", "h2c"),
            ("sec-websocket-version", "8"),
            ("sec-websocket-key", ""),
        ];
        for (key, value) in cases {
            let mut request = ok.clone();
            request.headers.insert(key.to_string(), value.to_string());
            let failure = validate(&request).unwrap_err();
            assert_eq!(failure.status, HandshakeStatus::BadRequest, "{key}");
        }

        let mut missing = ok.clone();
        missing.headers.remove("upgrade");
        assert!(validate(&missing).is_err());

        assert!(parse_request("POST / HTTP/1.1\r\n\r\n").is_err());
        assert!(parse_request("GET / HTTP/1.0\r\n\r\n").is_err());
        assert!(parse_request("GET /\r\n\r\n").is_err());
    }

    #[test]
    fn error_response_closes_connection() {
        let response = build_error_response(HandshakeStatus::RequestTimeout);
        assert!(response.starts_with("HTTP/1.1 408 Request Timeout\r\n"));
        assert!(response.contains("Connection: close\r\n"));
        assert!(response.contains("Content-Type: text/plain\r\n"));
        assert!(response.contains("Content-Length: 15\r\n"));
        assert!(response.ends_with("\r\n\r\nRequest Timeout"));
    }

    #[tokio::test]
    async fn handle_accepts_and_negotiates_deflate() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let text = request_text("Sec-WebSocket-Extensions: permessage-deflate; client_max_window_bits\r\n");
        client.write_all(text.as_bytes()).await?;
        client.write_all(&[0x89, 0x00]).await?;

        let handler = HandshakeHandler::new(WebSocketSettings::default());
        let outcome = handler.handle(&mut server).await?;
        assert!(outcome.extension.is_some());
        assert_eq!(outcome.leftover, vec![0x89, 0x00]);

        let mut response = vec![0u8; 512];
        let n = client.read(&mut response).await?;
        let response = String::from_utf8_lossy(&response[..n]);
        assert!(response.starts_with("HTTP/1.1 101 Switching Protocols\r\n"));
        assert!(response.contains("Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n"));
        assert!(response.contains("Sec-WebSocket-Extensions: permessage-deflate;"));
        Ok(())
    }

    #[tokio::test]
    async fn oversized_headers_are_bad_request() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let padding = "x".repeat(MAX_HEADER_SIZE);
        client
            .write_all(request_text(&format!("X-Padding: {padding}\r\n")).as_bytes())
            .await?;

        let err = HandshakeHandler::new(WebSocketSettings::default())
            .handle(&mut server)
            .await
            .unwrap_err();
        assert!(matches!(err, TetherError::InvalidArgument(_)));

        let mut response = String::new();
        client.read_to_string(&mut response).await?;
        assert!(response.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        Ok(())
    }

    #[tokio::test]
    async fn silent_client_times_out() -> std::result::Result<(), Box<dyn std::error::Error>> {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let handler = HandshakeHandler::new(WebSocketSettings::default()).with_timeout(Duration::from_millis(50));
        let err = handler.handle(&mut server).await.unwrap_err();
        assert!(matches!(err, TetherError::ResourceExhausted(_)));

        let mut response = String::new();
        client.read_to_string(&mut response).await?;
        assert!(response.starts_with("HTTP/1.1 408 Request Timeout\r\n"));
        Ok(())
    }
}
