//! Shared WebSocket transport.
//!
//! Gateway socket plumbing over `tokio-tungstenite`. The gateway
//! connection only sees the [`FrameSink`] / [`FrameSource`] halves.
//!
//! # Architecture
//!
//! A single [`connect`] function handles URL→request building, header
//! insertion, the message size cap and TLS negotiation. It returns a
//! ([`WsWriter`], [`WsReader`]) pair. The writer implements
//! [`FrameSink`] and the reader implements [`FrameSource`], so the
//! framing layer never sees tungstenite types.

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;
use tungstenite::protocol::frame::coding::{Data as OpData, OpCode};
use tungstenite::protocol::frame::Frame;
use tungstenite::protocol::WebSocketConfig;

use crate::constants::MAX_MESSAGE_SIZE;
use crate::protocol::framing::{FrameSink, FrameSource, Fragment};

/// Concrete WebSocket stream type (avoids repeating the 6-line generic everywhere).
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

impl WsWriter {
    /// Send one fragment of a binary message.
    ///
    /// The first fragment carries the binary opcode, later ones are
    /// continuation frames. Only the fragment with `last == true` has
    /// the FIN bit set.
    pub async fn send_fragment(&mut self, chunk: &[u8], first: bool, last: bool) -> Result<()> {
        let opcode = if first {
            OpCode::Data(OpData::Binary)
        } else {
            OpCode::Data(OpData::Continue)
        };
        let frame = Frame::message(chunk.to_vec(), opcode, last);
        self.sink
            .send(tungstenite::Message::Frame(frame))
            .await
            .context("WebSocket send_fragment failed")
    }

    /// Send a close frame.
    pub async fn send_close(&mut self) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Close(None))
            .await
            .context("WebSocket send_close failed")
    }

    /// Flush pending writes and close the sink.
    pub async fn close(&mut self) -> Result<()> {
        self.sink.close().await.context("WebSocket close failed")
    }
}

#[async_trait]
impl FrameSink for WsWriter {
    async fn send_fragment(&mut self, chunk: &[u8], first: bool, last: bool) -> Result<()> {
        WsWriter::send_fragment(self, chunk, first, last).await
    }

    async fn send_close(&mut self) -> Result<()> {
        WsWriter::send_close(self).await
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsReader {
    /// Next inbound fragment.
    ///
    /// tungstenite reassembles continuation frames and answers pings
    /// itself, so every binary message arrives as one final fragment.
    async fn next_fragment(&mut self) -> Option<Result<Fragment>> {
        loop {
            let message = match self.stream.next().await? {
                Ok(message) => message,
                Err(e) => return Some(Err(anyhow::Error::new(e).context("WebSocket read failed"))),
            };
            let bytes = match message {
                tungstenite::Message::Binary(bytes) => bytes,
                // Gateways only speak binary; the decoder rejects anything else.
                tungstenite::Message::Text(text) => text.into_bytes(),
                tungstenite::Message::Close(frame) => {
                    if let Some(frame) = frame {
                        log::debug!(
                            "[WebSocket] Close frame received ({}: {})",
                            u16::from(frame.code),
                            frame.reason
                        );
                    }
                    return Some(Ok(Fragment::Close));
                }
                tungstenite::Message::Ping(_)
                | tungstenite::Message::Pong(_)
                | tungstenite::Message::Frame(_) => continue,
            };
            return Some(Ok(Fragment::Data {
                bytes,
                end_of_message: true,
            }));
        }
    }
}

/// Connect to a WebSocket URL with optional headers.
///
/// Builds an HTTP request from `url`, inserts each `(name, value)` header,
/// then performs the WebSocket handshake with the message size capped at
/// [`MAX_MESSAGE_SIZE`]. Returns split (writer, reader) halves.
///
/// # Errors
///
/// Returns an error if the URL is invalid, header values are malformed,
/// or the WebSocket handshake fails. Use [`is_not_found`] to detect a
/// handshake rejected with HTTP 404.
pub async fn connect(url: &str, headers: &[(&str, &str)]) -> Result<(WsWriter, WsReader)> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .with_context(|| format!("invalid WebSocket URL: {url}"))?;

    for &(name, value) in headers {
        let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name: {name}"))?;
        let header_value = tungstenite::http::HeaderValue::from_str(value)
            .with_context(|| format!("invalid header value for {name}"))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(MAX_MESSAGE_SIZE);
    config.max_frame_size = Some(MAX_MESSAGE_SIZE);

    let (ws_stream, _response) =
        tokio_tungstenite::connect_async_with_config(request, Some(config), false)
            .await
            .context("WebSocket connect failed")?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Returns `true` if `err` is a handshake rejected with HTTP 404.
///
/// The gateway answers 404 when it does not know the device.
#[must_use]
pub fn is_not_found(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<tungstenite::Error>(),
        Some(tungstenite::Error::Http(response))
            if response.status() == tungstenite::http::StatusCode::NOT_FOUND
    )
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        url.replace("https://", "wss://")
            .replace("http://", "ws://")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_to_ws_scheme_https() {
        assert_eq!(
            http_to_ws_scheme("https://example.com"),
            "wss://example.com"
        );
    }

    #[test]
    fn test_http_to_ws_scheme_http() {
        assert_eq!(
            http_to_ws_scheme("http://localhost:3000"),
            "ws://localhost:3000"
        );
    }

    #[test]
    fn test_http_to_ws_scheme_wss_passthrough() {
        assert_eq!(
            http_to_ws_scheme("wss://node1.example.com/1/ws/device"),
            "wss://node1.example.com/1/ws/device"
        );
    }

    #[test]
    fn test_is_not_found_ignores_other_errors() {
        let err = anyhow::anyhow!("connection refused");
        assert!(!is_not_found(&err));
    }

    #[test]
    fn test_is_not_found_detects_404_handshake() {
        let response = tungstenite::http::Response::builder()
            .status(404)
            .body(None)
            .unwrap();
        let err = anyhow::Error::new(tungstenite::Error::Http(response))
            .context("WebSocket connect failed");
        assert!(is_not_found(&err));
    }

    #[tokio::test]
    async fn test_connect_invalid_url_returns_error() {
        let result = connect("not-a-url", &[]).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_connect_unreachable_host_returns_error() {
        let result = connect("ws://127.0.0.1:1/invalid", &[]).await;
        assert!(result.is_err());
    }
}
