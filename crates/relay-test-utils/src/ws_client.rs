//! WebSocket test client.
//!
//! Wraps a `tokio-tungstenite` stream and decodes relay frames into
//! `ServerMessage`s, so tests assert on typed messages.

use futures::{SinkExt, StreamExt};
use relay_protocol::codec::{decode_server_message, WireFrame};
use relay_protocol::ServerMessage;
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// How long `next_message` waits before failing the test.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Options for the upgrade request.
#[derive(Debug, Default, Clone)]
pub struct ClientOptions {
    /// `Origin` header to send.
    pub origin: Option<String>,
    /// `format` query value (`json` or `msgpack`).
    pub format: Option<String>,
}

impl ClientOptions {
    #[must_use]
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    #[must_use]
    pub fn json(mut self) -> Self {
        self.format = Some("json".to_string());
        self
    }
}

/// A connected relay client.
pub struct TestClient {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    /// Connect with default options (MessagePack, no `Origin`).
    pub async fn connect(url: &str) -> Result<Self, anyhow::Error> {
        Self::connect_with(url, &ClientOptions::default()).await
    }

    /// Connect with explicit options.
    pub async fn connect_with(url: &str, options: &ClientOptions) -> Result<Self, anyhow::Error> {
        let (stream, _response) = tokio_tungstenite::connect_async(request(url, options)?).await?;
        Ok(Self { stream })
    }

    /// Attempt a connection that the relay should refuse.
    ///
    /// Returns the HTTP status and, when it arrived with the headers, the
    /// JSON body of the refusal.
    pub async fn connect_refused(
        url: &str,
        options: &ClientOptions,
    ) -> Result<(u16, Option<Value>), anyhow::Error> {
        match tokio_tungstenite::connect_async(request(url, options)?).await {
            Ok(_) => Err(anyhow::anyhow!("connection to {url} was accepted")),
            Err(WsError::Http(response)) => {
                let status = response.status().as_u16();
                let body = response
                    .body()
                    .as_deref()
                    .and_then(|bytes| serde_json::from_slice(bytes).ok());
                Ok((status, body))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Send a JSON text frame.
    pub async fn send_json(&mut self, value: &Value) -> Result<(), anyhow::Error> {
        self.stream.send(Message::Text(value.to_string())).await?;
        Ok(())
    }

    /// Send a MessagePack binary frame.
    pub async fn send_msgpack(&mut self, value: &Value) -> Result<(), anyhow::Error> {
        let bytes = rmp_serde::to_vec_named(value)?;
        self.stream.send(Message::Binary(bytes)).await?;
        Ok(())
    }

    /// Send raw bytes as a binary frame.
    pub async fn send_binary(&mut self, bytes: Vec<u8>) -> Result<(), anyhow::Error> {
        self.stream.send(Message::Binary(bytes)).await?;
        Ok(())
    }

    /// Send raw text, valid JSON or not.
    pub async fn send_text(&mut self, text: &str) -> Result<(), anyhow::Error> {
        self.stream.send(Message::Text(text.to_string())).await?;
        Ok(())
    }

    /// Next data frame decoded as a server message.
    pub async fn next_message(&mut self) -> Result<ServerMessage, anyhow::Error> {
        loop {
            let message = tokio::time::timeout(DEFAULT_RECV_TIMEOUT, self.stream.next())
                .await
                .map_err(|_| anyhow::anyhow!("timed out waiting for a server message"))?
                .ok_or_else(|| anyhow::anyhow!("stream ended"))??;

            let frame = match message {
                Message::Text(text) => WireFrame::Text(text),
                Message::Binary(bytes) => WireFrame::Binary(bytes.into()),
                Message::Close(frame) => {
                    return Err(anyhow::anyhow!("connection closed: {frame:?}"));
                }
                _ => continue,
            };

            return Ok(decode_server_message(&frame)?);
        }
    }

    /// Wait for the server's close frame and return its code.
    ///
    /// Data frames received first are skipped.
    pub async fn expect_close(&mut self) -> Result<u16, anyhow::Error> {
        loop {
            let message = tokio::time::timeout(DEFAULT_RECV_TIMEOUT, self.stream.next())
                .await
                .map_err(|_| anyhow::anyhow!("timed out waiting for close"))?
                .ok_or_else(|| anyhow::anyhow!("stream ended without a close frame"))??;

            if let Message::Close(frame) = message {
                let frame = frame.ok_or_else(|| anyhow::anyhow!("close frame had no code"))?;
                return Ok(u16::from(frame.code));
            }
        }
    }

    /// Assert no data frame arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) -> Result<(), anyhow::Error> {
        match tokio::time::timeout(window, self.stream.next()).await {
            Err(_) => Ok(()),
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) | Ok(None) => Ok(()),
            Ok(other) => Err(anyhow::anyhow!("expected silence, got {other:?}")),
        }
    }

    /// Close the connection from the client side.
    pub async fn close(mut self) -> Result<(), anyhow::Error> {
        self.stream.close(None).await?;
        Ok(())
    }
}

fn request(
    url: &str,
    options: &ClientOptions,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, anyhow::Error> {
    let url = match &options.format {
        Some(format) => format!("{url}?format={format}"),
        None => url.to_string(),
    };

    let mut request = url.into_client_request()?;
    if let Some(origin) = &options.origin {
        request
            .headers_mut()
            .insert("Origin", HeaderValue::from_str(origin)?);
    }
    Ok(request)
}
