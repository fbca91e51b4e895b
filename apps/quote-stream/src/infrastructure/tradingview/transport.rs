//! WebSocket Transport
//!
//! [`Connector`] over `tokio-tungstenite`. The service only accepts
//! upgrades carrying a browser `Origin` header. Text and binary frames are
//! both surfaced as text chunks; a close frame ends the stream with
//! [`TransportError::Closed`].

use async_trait::async_trait;
use futures::{SinkExt, StreamExt, future};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::ORIGIN;

use crate::application::ports::{Connector, Transport, TransportError};

/// Dials the streaming service over WebSocket.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
    origin: String,
}

impl WebSocketConnector {
    /// Connector for `url`, sending `origin` on the upgrade request.
    #[must_use]
    pub fn new(url: impl Into<String>, origin: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            origin: origin.into(),
        }
    }

    /// Endpoint URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Transport, TransportError> {
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let origin = HeaderValue::from_str(&self.origin)
            .map_err(|e| TransportError::Connect(format!("invalid origin: {e}")))?;
        request.headers_mut().insert(ORIGIN, origin);

        tracing::debug!(url = %self.url, "dialing websocket");
        let (ws_stream, response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        tracing::debug!(status = %response.status(), "websocket upgraded");

        let (write, read) = ws_stream.split();

        let sink = write
            .sink_map_err(|e| TransportError::Send(e.to_string()))
            .with(|frame: String| future::ready(Ok::<_, TransportError>(WsMessage::Text(frame.into()))));

        let stream = read.filter_map(|message| {
            future::ready(match message {
                Ok(WsMessage::Text(text)) => Some(Ok(text.as_str().to_owned())),
                Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes.to_vec()) {
                    Ok(text) => Some(Ok(text)),
                    Err(_) => {
                        tracing::warn!(len = bytes.len(), "dropping non-utf8 binary frame");
                        None
                    }
                },
                Ok(WsMessage::Close(frame)) => {
                    tracing::info!(frame = ?frame, "server sent close frame");
                    Some(Err(TransportError::Closed))
                }
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::Receive(e.to_string()))),
            })
        });

        Ok(Transport {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}
