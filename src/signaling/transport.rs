//! Transport-Schicht für das Signaling
//!
//! `Connector` öffnet eine Duplex-Verbindung und liefert sie als
//! Sink/Stream von Text-Frames. Die Produktions-Implementierung nutzt
//! WebSockets über tokio-tungstenite.

use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use thiserror::Error;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{Error as WsError, Message},
};
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("No signaling credential available")]
    MissingCredential,

    #[error("Invalid signaling endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("WebSocket connection lost: {0}")]
    ConnectionLost(String),

    #[error("Not connected to signaling server")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("Failed to encode message: {0}")]
    Serialization(String),

    #[error("Connection attempt was cancelled")]
    Cancelled,
}

// ============================================================================
// FRAMES & LINKS
// ============================================================================

/// Ein eingehender Frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Close,
}

pub type FrameSink = Pin<Box<dyn Sink<String, Error = TransportError> + Send>>;
pub type FrameStream = Pin<Box<dyn Stream<Item = Result<Frame, TransportError>> + Send>>;

/// Eine geöffnete Duplex-Verbindung
pub struct Link {
    pub sink: FrameSink,
    pub stream: FrameStream,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").finish_non_exhaustive()
    }
}

/// Öffnet Verbindungen zum Signaling-Server
#[async_trait]
pub trait Connector: Send + Sync {
    /// Löst auf, sobald der Transport bereit ist
    async fn connect(&self, endpoint: &Url) -> Result<Link, TransportError>;
}

// ============================================================================
// WEBSOCKET CONNECTOR
// ============================================================================

/// WebSocket-Connector über tokio-tungstenite
#[derive(Debug, Default, Clone)]
pub struct WsConnector;

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, endpoint: &Url) -> Result<Link, TransportError> {
        match endpoint.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(TransportError::InvalidEndpoint(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        }

        tracing::info!(
            "Connecting to signaling server: {}://{}{}",
            endpoint.scheme(),
            endpoint.host_str().unwrap_or_default(),
            endpoint.path()
        );

        let (ws_stream, _) = connect_async(endpoint.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let (write, read) = ws_stream.split();

        let sink = write
            .with(|text: String| future::ok::<_, WsError>(Message::Text(text)))
            .sink_map_err(|e| TransportError::SendFailed(e.to_string()));

        let stream = read.filter_map(|msg| {
            future::ready(match msg {
                Ok(Message::Text(text)) => Some(Ok(Frame::Text(text))),
                Ok(Message::Close(_)) => Some(Ok(Frame::Close)),
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::ConnectionLost(e.to_string()))),
            })
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
