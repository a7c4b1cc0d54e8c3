// ABOUTME: Connector seam between the transport channel and the underlying persistent connection
// Provides the WebSocket connector and an in-memory loopback used for local testing

use async_trait::async_trait;
use futures_util::{sink, Sink, SinkExt, Stream, StreamExt};
use std::pin::Pin;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{debug, error, info};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Connection lost: {0}")]
    Io(String),

    #[error("Link closed")]
    Closed,
}

/// Messages written to a link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkMessage {
    /// Encoded frame bytes
    Binary(Vec<u8>),
    /// Binding handshake sent once before any frame
    Text(String),
    Ping,
    Close,
}

pub type LinkSink = Pin<Box<dyn Sink<LinkMessage, Error = LinkError> + Send>>;
pub type LinkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, LinkError>> + Send>>;

/// An established duplex connection, split into its write and read halves.
pub struct Link {
    pub sink: LinkSink,
    pub stream: LinkStream,
}

#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Link, LinkError>;
}

/// Connects over WebSocket; frames travel as binary messages.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector;

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, endpoint: &str) -> Result<Link, LinkError> {
        debug!("Attempting WebSocket handshake with {}", endpoint);

        let (ws_stream, response) = connect_async(endpoint).await.map_err(|e| {
            let message = e.to_string();
            if message.contains("refused") {
                error!("Connection refused - is the terminal backend reachable at {}?", endpoint);
            } else if message.contains("lookup") {
                error!("DNS/hostname lookup failed - check the endpoint: {}", endpoint);
            }
            LinkError::Handshake(message)
        })?;

        info!("WebSocket connected to {}", endpoint);
        debug!("WebSocket response status: {:?}", response.status());

        let (ws_sender, ws_receiver) = ws_stream.split();

        let sink = ws_sender
            .sink_map_err(|e| LinkError::Io(e.to_string()))
            .with(|msg: LinkMessage| async move {
                Ok::<_, LinkError>(match msg {
                    LinkMessage::Binary(bytes) => tungstenite::Message::Binary(bytes),
                    LinkMessage::Text(text) => tungstenite::Message::Text(text),
                    LinkMessage::Ping => tungstenite::Message::Ping(Vec::new()),
                    LinkMessage::Close => tungstenite::Message::Close(None),
                })
            });

        let stream = ws_receiver.filter_map(|msg| async move {
            match msg {
                Ok(tungstenite::Message::Binary(bytes)) => Some(Ok(bytes)),
                // Some proxies re-frame binary payloads as text
                Ok(tungstenite::Message::Text(text)) => Some(Ok(text.into_bytes())),
                Ok(tungstenite::Message::Close(_)) => {
                    info!("WebSocket closed by server");
                    Some(Err(LinkError::Closed))
                }
                // Ping/Pong are answered by tungstenite itself
                Ok(_) => None,
                Err(e) => Some(Err(LinkError::Io(e.to_string()))),
            }
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        })
    }
}

/// The remote half of an in-memory link.
pub struct RemoteEnd {
    /// Everything the local side wrote, in order
    pub received: mpsc::UnboundedReceiver<LinkMessage>,
    /// Bytes pushed here are read by the local side
    pub outgoing: mpsc::UnboundedSender<Result<Vec<u8>, LinkError>>,
}

impl RemoteEnd {
    pub fn send_bytes(&self, bytes: Vec<u8>) -> bool {
        self.outgoing.send(Ok(bytes)).is_ok()
    }

    /// Simulate the remote dropping the connection.
    pub fn hang_up(&self) -> bool {
        self.outgoing.send(Err(LinkError::Closed)).is_ok()
    }
}

/// Hands out in-memory links whose remote ends are delivered through a channel.
pub struct MemoryConnector {
    remotes: mpsc::UnboundedSender<(String, RemoteEnd)>,
    refuse: bool,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<(String, RemoteEnd)>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        (
            Self {
                remotes,
                refuse: false,
            },
            rx,
        )
    }

    /// A connector whose handshakes always fail.
    pub fn refusing() -> Self {
        let (mut connector, _) = Self::new();
        connector.refuse = true;
        connector
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, endpoint: &str) -> Result<Link, LinkError> {
        if self.refuse {
            return Err(LinkError::Handshake(format!("connection refused: {}", endpoint)));
        }

        let (written_tx, written_rx) = mpsc::unbounded_channel();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();

        self.remotes
            .send((
                endpoint.to_string(),
                RemoteEnd {
                    received: written_rx,
                    outgoing: incoming_tx,
                },
            ))
            .map_err(|_| LinkError::Handshake("no remote listening".to_string()))?;

        let sink = sink::unfold(written_tx, |tx, msg: LinkMessage| async move {
            tx.send(msg).map_err(|_| LinkError::Closed)?;
            Ok::<_, LinkError>(tx)
        });

        Ok(Link {
            sink: Box::pin(sink),
            stream: Box::pin(UnboundedReceiverStream::new(incoming_rx)),
        })
    }
}
