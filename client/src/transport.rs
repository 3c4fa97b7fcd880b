//! Message transports.
//!
//! A [`Connector`] opens a [`Channel`]: an ordered, reliable pair of message
//! queues to the server. The channel is closed when the inbound queue ends.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tether_engine::Message;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message as Frame};

use crate::error::{Error, Result};

/// An open connection to the server.
#[derive(Debug)]
pub struct Channel {
    /// Messages to the server
    pub tx: mpsc::UnboundedSender<Message>,
    /// Messages from the server
    pub rx: mpsc::UnboundedReceiver<Message>,
}

/// Opens connections to the server.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self) -> Result<Channel>;
}

#[async_trait]
impl<F> Connector for F
where
    F: Fn() -> Channel + Send + Sync,
{
    async fn connect(&self) -> Result<Channel> {
        Ok(self())
    }
}

/// Connects over WebSocket, one JSON message per text frame.
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    url: String,
}

impl WebSocketConnector {
    /// Connect to a `ws://` or `wss://` URL, e.g. `ws://localhost:8080/ws`.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self) -> Result<Channel> {
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = socket.split();
        tracing::info!(url = %self.url, "Connected to sync server");

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<Message>();

        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let text = match message.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        tracing::error!("Failed to serialize message: {}", e);
                        continue;
                    }
                };
                if let Err(e) = ws_sender.send(Frame::text(text)).await {
                    tracing::warn!("Failed to send WebSocket message: {}", e);
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_receiver.next().await {
                match frame {
                    Ok(Frame::Text(text)) => match Message::from_json(text.as_str()) {
                        Ok(message) => {
                            if in_tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Ignoring invalid message: {}", e),
                    },
                    Ok(Frame::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("WebSocket error: {}", e);
                        break;
                    }
                }
            }
            tracing::debug!("WebSocket reader finished");
        });

        Ok(Channel {
            tx: out_tx,
            rx: in_rx,
        })
    }
}
