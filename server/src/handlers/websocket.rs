//! WebSocket transport.
//!
//! Each text frame carries one JSON message. Outgoing messages are queued on
//! the session's channel and written by a separate task.

use std::sync::Arc;

use axum::extract::ws::{Message as Frame, WebSocket};
use futures::{SinkExt, StreamExt};
use tether_engine::Message;
use tokio::sync::mpsc;

use crate::server::SyncServer;

/// Serve an upgraded WebSocket connection until it closes.
pub async fn handle_websocket_connection(socket: WebSocket, server: Arc<SyncServer>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    let session = server.open_session(tx).await;
    let conn_id = session.conn_id().to_string();
    tracing::info!(conn_id = %conn_id, "WebSocket client connected");

    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match message.to_json() {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Frame::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Frame::Text(text)) => match Message::from_json(&text) {
                Ok(message) => session.dispatch(message).await,
                Err(e) => {
                    tracing::warn!(conn_id = %conn_id, "Ignoring invalid message: {}", e);
                }
            },
            Ok(Frame::Binary(_)) => {
                tracing::warn!("Binary messages not supported");
            }
            Ok(Frame::Ping(data)) => {
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Ok(Frame::Pong(_)) => {
                tracing::trace!("Received pong");
            }
            Ok(Frame::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    drop(session);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        active_connections = server.connections().connection_count(),
        "WebSocket client disconnected"
    );
}
