//! WebSocket streaming endpoint.
//!
//! Each socket gets a registered connection with a bounded outbound queue.
//! Outbound frames are `analysis_update` and `queue_overflow` JSON messages;
//! inbound frames adjust channel subscriptions.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::Extension;
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::server::app::AppState;

/// Channel subscription commands sent by the client.
#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe { channels: Vec<String> },
    Unsubscribe { channels: Vec<String> },
}

pub async fn stream_handler(
    Extension(state): Extension<AppState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, mut socket: WebSocket) {
    let handle = state.connections.register();
    let connection_id = handle.id();
    if let Err(err) = state.connections.open(connection_id).await {
        warn!(connection_id = %connection_id, error = %err, "failed to open connection");
        state.connections.deregister(connection_id).await;
        return;
    }
    debug!(connection_id = %connection_id, "websocket connected");

    let hello = json!({ "type": "connected", "connection_id": connection_id });
    if socket.send(Message::Text(hello.to_string())).await.is_err() {
        state.connections.deregister(connection_id).await;
        return;
    }

    loop {
        tokio::select! {
            outbound = handle.next_message() => {
                match outbound {
                    Some(push) => {
                        let frame = Message::Text(push.to_json().to_string());
                        if socket.send(frame).await.is_err() {
                            break;
                        }
                    }
                    // Queue drained after close.
                    None => break,
                }
            }
            inbound = socket.recv() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        handle_client_message(&state, connection_id, &mut socket, &text).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        debug!(connection_id = %connection_id, error = %err, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    state.connections.deregister(connection_id).await;
    debug!(connection_id = %connection_id, "websocket disconnected");
}

async fn handle_client_message(
    state: &AppState,
    connection_id: uuid::Uuid,
    socket: &mut WebSocket,
    text: &str,
) {
    let parsed: Result<ClientMessage, _> = serde_json::from_str(text);
    let ack = match parsed {
        Ok(ClientMessage::Subscribe { channels }) => {
            match state
                .connections
                .subscribe_channels(connection_id, channels.clone())
                .await
            {
                Ok(()) => json!({ "type": "subscribed", "channels": channels }),
                Err(err) => json!({ "type": "error", "message": err.to_string() }),
            }
        }
        Ok(ClientMessage::Unsubscribe { channels }) => {
            match state
                .connections
                .unsubscribe_channels(connection_id, channels.clone())
                .await
            {
                Ok(()) => json!({ "type": "unsubscribed", "channels": channels }),
                Err(err) => json!({ "type": "error", "message": err.to_string() }),
            }
        }
        Err(err) => json!({ "type": "error", "message": format!("malformed message: {err}") }),
    };

    let _ = socket.send(Message::Text(ack.to_string())).await;
}
