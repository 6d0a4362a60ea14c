//! WebSocket transport for the gateway.
//!
//! One writer task drains the connection's outbound queue and sends the
//! heartbeat pings; the upgrade task reads client messages until the socket
//! closes.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use sy_core::protocol::{ErrorCode, ServerFrame};
use tracing::{debug, trace, warn};

use crate::http_api::ApiState;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<ApiState>) {
    let gateway = state.gateway.clone();
    let (conn, outbound) = gateway.connect();
    let connection_id = conn.id();
    let (mut ws_tx, mut ws_rx) = socket.split();

    let writer_conn = conn.clone();
    let heartbeat_interval = state.heartbeat_interval;
    let writer = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(heartbeat_interval);
        // The first tick completes immediately.
        heartbeat.tick().await;
        loop {
            tokio::select! {
                frame = outbound.recv_async() => {
                    let Ok(frame) = frame else { break };
                    let json = match serde_json::to_string(&frame) {
                        Ok(json) => json,
                        Err(e) => {
                            warn!(%connection_id, error = %e, "failed to encode server frame");
                            continue;
                        }
                    };
                    trace!(%connection_id, bytes = json.len(), "frame out");
                    if ws_tx.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if writer_conn.is_closed() {
                        break;
                    }
                    if ws_tx.send(Message::Ping(Vec::new().into())).await.is_err() {
                        debug!(%connection_id, "heartbeat ping failed, connection lost");
                        break;
                    }
                }
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(msg) = ws_rx.next().await {
        match msg {
            Ok(Message::Text(text)) => gateway.on_text(connection_id, text.as_str()).await,
            Ok(Message::Binary(_)) => {
                conn.push(ServerFrame::error(
                    None,
                    ErrorCode::MalformedFrame,
                    "binary frames are not supported",
                ));
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => gateway.touch(connection_id),
            Ok(Message::Close(_)) => break,
            Err(e) => {
                debug!(%connection_id, error = %e, "websocket read failed");
                break;
            }
        }
        if conn.is_closed() {
            // Swept as stale while we were reading.
            break;
        }
    }

    gateway.on_disconnect(connection_id);
    writer.abort();
}
