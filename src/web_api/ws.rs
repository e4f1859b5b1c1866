//! Viewer WebSocket endpoint
//!
//! One connection views one camera. Frames flow as binary messages; small
//! JSON control messages (status requests and replies) are interleaved as
//! text. The connection is registered with the bridge on upgrade and
//! deregistered on close or error.

use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;

pub async fn viewer_ws(
    ws: WebSocketUpgrade,
    Path(camera_id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_viewer(socket, camera_id, state))
}

async fn handle_viewer(socket: WebSocket, camera_id: String, state: AppState) {
    let (connection_id, mut frames) = state.bridge.register(&camera_id).await;
    let (mut sink, mut stream) = socket.split();

    // Single writer: frames and control replies share one outbound channel,
    // so the sink has exactly one owner
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(async move {
        while let Some(message) = out_rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    loop {
        tokio::select! {
            frame = frames.recv() => {
                match frame {
                    Some(frame) => {
                        if out_tx.send(Message::Binary(frame.as_ref().clone())).is_err() {
                            break;
                        }
                    }
                    // Bridge dropped the connection (send failure path)
                    None => break,
                }
            }
            inbound = stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) if text.trim() == "status" => {
                        let stats = state.stats_cache.get(&camera_id).await;
                        let reply = json!({
                            "type": "status",
                            "camera_id": camera_id,
                            "stats": stats,
                        });
                        if out_tx.send(Message::Text(reply.to_string())).is_err() {
                            break;
                        }
                    }
                    // Ping is answered by axum automatically
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    drop(out_tx);
    let _ = writer.await;
    state.bridge.unregister(&camera_id, &connection_id).await;
    tracing::debug!(camera_id = %camera_id, connection_id = %connection_id, "Viewer socket closed");
}
