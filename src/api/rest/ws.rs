use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use futures::SinkExt;
use futures::StreamExt;
use serde_json::json;
use tracing::{info, warn};

use crate::engine::tracker::Tracking;
use crate::error::AppError;
use crate::state::AppState;

/// Streams tracking updates for one request over a websocket. An unknown
/// request is rejected with 404 before the upgrade.
pub async fn track_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let tracking = state.tracker.track(&request_id).await?;
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, tracking)))
}

async fn handle_socket(socket: WebSocket, mut tracking: Tracking) {
    let (mut sender, mut receiver) = socket.split();
    let request_id = tracking.request_id().to_string();

    info!(request_id = %request_id, "tracking client connected");

    let mut send_task = tokio::spawn(async move {
        while let Some(item) = tracking.next().await {
            let payload = match item {
                Ok(update) => serde_json::to_string(&update),
                Err(err) => serde_json::to_string(&json!({
                    "error": err.to_string(),
                    "retryable": err.is_retryable(),
                })),
            };
            let json = match payload {
                Ok(json) => json,
                Err(err) => {
                    warn!(error = %err, "failed to serialize tracking update for ws");
                    continue;
                }
            };

            if sender.send(Message::Text(json.into())).await.is_err() {
                return;
            }
        }

        let _ = sender.send(Message::Close(None)).await;
    });

    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(_msg)) = receiver.next().await {}
    });

    // Whichever side finishes first takes the other down, releasing the feed.
    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    info!(request_id = %request_id, "tracking client disconnected");
}
