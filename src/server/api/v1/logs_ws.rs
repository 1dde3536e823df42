//! Live log streaming over WebSocket.
//!
//! A single cooperative loop per socket alternates a short-timeout receive
//! (for client `offset=N` seeks) with a store poll, pushing frames of the
//! same shape as the REST logs endpoint. No fan-out machinery is involved;
//! each socket polls independently.

use std::time::Duration;

use axum::extract::Path;
use axum::extract::State;
use axum::extract::WebSocketUpgrade;
use axum::extract::ws::CloseFrame;
use axum::extract::ws::Message;
use axum::extract::ws::WebSocket;
use axum::http::HeaderMap;
use axum::response::Response;
use uuid::Uuid;

use super::super::AppState;
use super::super::authenticate_consumer;
use super::models::LogsResponse;

/// Close code for authentication failures.
const CLOSE_UNAUTHORIZED: u16 = 4401;

/// Close code for a missing or unowned job.
const CLOSE_NOT_FOUND: u16 = 4404;

/// How long each iteration waits for a client message before polling.
const RECEIVE_WINDOW: Duration = Duration::from_millis(500);

/// Maximum chunks pushed per frame.
const FRAME_LIMIT: i64 = 200;

/// Upgrade to a WebSocket that streams a job's log chunks.
///
/// Authentication happens after the upgrade, from the headers sent with it;
/// failures surface as application close codes rather than HTTP statuses.
pub async fn job_logs_ws(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| stream_logs(state, id, headers, socket))
}

/// Drive one log-streaming socket to completion.
async fn stream_logs(state: AppState, id: Uuid, headers: HeaderMap, mut socket: WebSocket) {
    let consumer = match authenticate_consumer(&state, &headers).await {
        Ok(consumer) => consumer,
        Err(_) => {
            close(socket, CLOSE_UNAUTHORIZED, "unauthorized").await;
            return;
        }
    };

    match state.db().get_job(id).await {
        Ok(Some(job)) if job.consumer_id == consumer.id => {}
        Ok(_) => {
            close(socket, CLOSE_NOT_FOUND, "job not found").await;
            return;
        }
        Err(e) => {
            tracing::error!("failed to load job for log stream: {e:#}");
            return;
        }
    }

    let mut offset: i64 = 0;
    loop {
        // Give the client a short window to rewind or seek the cursor.
        match tokio::time::timeout(RECEIVE_WINDOW, socket.recv()).await {
            Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => return,
            Ok(Some(Ok(Message::Text(text)))) => {
                if let Some(rest) = text.as_str().strip_prefix("offset=")
                    && let Ok(requested) = rest.trim().parse::<i64>()
                {
                    offset = requested.max(0);
                }
            }
            Ok(Some(Ok(_))) => {}
            Err(_) => {}
        }

        let chunks = match state.db().list_log_chunks(id, offset, FRAME_LIMIT).await {
            Ok(chunks) => chunks,
            Err(e) => {
                tracing::error!("failed to poll log chunks for stream: {e:#}");
                return;
            }
        };

        let Some(last) = chunks.last() else {
            continue;
        };
        let next_offset_seq = last.seq + 1;

        let frame = LogsResponse {
            job_id: id,
            next_offset_seq,
            chunks,
        };
        let Ok(payload) = serde_json::to_string(&frame) else {
            return;
        };
        if socket.send(Message::Text(payload.into())).await.is_err() {
            return;
        }

        offset = next_offset_seq;
    }
}

/// Close the socket with an application close code.
async fn close(mut socket: WebSocket, code: u16, reason: &'static str) {
    socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await
        .ok();
}
