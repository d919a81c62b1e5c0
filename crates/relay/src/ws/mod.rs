// WebSocket endpoint: one socket per (client, shard) pair.
//
// The socket task only moves frames. Classification happens once on
// receipt, everything else is the room's job.

use std::time::Instant;

use axum::{
    extract::{
        ws::{close_code, rejection::WebSocketUpgradeRejection, CloseFrame, Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use decksync_common::protocol::InboundFrame;
use decksync_common::types::ShardId;
use tracing::{debug, info, warn};

use crate::error::{
    current_request_id, request_id_from_headers_or_generate, with_request_id_scope, ErrorCode,
    RelayError,
};
use crate::room::{Membership, Outbound};
use crate::AppState;

pub async fn ws_upgrade(
    Path(raw_shard_id): Path<String>,
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let shard_id = match ShardId::new(raw_shard_id) {
        Ok(shard_id) => shard_id,
        Err(error) => {
            return RelayError::invalid_shard_id(error.to_string()).into_response();
        }
    };
    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            return RelayError::new(ErrorCode::UpgradeRequired, rejection.body_text())
                .into_response();
        }
    };

    let max_frame_bytes = state.config.max_frame_bytes;
    let request_id = request_id_from_headers_or_generate(&headers);
    ws.max_frame_size(max_frame_bytes)
        .on_upgrade(move |socket| async move {
            with_request_id_scope(request_id, handle_socket(state, shard_id, socket)).await;
        })
        .into_response()
}

fn frame_size_exceeded_reason(limit: usize) -> String {
    format!("websocket frame exceeds maximum size of {limit} bytes")
}

fn is_frame_size_violation(error: &axum::Error) -> bool {
    let message = error.to_string().to_ascii_lowercase();
    message.contains("message too long")
        || message.contains("frame too long")
        || message.contains("too large")
        || message.contains("too big")
        || message.contains("size limit")
}

async fn close_frame_too_large(socket: &mut WebSocket, limit: usize) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: close_code::SIZE,
            reason: frame_size_exceeded_reason(limit).into(),
        })))
        .await;
}

async fn send_outbound(socket: &mut WebSocket, outbound: Outbound) -> Result<(), axum::Error> {
    match outbound {
        Outbound::Binary(bytes) => socket.send(Message::Binary(bytes.into())).await,
        Outbound::Text(text) => socket.send(Message::Text(text.into())).await,
    }
}

async fn handle_socket(state: AppState, shard_id: ShardId, mut socket: WebSocket) {
    let request_id = current_request_id().unwrap_or_else(|| "unknown".to_string());
    let limit = state.config.max_frame_bytes;
    let Membership { member, room, mut outbound } = state.rooms.join(&shard_id);
    info!(shard_id = %shard_id, member, request_id = %request_id, "client connected");

    // Heartbeat: ping every interval, disconnect if no pong arrives within
    // the timeout.
    let mut heartbeat_interval = tokio::time::interval(state.config.heartbeat_interval);
    heartbeat_interval.reset(); // skip immediate first tick
    let mut last_pong = Instant::now();
    let heartbeat_timeout = state.config.heartbeat_timeout;

    loop {
        tokio::select! {
            _ = heartbeat_interval.tick() => {
                if last_pong.elapsed() > heartbeat_interval.period() + heartbeat_timeout {
                    warn!(
                        shard_id = %shard_id,
                        member,
                        request_id = %request_id,
                        "heartbeat timeout, disconnecting"
                    );
                    break;
                }
                if socket.send(Message::Ping(vec![].into())).await.is_err() {
                    break;
                }
            }
            maybe_outbound = outbound.recv() => {
                let Some(message) = maybe_outbound else {
                    break;
                };
                if send_outbound(&mut socket, message).await.is_err() {
                    break;
                }
            }
            maybe_message = socket.recv() => {
                let Some(message) = maybe_message else {
                    break;
                };

                match message {
                    Ok(Message::Binary(bytes)) => {
                        if bytes.len() > limit {
                            close_frame_too_large(&mut socket, limit).await;
                            break;
                        }
                        if !room.send_inbound(member, InboundFrame::from_binary(bytes.to_vec())) {
                            break;
                        }
                    }
                    Ok(Message::Text(text)) => {
                        if text.len() > limit {
                            close_frame_too_large(&mut socket, limit).await;
                            break;
                        }
                        if !room.send_inbound(member, InboundFrame::from_text(text.to_string())) {
                            break;
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Ok(Message::Pong(_)) => {
                        last_pong = Instant::now();
                    }
                    Ok(Message::Close(_)) => break,
                    Err(error) => {
                        if is_frame_size_violation(&error) {
                            close_frame_too_large(&mut socket, limit).await;
                        } else {
                            debug!(shard_id = %shard_id, member, error = %error, "socket error");
                        }
                        break;
                    }
                }
            }
        }
    }

    state.rooms.leave(&shard_id, member);
    info!(shard_id = %shard_id, member, request_id = %request_id, "client disconnected");
}
