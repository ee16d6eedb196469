use std::sync::Arc;

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, HeaderName},
    response::Response,
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;

use crate::gateway::{ConnectionGateway, ConnectionHandle, ConnectionState, GatewayError, Handshake};
use crate::metrics::GatewayMetrics;
use crate::server::AppState;

use super::message::{ClientMessage, OutboundMessage, ServerMessage};

/// Close code when a rejection carries none of its own
const POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: Option<String>,
}

/// WebSocket upgrade handler. Authentication runs after the upgrade so a
/// rejected client still receives an error frame and a close code.
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query, headers),
    fields(has_query_token = query.token.is_some())
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
) -> Response {
    let handshake = Handshake {
        token: extract_token(&query, &headers),
        origin: header_value(&headers, header::ORIGIN),
        host: header_value(&headers, header::HOST),
    };

    let gateway = state.gateway.clone();
    ws.on_upgrade(move |socket| handle_socket(socket, gateway, handshake))
}

/// Token from the `token` query parameter, else `Authorization: Bearer`
fn extract_token(query: &WsQuery, headers: &HeaderMap) -> Option<String> {
    if let Some(ref token) = query.token {
        return Some(token.clone());
    }

    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn header_value(headers: &HeaderMap, name: HeaderName) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

#[tracing::instrument(name = "ws.connection", skip_all, fields(otel.kind = "server"))]
async fn handle_socket(socket: WebSocket, gateway: Arc<ConnectionGateway>, handshake: Handshake) {
    let mut state = ConnectionState::Connecting;
    let (handle, mut rx) = match gateway.admit(&handshake, &mut state).await {
        Ok(admitted) => admitted,
        Err(e) => {
            reject(socket, &e).await;
            return;
        }
    };
    let connection_id = handle.id;

    let (mut ws_sender, mut ws_receiver) = socket.split();

    let mut send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let frame = match outbound {
                OutboundMessage::Message(message) => match serde_json::to_string(&message) {
                    Ok(text) => Message::Text(text.into()),
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to serialize message");
                        continue;
                    }
                },
                OutboundMessage::Preserialized(text) => Message::Text((&*text).into()),
                OutboundMessage::Close { code, reason } => {
                    let _ = ws_sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };

            if ws_sender.send(frame).await.is_err() {
                break;
            }
        }
    });

    let recv_gateway = gateway.clone();
    let recv_handle = handle.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(result) = ws_receiver.next().await {
            match result {
                Ok(msg) => {
                    if !process_message(msg, &recv_gateway, &recv_handle).await {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "WebSocket receive error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => {
            tracing::debug!(connection_id = %connection_id, "Send task completed");
            recv_task.abort();
        }
        _ = &mut recv_task => {
            tracing::debug!(connection_id = %connection_id, "Receive task completed");
            send_task.abort();
        }
    }

    gateway.disconnect(connection_id).await;
}

/// Send the error frame, then close with the error's code.
async fn reject(mut socket: WebSocket, error: &GatewayError) {
    GatewayMetrics::record_rejected(error.code());
    tracing::warn!(code = error.code(), error = %error, "WebSocket handshake rejected");

    let frame = ServerMessage::error(error.code(), error.to_string());
    if let Ok(text) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(text.into())).await;
    }

    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: error.close_code().unwrap_or(POLICY_VIOLATION),
            reason: error.code().into(),
        })))
        .await;
}

/// Returns false when the connection should be closed
async fn process_message(msg: Message, gateway: &ConnectionGateway, handle: &Arc<ConnectionHandle>) -> bool {
    match msg {
        Message::Text(text) => {
            handle.update_activity();

            let client_msg: ClientMessage = match serde_json::from_str(text.as_str()) {
                Ok(m) => m,
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to parse client message");
                    let _ = handle
                        .send(ServerMessage::error("INVALID_MESSAGE", e.to_string()))
                        .await;
                    return true;
                }
            };

            handle_client_message(client_msg, gateway, handle).await;
            true
        }
        Message::Binary(_) => {
            let _ = handle
                .send(ServerMessage::error(
                    "UNSUPPORTED_FORMAT",
                    "Binary messages are not supported",
                ))
                .await;
            true
        }
        Message::Ping(_) | Message::Pong(_) => {
            handle.update_activity();
            true
        }
        Message::Close(_) => {
            tracing::debug!(connection_id = %handle.id, "Received close frame");
            false
        }
    }
}

#[tracing::instrument(
    name = "ws.message",
    skip(gateway, handle),
    fields(
        connection_id = %handle.id,
        user_id = %handle.user_id,
        message_type = msg.kind()
    )
)]
async fn handle_client_message(msg: ClientMessage, gateway: &ConnectionGateway, handle: &Arc<ConnectionHandle>) {
    GatewayMetrics::record_client_message(msg.kind());

    let reply = match msg {
        ClientMessage::Join(target) => match gateway.join(handle, &target).await {
            Ok(_) => ServerMessage::Joined { payload: target },
            Err(e) => ServerMessage::error(e.code(), e.to_string()),
        },
        ClientMessage::Leave(target) => match gateway.leave(handle, &target).await {
            Ok(_) => ServerMessage::Left { payload: target },
            Err(e) => ServerMessage::error(e.code(), e.to_string()),
        },
        ClientMessage::Ping => ServerMessage::Pong,
    };

    let _ = handle.send(reply).await;
}
