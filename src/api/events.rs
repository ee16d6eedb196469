//! Producer endpoints.
//!
//! Both return `202 Accepted` once the event is handed off; delivery is
//! best-effort and never reported back to the producer.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::channel::{is_known_channel, is_valid_tenant_id};
use crate::error::{AppError, Result};
use crate::gateway::RoomId;
use crate::server::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishEventRequest {
    pub channel: String,
    #[serde(default)]
    pub tenant_id: Option<String>,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishEventResponse {
    pub accepted: bool,
    pub channel: String,
    pub tenant_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EmitRequest {
    pub room: String,
    pub event: String,
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmitResponse {
    pub room: String,
    pub delivered_locally: usize,
    pub shared: bool,
}

/// POST /api/v1/events
#[tracing::instrument(
    name = "api.publish_event",
    skip(state, request),
    fields(channel = %request.channel, tenant_id = ?request.tenant_id)
)]
pub async fn publish_event(
    State(state): State<AppState>,
    Json(request): Json<PublishEventRequest>,
) -> Result<(StatusCode, Json<PublishEventResponse>)> {
    if !is_known_channel(&request.channel) {
        return Err(AppError::Validation(format!(
            "unknown channel: {}",
            request.channel
        )));
    }

    match request.tenant_id.as_deref() {
        Some(tenant) if !is_valid_tenant_id(tenant) => {
            return Err(AppError::Validation(format!("invalid tenant id: {}", tenant)));
        }
        None if state.settings.tenant.enabled => {
            return Err(AppError::Validation(
                "tenantId is required in multi-tenant mode".into(),
            ));
        }
        _ => {}
    }

    state
        .router
        .publish(&request.channel, request.data, request.tenant_id.as_deref())
        .detach();

    Ok((
        StatusCode::ACCEPTED,
        Json(PublishEventResponse {
            accepted: true,
            channel: request.channel,
            tenant_id: request.tenant_id,
        }),
    ))
}

/// POST /api/v1/emit
#[tracing::instrument(
    name = "api.emit",
    skip(state, request),
    fields(room = %request.room, event = %request.event)
)]
pub async fn emit_to_room(
    State(state): State<AppState>,
    Json(request): Json<EmitRequest>,
) -> Result<(StatusCode, Json<EmitResponse>)> {
    let room = RoomId::parse(&request.room)
        .ok_or_else(|| AppError::Validation(format!("invalid room: {}", request.room)))?;

    if room.tenant_id().is_some() != state.settings.tenant.enabled {
        return Err(AppError::Validation(format!(
            "room {} does not match the tenant mode",
            room
        )));
    }

    if request.event.trim().is_empty() {
        return Err(AppError::Validation("event must not be empty".into()));
    }

    let delivered_locally = state
        .gateway
        .emit_to_room(&room, &request.event, request.data)
        .await;

    Ok((
        StatusCode::ACCEPTED,
        Json(EmitResponse {
            room: room.to_string(),
            delivered_locally,
            shared: state.gateway.session_share().is_shared(),
        }),
    ))
}
