//! Read-only HTTP API.

use crate::handlers::AppState;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parley_core::{HubError, StoreError};
use serde_json::json;
use std::sync::Arc;
use tracing::warn;

/// Identities connected to this instance with their devices.
pub async fn online(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let users = state.hub.online_summary();
    Json(json!({
        "instance": state.hub.instance_id(),
        "count": users.len(),
        "users": users,
    }))
}

/// Sessions of one identity on this instance, plus its latest session on any
/// instance.
pub async fn user_devices(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Json<serde_json::Value> {
    let last_session = state.hub.cached_session(&user_id).await.ok();
    Json(json!({
        "userId": user_id,
        "devices": state.hub.devices_of(&user_id),
        "lastSession": last_session,
    }))
}

/// Durable members of a room, across all instances.
pub async fn room_members(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
) -> Response {
    match state.hub.room_members(&room_id).await {
        Ok(members) => Json(json!({ "roomId": room_id, "members": members })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": e.to_string() })),
        )
            .into_response(),
    }
}

/// A stored message by id.
pub async fn message(
    State(state): State<Arc<AppState>>,
    Path(message_id): Path<String>,
) -> Response {
    match state.hub.fetch_message(&message_id).await {
        Ok(message) => Json(message).into_response(),
        Err(HubError::Store(StoreError::NotFound(_))) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "Message not found" })),
        )
            .into_response(),
        Err(e) => {
            warn!(message = %message_id, error = %e, "Message lookup failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}
