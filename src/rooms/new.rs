use std::sync::Arc;

use axum::{
    Json, debug_handler,
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

use crate::{AppResult, AppState, lifecycle::RoomLifecycle};

#[derive(Debug, Default, Deserialize)]
pub(crate) struct NewRoomQuery {
    #[serde(default)]
    name: String,
}

/// A missing or unreadable body still creates a room, under the default name.
#[debug_handler(state = AppState)]
pub(crate) async fn new_room(
    State(lifecycle): State<Arc<RoomLifecycle>>,
    body: Bytes,
) -> AppResult<Response> {
    let NewRoomQuery { name } = serde_json::from_slice(&body).unwrap_or_default();

    let room = lifecycle.create_room(&name).await?;

    Ok((StatusCode::CREATED, Json(json!({ "room_id": room.id }))).into_response())
}
