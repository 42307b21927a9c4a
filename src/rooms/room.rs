use std::sync::Arc;

use axum::{
    Json, debug_handler,
    body::Bytes,
    extract::{Path, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    AppError, AppResult, AppState,
    lifecycle::{LeaveOutcome, RoomLifecycle},
};

#[derive(Debug, Deserialize)]
pub(crate) struct JoinRoomQuery {
    #[serde(default)]
    username: String,
    #[serde(default)]
    avatar: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct LeaveRoomQuery {
    #[serde(default)]
    participant_id: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct HeartbeatQuery {
    #[serde(default)]
    participant_id: Option<String>,
}

pub(super) fn body<T>(payload: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AppError::validation(format!("invalid request body: {}", rejection.body_text())))
}

#[debug_handler(state = AppState)]
pub(crate) async fn list_rooms(State(lifecycle): State<Arc<RoomLifecycle>>) -> AppResult<Response> {
    let rooms = lifecycle.list_rooms().await?;
    Ok(Json(rooms).into_response())
}

#[debug_handler(state = AppState)]
pub(crate) async fn room(
    State(lifecycle): State<Arc<RoomLifecycle>>,
    Path(room_id): Path<String>,
) -> AppResult<Response> {
    let (room, participants) = lifecycle.get_room(&room_id).await?;
    Ok(Json(json!({ "room": room, "participants": participants })).into_response())
}

#[debug_handler(state = AppState)]
pub(crate) async fn join(
    State(lifecycle): State<Arc<RoomLifecycle>>,
    Path(room_id): Path<String>,
    payload: Result<Json<JoinRoomQuery>, JsonRejection>,
) -> AppResult<Response> {
    let JoinRoomQuery { username, avatar } = body(payload)?;

    let joined = lifecycle.join_room(&room_id, &username, &avatar).await?;
    Ok(Json(joined).into_response())
}

#[debug_handler(state = AppState)]
pub(crate) async fn leave(
    State(lifecycle): State<Arc<RoomLifecycle>>,
    Path(room_id): Path<String>,
    payload: Result<Json<LeaveRoomQuery>, JsonRejection>,
) -> AppResult<Response> {
    let LeaveRoomQuery { participant_id } = body(payload)?;

    match lifecycle.leave_room(&room_id, &participant_id).await? {
        LeaveOutcome::Left { room_deleted } => {
            tracing::debug!(room_id, participant_id, room_deleted, "leave handled");
        }
        LeaveOutcome::AlreadyGone => {}
    }
    Ok(StatusCode::NO_CONTENT.into_response())
}

/// Body is optional; without a participant id only the room is refreshed.
#[debug_handler(state = AppState)]
pub(crate) async fn heartbeat(
    State(lifecycle): State<Arc<RoomLifecycle>>,
    Path(room_id): Path<String>,
    body: Bytes,
) -> AppResult<Response> {
    let HeartbeatQuery { participant_id } = serde_json::from_slice(&body).unwrap_or_default();

    lifecycle.heartbeat(&room_id, participant_id.as_deref()).await?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
