use std::sync::Arc;

use axum::{
    Json, debug_handler,
    extract::{Path, Query, State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;
use time::{OffsetDateTime, format_description::well_known::Rfc3339};

use crate::{AppError, AppResult, AppState, lifecycle::RoomLifecycle, models::MessageDraft};

use super::room::body;

#[derive(Debug, Deserialize)]
pub(crate) struct MessagesQuery {
    after: Option<String>,
}

/// Polling fallback for clients without a live socket.
#[debug_handler(state = AppState)]
pub(crate) async fn messages(
    State(lifecycle): State<Arc<RoomLifecycle>>,
    Path(room_id): Path<String>,
    Query(MessagesQuery { after }): Query<MessagesQuery>,
) -> AppResult<Response> {
    let after = match after.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(
            OffsetDateTime::parse(raw, &Rfc3339)
                .map_err(|_| AppError::validation("invalid 'after' timestamp format"))?,
        ),
    };

    let messages = lifecycle.get_messages(&room_id, after).await;
    Ok(Json(json!({ "messages": messages })).into_response())
}

#[debug_handler(state = AppState)]
pub(crate) async fn send_msg(
    State(lifecycle): State<Arc<RoomLifecycle>>,
    Path(room_id): Path<String>,
    payload: Result<Json<MessageDraft>, JsonRejection>,
) -> AppResult<Response> {
    let draft = body(payload)?;

    let message = lifecycle.send_message(&room_id, draft).await?;
    Ok((StatusCode::CREATED, Json(message)).into_response())
}
