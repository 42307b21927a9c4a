mod msg;
mod new;
mod room;
mod ws;

use axum::{
    Router,
    routing::{get, post},
};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(room::list_rooms).post(new::new_room))
        .route("/{room_id}", get(room::room))
        .route("/{room_id}/join", post(room::join))
        .route("/{room_id}/leave", post(room::leave))
        .route("/{room_id}/heartbeat", post(room::heartbeat))
        .route("/{room_id}/messages", get(msg::messages).post(msg::send_msg))
}

pub fn ws_router() -> Router<AppState> {
    Router::new()
        .route("/lobby", get(ws::lobby_ws))
        .route("/{room_id}", get(ws::room_ws))
}
