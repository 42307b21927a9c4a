use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Bytes,
    debug_handler,
    extract::{
        Path, Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::{IntoResponse, Response},
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::{broadcast::error::RecvError, mpsc};
use tracing::{debug, info, warn};

use crate::{
    AppError, AppResult, AppState,
    config::SocketConfig,
    events::HubBus,
    hub::{Connection, Hub, Outbound},
    lifecycle::RoomLifecycle,
};

/// How long the writer gets to flush and send Close after the reader stops.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
pub(crate) struct RoomWsQuery {
    #[serde(default)]
    participant_id: String,
}

#[debug_handler(state = AppState)]
pub(crate) async fn room_ws(
    Path(room_id): Path<String>,
    Query(RoomWsQuery { participant_id }): Query<RoomWsQuery>,
    State(lifecycle): State<Arc<RoomLifecycle>>,
    State(hub): State<Arc<Hub>>,
    State(socket): State<SocketConfig>,

    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    if participant_id.is_empty() {
        return Err(AppError::validation("participant_id is required"));
    }
    lifecycle.get_room(&room_id).await?;

    Ok(ws
        .max_message_size(socket.max_frame_bytes)
        .on_upgrade(async move |stream| {
            let (conn, rx) = hub.connect(&room_id, &participant_id).await;
            serve_room(stream, hub, conn, rx, socket).await;
        }))
}

async fn serve_room(
    stream: WebSocket,
    hub: Arc<Hub>,
    conn: Arc<Connection>,
    mut rx: mpsc::Receiver<Outbound>,
    socket: SocketConfig,
) {
    let (mut sender, mut receiver) = stream.split();

    let mut write_task = tokio::spawn(async move {
        let mut ping = tokio::time::interval(socket.ping_interval);
        ping.tick().await;

        loop {
            tokio::select! {
                outbound = rx.recv() => match outbound {
                    Some(payload) => {
                        if sender.send(Message::Text(payload.as_ref().into())).await.is_err() {
                            break;
                        }
                    }
                    // unregistered or the room was closed
                    None => {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = ping.tick() => {
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let read_loop = async {
        loop {
            match tokio::time::timeout(socket.pong_timeout, receiver.next()).await {
                Ok(Some(Ok(Message::Text(text)))) => {
                    hub.relay(&conn, text.as_str()).await;
                }
                Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                // pongs and anything else just prove the peer is alive
                Ok(Some(Ok(_))) => {}
                Ok(Some(Err(e))) => {
                    debug!(conn_id = %conn.id, error = %e, "websocket read failed");
                    break;
                }
                Err(_) => {
                    info!(conn_id = %conn.id, "peer silent past pong timeout, closing");
                    break;
                }
            }
        }
    };

    let writer_done = tokio::select! {
        _ = read_loop => false,
        _ = &mut write_task => true,
    };

    hub.unregister(&conn).await;

    if !writer_done && tokio::time::timeout(CLOSE_GRACE, &mut write_task).await.is_err() {
        write_task.abort();
    }
}

/// Read-only stream of room created/deleted events.
#[debug_handler(state = AppState)]
pub(crate) async fn lobby_ws(
    State(bus): State<Arc<HubBus>>,
    State(socket): State<SocketConfig>,

    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.max_message_size(socket.max_frame_bytes)
        .on_upgrade(async move |stream| {
            let mut events = bus.subscribe_lobby();
            let (mut sender, mut receiver) = stream.split();

            let mut write_task = tokio::spawn(async move {
                let mut ping = tokio::time::interval(socket.ping_interval);
                ping.tick().await;

                loop {
                    tokio::select! {
                        event = events.recv() => match event {
                            Ok(frame) => {
                                if sender.send(Message::Text(frame.as_ref().into())).await.is_err() {
                                    break;
                                }
                            }
                            Err(RecvError::Lagged(skipped)) => {
                                warn!(skipped, "lobby listener lagged, events dropped");
                            }
                            Err(RecvError::Closed) => break,
                        },
                        _ = ping.tick() => {
                            if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            });

            let read_loop = async {
                loop {
                    match tokio::time::timeout(socket.pong_timeout, receiver.next()).await {
                        Ok(Some(Ok(Message::Close(_)))) | Ok(None) | Ok(Some(Err(_))) | Err(_) => break,
                        Ok(Some(Ok(_))) => {}
                    }
                }
            };

            tokio::select! {
                _ = read_loop => write_task.abort(),
                _ = &mut write_task => {}
            }
            debug!("lobby listener disconnected");
        })
}
