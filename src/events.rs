//! Room and lobby events, sent as `{"type", "payload"}` envelopes.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::debug;

use crate::hub::{Hub, Outbound};
use crate::models::{Participant, Room};

pub const LOBBY_TOPIC: &str = "rooms:lobby";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Topic {
    Room(String),
    Lobby,
}

impl Topic {
    pub fn room(room_id: impl Into<String>) -> Self {
        Self::Room(room_id.into())
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Room(id) => write!(f, "room:{id}"),
            Topic::Lobby => f.write_str(LOBBY_TOPIC),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Room,
    Participant,
    Message,
    Typing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceAction {
    Join,
    Leave,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomAction {
    Created,
    Deleted,
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(rename = "type")]
    kind: EventKind,
    payload: &'a Value,
}

pub fn encode(kind: EventKind, payload: &Value) -> Result<String, PublishError> {
    Ok(serde_json::to_string(&Envelope { kind, payload })?)
}

pub fn presence_payload(action: PresenceAction, participant: &Participant) -> Value {
    json!({
        "action": action,
        "participant": {
            "id": participant.id,
            "room_id": participant.room_id,
            "username": participant.username,
            "avatar": participant.avatar,
        },
    })
}

pub fn room_payload(action: RoomAction, room: &Room) -> Value {
    json!({
        "action": action,
        "room": {
            "id": room.id,
            "name": room.name,
        },
    })
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait EventBus: Send + Sync {
    async fn publish(&self, topic: Topic, kind: EventKind, payload: Value) -> Result<(), PublishError>;
}

/// In-process bus: room topics fan out through the hub, the lobby through a
/// broadcast channel that lobby sockets subscribe to.
pub struct HubBus {
    hub: Arc<Hub>,
    lobby: broadcast::Sender<Outbound>,
}

impl HubBus {
    pub fn new(hub: Arc<Hub>, lobby_capacity: usize) -> Self {
        let (lobby, _) = broadcast::channel(lobby_capacity.max(1));
        Self { hub, lobby }
    }

    pub fn subscribe_lobby(&self) -> broadcast::Receiver<Outbound> {
        self.lobby.subscribe()
    }

    pub fn lobby_subscribers(&self) -> usize {
        self.lobby.receiver_count()
    }
}

#[async_trait]
impl EventBus for HubBus {
    async fn publish(&self, topic: Topic, kind: EventKind, payload: Value) -> Result<(), PublishError> {
        let frame: Outbound = Arc::from(encode(kind, &payload)?);

        match &topic {
            Topic::Room(room_id) => {
                let delivered = self.hub.broadcast(room_id, frame, None).await;
                debug!(%topic, ?kind, delivered, "event published");
            }
            Topic::Lobby => {
                // no lobby listeners is not a failure
                let delivered = self.lobby.send(frame).unwrap_or(0);
                debug!(%topic, ?kind, delivered, "event published");
            }
        }
        Ok(())
    }
}
