use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
    pub id: String,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active_at: OffsetDateTime,
    /// Opaque to the server. Generated once, handed back to joiners.
    pub key_handle: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
    pub id: String,
    pub name: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active_at: OffsetDateTime,
    pub participant_count: usize,
}

impl RoomSummary {
    pub fn new(room: Room, participant_count: usize) -> Self {
        Self {
            id: room.id,
            name: room.name,
            created_at: room.created_at,
            last_active_at: room.last_active_at,
            participant_count,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Participant {
    pub id: String,
    pub room_id: String,
    pub username: String,
    pub avatar: String,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_active_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyContext {
    pub username: String,
    /// Truncated, still-encrypted snippet of the message being answered.
    pub content: String,
}

/// A chat message as kept in the backfill log. `content` is ciphertext and is
/// never inspected.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub room_id: String,
    pub participant_id: String,
    pub content: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<ReplyContext>,
}

/// What a sender supplies; id and timestamp are assigned on append.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessageDraft {
    pub participant_id: String,
    pub content: String,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub avatar: String,
    #[serde(default)]
    pub reply_to: Option<ReplyContext>,
}
