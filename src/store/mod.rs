mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use time::OffsetDateTime;

use crate::models::{Participant, Room};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("duplicate {0}")]
    Conflict(&'static str),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("corrupt row: {0}")]
    Decode(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Fails with `Conflict` if the id is taken.
    async fn create_room(&self, room: &Room) -> Result<(), StoreError>;

    async fn get_room(&self, id: &str) -> Result<Room, StoreError>;

    /// Newest first.
    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError>;

    /// Returns false if no such room.
    async fn update_room_activity(&self, id: &str, now: OffsetDateTime) -> Result<bool, StoreError>;

    /// Removes the room and every participant in it. Returns false if the
    /// room was already gone.
    async fn delete_room(&self, id: &str) -> Result<bool, StoreError>;

    async fn add_participant(&self, participant: &Participant) -> Result<(), StoreError>;

    async fn get_participant(&self, id: &str) -> Result<Participant, StoreError>;

    /// Oldest join first.
    async fn get_participants(&self, room_id: &str) -> Result<Vec<Participant>, StoreError>;

    async fn count_participants(&self, room_id: &str) -> Result<usize, StoreError> {
        Ok(self.get_participants(room_id).await?.len())
    }

    /// Returns false if no such participant.
    async fn update_participant_activity(
        &self,
        id: &str,
        now: OffsetDateTime,
    ) -> Result<bool, StoreError>;

    /// Returns false if the participant was already gone.
    async fn remove_participant(&self, id: &str) -> Result<bool, StoreError>;

    /// Participants with `last_active_at < threshold`.
    async fn participants_inactive_since(
        &self,
        threshold: OffsetDateTime,
    ) -> Result<Vec<Participant>, StoreError>;

    /// Rooms with `last_active_at < threshold`.
    async fn rooms_inactive_since(&self, threshold: OffsetDateTime) -> Result<Vec<Room>, StoreError>;
}
