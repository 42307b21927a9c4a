use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;

use super::{SessionStore, StoreError};
use crate::models::{Participant, Room};

#[derive(Default)]
struct Tables {
    rooms: HashMap<String, Room>,
    participants: HashMap<String, Participant>,
}

#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_room(&self, room: &Room) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if tables.rooms.contains_key(&room.id) {
            return Err(StoreError::Conflict("room"));
        }
        tables.rooms.insert(room.id.clone(), room.clone());
        Ok(())
    }

    async fn get_room(&self, id: &str) -> Result<Room, StoreError> {
        self.tables
            .read()
            .await
            .rooms
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound("room"))
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let mut rooms: Vec<Room> = self.tables.read().await.rooms.values().cloned().collect();
        rooms.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rooms)
    }

    async fn update_room_activity(&self, id: &str, now: OffsetDateTime) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        Ok(match tables.rooms.get_mut(id) {
            Some(room) => {
                room.last_active_at = now;
                true
            }
            None => false,
        })
    }

    async fn delete_room(&self, id: &str) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        let removed = tables.rooms.remove(id).is_some();
        tables.participants.retain(|_, p| p.room_id != id);
        Ok(removed)
    }

    async fn add_participant(&self, participant: &Participant) -> Result<(), StoreError> {
        let mut tables = self.tables.write().await;
        if !tables.rooms.contains_key(&participant.room_id) {
            return Err(StoreError::NotFound("room"));
        }
        if tables.participants.contains_key(&participant.id) {
            return Err(StoreError::Conflict("participant"));
        }
        tables
            .participants
            .insert(participant.id.clone(), participant.clone());
        Ok(())
    }

    async fn get_participant(&self, id: &str) -> Result<Participant, StoreError> {
        self.tables
            .read()
            .await
            .participants
            .get(id)
            .cloned()
            .ok_or(StoreError::NotFound("participant"))
    }

    async fn get_participants(&self, room_id: &str) -> Result<Vec<Participant>, StoreError> {
        let mut participants: Vec<Participant> = self
            .tables
            .read()
            .await
            .participants
            .values()
            .filter(|p| p.room_id == room_id)
            .cloned()
            .collect();
        participants.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.id.cmp(&b.id)));
        Ok(participants)
    }

    async fn count_participants(&self, room_id: &str) -> Result<usize, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .participants
            .values()
            .filter(|p| p.room_id == room_id)
            .count())
    }

    async fn update_participant_activity(
        &self,
        id: &str,
        now: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let mut tables = self.tables.write().await;
        Ok(match tables.participants.get_mut(id) {
            Some(participant) => {
                participant.last_active_at = now;
                true
            }
            None => false,
        })
    }

    async fn remove_participant(&self, id: &str) -> Result<bool, StoreError> {
        Ok(self.tables.write().await.participants.remove(id).is_some())
    }

    async fn participants_inactive_since(
        &self,
        threshold: OffsetDateTime,
    ) -> Result<Vec<Participant>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .participants
            .values()
            .filter(|p| p.last_active_at < threshold)
            .cloned()
            .collect())
    }

    async fn rooms_inactive_since(&self, threshold: OffsetDateTime) -> Result<Vec<Room>, StoreError> {
        Ok(self
            .tables
            .read()
            .await
            .rooms
            .values()
            .filter(|r| r.last_active_at < threshold)
            .cloned()
            .collect())
    }
}
