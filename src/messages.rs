use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::liveness::Clock;
use crate::models::{Message, MessageDraft};

pub struct MessageLog {
    rooms: RwLock<HashMap<String, VecDeque<Message>>>,
    clock: Arc<dyn Clock>,
    capacity: usize,
}

impl MessageLog {
    pub fn new(clock: Arc<dyn Clock>, capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            clock,
            capacity,
        }
    }

    /// Stamp a draft with a fresh id and the current time, then append it.
    /// The clock is read under the write lock so a buffer never holds a
    /// message older than the one before it.
    pub async fn post(&self, room_id: &str, draft: MessageDraft) -> Message {
        let mut rooms = self.rooms.write().await;
        let message = Message {
            id: Uuid::now_v7().to_string(),
            room_id: room_id.to_owned(),
            participant_id: draft.participant_id,
            content: draft.content,
            username: draft.username,
            avatar: draft.avatar,
            timestamp: self.clock.now(),
            reply_to: draft.reply_to,
        };
        self.push(&mut rooms, room_id, message.clone());
        message
    }

    pub async fn append(&self, room_id: &str, message: Message) {
        let mut rooms = self.rooms.write().await;
        self.push(&mut rooms, room_id, message);
    }

    fn push(&self, rooms: &mut HashMap<String, VecDeque<Message>>, room_id: &str, message: Message) {
        let buffer = rooms.entry(room_id.to_owned()).or_default();
        buffer.push_back(message);

        if self.capacity > 0 && buffer.len() > self.capacity {
            let evicted = buffer.len() - self.capacity;
            buffer.drain(..evicted);
            debug!(room_id, evicted, "backfill buffer trimmed");
        }
    }

    /// Messages strictly after `after`, in append order. `None` means the
    /// whole buffer.
    pub async fn since(&self, room_id: &str, after: Option<OffsetDateTime>) -> Vec<Message> {
        let rooms = self.rooms.read().await;
        let Some(buffer) = rooms.get(room_id) else {
            return Vec::new();
        };

        match after {
            None => buffer.iter().cloned().collect(),
            Some(after) => buffer
                .iter()
                .filter(|m| m.timestamp > after)
                .cloned()
                .collect(),
        }
    }

    pub async fn clear(&self, room_id: &str) -> usize {
        let removed = self
            .rooms
            .write()
            .await
            .remove(room_id)
            .map(|buffer| buffer.len())
            .unwrap_or(0);

        if removed > 0 {
            debug!(room_id, removed, "backfill buffer dropped");
        }
        removed
    }

    pub async fn len(&self, room_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(VecDeque::len)
            .unwrap_or(0)
    }
}
