use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use time::OffsetDateTime;

use crate::models::{Participant, Room};
use crate::store::{SessionStore, StoreError};

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<OffsetDateTime>,
}

impl ManualClock {
    pub fn new(start: OffsetDateTime) -> Self {
        Self { now: Mutex::new(start) }
    }

    pub fn set(&self, at: OffsetDateTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> OffsetDateTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Clone)]
pub struct LivenessTracker {
    store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    window: Duration,
}

impl LivenessTracker {
    pub fn new(store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>, window: Duration) -> Self {
        Self { store, clock, window }
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    /// Anything last active strictly before this instant is stale.
    pub fn threshold(&self) -> OffsetDateTime {
        self.now() - self.window
    }

    pub fn is_stale(&self, last_active_at: OffsetDateTime) -> bool {
        last_active_at < self.threshold()
    }

    pub fn is_room_stale(&self, room: &Room) -> bool {
        self.is_stale(room.last_active_at)
    }

    pub fn is_participant_stale(&self, participant: &Participant) -> bool {
        self.is_stale(participant.last_active_at)
    }

    /// Returns false if the room no longer exists.
    pub async fn touch_room(&self, room_id: &str) -> Result<bool, StoreError> {
        self.store.update_room_activity(room_id, self.now()).await
    }

    /// Returns false if the participant no longer exists.
    pub async fn touch_participant(&self, participant_id: &str) -> Result<bool, StoreError> {
        self.store
            .update_participant_activity(participant_id, self.now())
            .await
    }

    pub async fn stale_participants(
        &self,
        threshold: OffsetDateTime,
    ) -> Result<Vec<Participant>, StoreError> {
        self.store.participants_inactive_since(threshold).await
    }

    pub async fn stale_rooms(&self, threshold: OffsetDateTime) -> Result<Vec<Room>, StoreError> {
        self.store.rooms_inactive_since(threshold).await
    }
}
