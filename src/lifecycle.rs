//! Store first, publish after. A failed publish is logged, never rolled back.

use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::appresult::{AppError, AppResult};
use crate::events::{presence_payload, room_payload, EventBus, EventKind, PresenceAction, RoomAction, Topic};
use crate::hub::Hub;
use crate::liveness::LivenessTracker;
use crate::messages::MessageLog;
use crate::models::{Message, MessageDraft, Participant, Room, RoomSummary};
use crate::store::{SessionStore, StoreError};

pub const DEFAULT_ROOM_NAME: &str = "Untitled Room";

const ROOM_ID_ATTEMPTS: usize = 3;

/// 4 random bytes, hex encoded.
fn generate_room_id() -> String {
    format!("{:08x}", rand::random::<u32>())
}

/// 256 bits, sized for an AES-256 key. Never used server side.
fn generate_key_handle() -> String {
    let mut key = [0u8; 32];
    rand::rng().fill(&mut key);
    STANDARD.encode(key)
}

#[derive(Debug, Clone, Serialize)]
pub struct JoinedRoom {
    pub participant_id: String,
    pub room: Room,
    pub participants: Vec<Participant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaveOutcome {
    Left { room_deleted: bool },
    /// Someone else (usually the sweeper) removed the participant first.
    AlreadyGone,
}

pub struct RoomLifecycle {
    store: Arc<dyn SessionStore>,
    liveness: LivenessTracker,
    bus: Arc<dyn EventBus>,
    messages: Arc<MessageLog>,
    hub: Arc<Hub>,
}

impl RoomLifecycle {
    pub fn new(
        store: Arc<dyn SessionStore>,
        liveness: LivenessTracker,
        bus: Arc<dyn EventBus>,
        messages: Arc<MessageLog>,
        hub: Arc<Hub>,
    ) -> Self {
        Self {
            store,
            liveness,
            bus,
            messages,
            hub,
        }
    }

    pub fn liveness(&self) -> &LivenessTracker {
        &self.liveness
    }

    pub fn messages(&self) -> &Arc<MessageLog> {
        &self.messages
    }

    async fn announce(&self, topic: Topic, kind: EventKind, payload: Value) {
        if let Err(e) = self.bus.publish(topic.clone(), kind, payload).await {
            warn!(%topic, ?kind, error = %e, "event publish failed, committed state unchanged");
        }
    }

    pub async fn create_room(&self, name: &str) -> AppResult<Room> {
        let name = match name.trim() {
            "" => DEFAULT_ROOM_NAME.to_owned(),
            name => name.to_owned(),
        };
        let now = self.liveness.now();

        for attempt in 1..=ROOM_ID_ATTEMPTS {
            let room = Room {
                id: generate_room_id(),
                name: name.clone(),
                created_at: now,
                last_active_at: now,
                key_handle: generate_key_handle(),
            };

            match self.store.create_room(&room).await {
                Ok(()) => {
                    info!(room_id = %room.id, name = %room.name, "room created");
                    self.announce(Topic::Lobby, EventKind::Room, room_payload(RoomAction::Created, &room))
                        .await;
                    return Ok(room);
                }
                Err(StoreError::Conflict(_)) => {
                    warn!(room_id = %room.id, attempt, "room id collision, regenerating");
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(AppError::Storage(StoreError::Conflict("room")))
    }

    pub async fn get_room(&self, room_id: &str) -> AppResult<(Room, Vec<Participant>)> {
        let room = self.store.get_room(room_id).await?;
        let participants = self.store.get_participants(room_id).await?;
        Ok((room, participants))
    }

    pub async fn list_rooms(&self) -> AppResult<Vec<RoomSummary>> {
        let rooms = self.store.list_rooms().await?;
        let mut summaries = Vec::with_capacity(rooms.len());
        for room in rooms {
            let count = self.store.count_participants(&room.id).await?;
            summaries.push(RoomSummary::new(room, count));
        }
        Ok(summaries)
    }

    /// Anyone holding the room id may join; there is no invite check.
    pub async fn join_room(&self, room_id: &str, username: &str, avatar: &str) -> AppResult<JoinedRoom> {
        let username = username.trim();
        if username.is_empty() {
            return Err(AppError::validation("username is required"));
        }

        let mut room = self.store.get_room(room_id).await?;

        let now = self.liveness.now();
        let participant = Participant {
            id: Uuid::now_v7().to_string(),
            room_id: room_id.to_owned(),
            username: username.to_owned(),
            avatar: avatar.to_owned(),
            joined_at: now,
            last_active_at: now,
        };
        self.store.add_participant(&participant).await?;

        match self.liveness.touch_room(room_id).await {
            Ok(true) => room.last_active_at = now,
            Ok(false) => debug!(room_id, "room vanished while joining"),
            Err(e) => warn!(room_id, error = %e, "failed to bump room activity on join"),
        }

        info!(room_id, participant_id = %participant.id, username, "participant joined");
        self.announce(
            Topic::room(room_id),
            EventKind::Participant,
            presence_payload(PresenceAction::Join, &participant),
        )
        .await;

        let participants = self.store.get_participants(room_id).await?;
        Ok(JoinedRoom {
            participant_id: participant.id,
            room,
            participants,
        })
    }

    /// Idempotent: leaving twice, or after the sweeper got there first,
    /// reports [`LeaveOutcome::AlreadyGone`] and emits nothing.
    pub async fn leave_room(&self, room_id: &str, participant_id: &str) -> AppResult<LeaveOutcome> {
        if participant_id.trim().is_empty() {
            return Err(AppError::validation("participant_id is required"));
        }

        // fetched up front: the leave event needs the display name
        let participant = match self.store.get_participant(participant_id).await {
            Ok(participant) => participant,
            Err(StoreError::NotFound(_)) => {
                debug!(room_id, participant_id, "leave for participant already gone");
                return Ok(LeaveOutcome::AlreadyGone);
            }
            Err(e) => return Err(e.into()),
        };

        if participant.room_id != room_id {
            return Err(AppError::NotFound("participant"));
        }

        if !self.retire_participant(&participant).await? {
            return Ok(LeaveOutcome::AlreadyGone);
        }

        let room_deleted = self.reap_if_empty(room_id).await?;
        Ok(LeaveOutcome::Left { room_deleted })
    }

    /// Silent: refreshes timestamps, publishes nothing. An unknown
    /// participant, or one from another room, still refreshes the room.
    pub async fn heartbeat(&self, room_id: &str, participant_id: Option<&str>) -> AppResult<()> {
        if !self.liveness.touch_room(room_id).await? {
            return Err(AppError::NotFound("room"));
        }

        let Some(participant_id) = participant_id.filter(|id| !id.is_empty()) else {
            return Ok(());
        };
        match self.store.get_participant(participant_id).await {
            Ok(participant) if participant.room_id == room_id => {
                if !self.liveness.touch_participant(participant_id).await? {
                    debug!(room_id, participant_id, "participant left during heartbeat");
                }
            }
            Ok(participant) => {
                debug!(
                    room_id,
                    participant_id,
                    member_of = %participant.room_id,
                    "heartbeat for participant of another room ignored"
                );
            }
            Err(StoreError::NotFound(_)) => {
                debug!(room_id, participant_id, "heartbeat from unknown participant");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    pub async fn send_message(&self, room_id: &str, draft: MessageDraft) -> AppResult<Message> {
        if draft.participant_id.is_empty() {
            return Err(AppError::validation("participant_id is required"));
        }
        if draft.content.is_empty() {
            return Err(AppError::validation("content is required"));
        }

        self.store.get_room(room_id).await?;

        let message = self.messages.post(room_id, draft).await;
        debug!(room_id, message_id = %message.id, participant_id = %message.participant_id, "message stored");

        match serde_json::to_value(&message) {
            Ok(payload) => {
                self.announce(Topic::room(room_id), EventKind::Message, payload)
                    .await
            }
            Err(e) => warn!(room_id, error = %e, "failed to encode message event"),
        }
        Ok(message)
    }

    pub async fn get_messages(&self, room_id: &str, after: Option<OffsetDateTime>) -> Vec<Message> {
        self.messages.since(room_id, after).await
    }

    /// Remove one participant and announce it. Returns false when another
    /// deleter won the race; in that case nothing is published.
    pub async fn retire_participant(&self, participant: &Participant) -> Result<bool, StoreError> {
        if !self.store.remove_participant(&participant.id).await? {
            debug!(participant_id = %participant.id, "participant already removed");
            return Ok(false);
        }

        info!(
            room_id = %participant.room_id,
            participant_id = %participant.id,
            username = %participant.username,
            "participant left"
        );
        self.announce(
            Topic::room(participant.room_id.as_str()),
            EventKind::Participant,
            presence_payload(PresenceAction::Leave, participant),
        )
        .await;
        Ok(true)
    }

    /// Delete the room if nobody is left in it.
    pub async fn reap_if_empty(&self, room_id: &str) -> Result<bool, StoreError> {
        let remaining = self.store.count_participants(room_id).await?;
        if remaining > 0 {
            return Ok(false);
        }
        self.delete_room(room_id).await
    }

    /// Delete a room, drop its backfill and live connections, announce it on
    /// the lobby. Returns false if it was already gone.
    pub async fn delete_room(&self, room_id: &str) -> Result<bool, StoreError> {
        let room = match self.store.get_room(room_id).await {
            Ok(room) => room,
            Err(StoreError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };

        if !self.store.delete_room(room_id).await? {
            debug!(room_id, "room already deleted");
            return Ok(false);
        }

        // connections go first so a relay in flight cannot refill the log
        let closed = self.hub.close_room(room_id).await;
        let dropped_messages = self.messages.clear(room_id).await;
        info!(room_id, dropped_messages, closed, "room deleted");

        self.announce(Topic::Lobby, EventKind::Room, room_payload(RoomAction::Deleted, &room))
            .await;
        Ok(true)
    }
}


#[cfg(test)]
mod tests {
    use std::time::Duration;

    use base64::Engine as _;

    use super::testing::Harness;
    use super::*;
    use crate::liveness::Clock;

    #[tokio::test]
    async fn create_room_persists_then_announces_on_lobby() {
        let h = Harness::new();
        let room = h.lifecycle.create_room("Standup").await.unwrap();

        assert_eq!(room.id.len(), 8);
        assert!(room.id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(STANDARD.decode(&room.key_handle).unwrap().len(), 32);

        let (fetched, participants) = h.lifecycle.get_room(&room.id).await.unwrap();
        assert_eq!(fetched.name, "Standup");
        assert!(participants.is_empty());

        let events = h.bus.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].topic, Topic::Lobby);
        assert_eq!(events[0].action(), "created");
        assert!(events[0].committed);
    }

    #[tokio::test]
    async fn blank_room_name_gets_default() {
        let h = Harness::new();
        let room = h.lifecycle.create_room("   ").await.unwrap();
        assert_eq!(room.name, DEFAULT_ROOM_NAME);
    }

    #[tokio::test]
    async fn join_unknown_room_is_not_found() {
        let h = Harness::new();
        let err = h.lifecycle.join_room("deadbeef", "Ann", "fox").await.unwrap_err();
        assert!(err.is_not_found());
        assert!(h.bus.events().is_empty());
    }

    #[tokio::test]
    async fn join_requires_username_before_touching_store() {
        let h = Harness::new();
        let room = h.lifecycle.create_room("Standup").await.unwrap();

        let err = h.lifecycle.join_room(&room.id, "  ", "fox").await.unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
        assert_eq!(h.store.count_participants(&room.id).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn joins_are_visible_and_announced_after_commit() {
        let h = Harness::new();
        let room = h.lifecycle.create_room("Standup").await.unwrap();

        let ann = h.lifecycle.join_room(&room.id, "Ann", "fox").await.unwrap();
        assert_eq!(ann.participants.len(), 1);
        assert_eq!(ann.participants[0].username, "Ann");

        h.clock.advance(Duration::from_secs(1));
        let ben = h.lifecycle.join_room(&room.id, "Ben", "owl").await.unwrap();
        let names: Vec<&str> = ben.participants.iter().map(|p| p.username.as_str()).collect();
        assert_eq!(names, ["Ann", "Ben"]);

        let joins: Vec<_> = h
            .bus
            .events()
            .into_iter()
            .filter(|e| e.kind == EventKind::Participant)
            .collect();
        assert_eq!(joins.len(), 2);
        assert!(joins.iter().all(|e| e.committed && e.action() == "join"));
        assert_eq!(joins[1].subject(), ben.participant_id);
        assert_eq!(joins[1].topic, Topic::room(room.id.as_str()));
    }

    #[tokio::test]
    async fn last_leave_deletes_room_before_returning() {
        let h = Harness::new();
        let room = h.lifecycle.create_room("Standup").await.unwrap();
        let ann = h.lifecycle.join_room(&room.id, "Ann", "fox").await.unwrap();
        let ben = h.lifecycle.join_room(&room.id, "Ben", "owl").await.unwrap();

        let outcome = h.lifecycle.leave_room(&room.id, &ann.participant_id).await.unwrap();
        assert_eq!(outcome, LeaveOutcome::Left { room_deleted: false });
        let (_, remaining) = h.lifecycle.get_room(&room.id).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].username, "Ben");

        let outcome = h.lifecycle.leave_room(&room.id, &ben.participant_id).await.unwrap();
        assert_eq!(outcome, LeaveOutcome::Left { room_deleted: true });
        assert!(h.lifecycle.get_room(&room.id).await.unwrap_err().is_not_found());

        let tail: Vec<(String, String)> = h.bus.actions().into_iter().skip(3).collect();
        assert_eq!(
            tail,
            [
                ("leave".to_owned(), ann.participant_id.clone()),
                ("leave".to_owned(), ben.participant_id.clone()),
                ("deleted".to_owned(), room.id.clone()),
            ]
        );
        assert!(h.bus.events().iter().all(|e| e.committed));
    }

    #[tokio::test]
    async fn leaving_twice_is_idempotent() {
        let h = Harness::new();
        let room = h.lifecycle.create_room("Standup").await.unwrap();
        let ann = h.lifecycle.join_room(&room.id, "Ann", "fox").await.unwrap();
        h.lifecycle.join_room(&room.id, "Ben", "owl").await.unwrap();

        h.lifecycle.leave_room(&room.id, &ann.participant_id).await.unwrap();
        let before = h.bus.events().len();

        let second = h.lifecycle.leave_room(&room.id, &ann.participant_id).await.unwrap();
        assert_eq!(second, LeaveOutcome::AlreadyGone);
        assert_eq!(h.bus.events().len(), before);
    }

    #[tokio::test]
    async fn racing_retirements_publish_once() {
        let h = Harness::new();
        let room = h.lifecycle.create_room("Standup").await.unwrap();
        let ann = h.lifecycle.join_room(&room.id, "Ann", "fox").await.unwrap();
        let participant = ann.participants[0].clone();

        let (a, b) = tokio::join!(
            h.lifecycle.retire_participant(&participant),
            h.lifecycle.retire_participant(&participant)
        );
        assert!(a.unwrap() ^ b.unwrap());

        let leaves = h.bus.actions().into_iter().filter(|(a, _)| a == "leave").count();
        assert_eq!(leaves, 1);
    }

    #[tokio::test]
    async fn leave_with_participant_from_other_room_is_rejected() {
        let h = Harness::new();
        let r1 = h.lifecycle.create_room("one").await.unwrap();
        let r2 = h.lifecycle.create_room("two").await.unwrap();
        let ann = h.lifecycle.join_room(&r1.id, "Ann", "fox").await.unwrap();

        let err = h.lifecycle.leave_room(&r2.id, &ann.participant_id).await.unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(h.store.count_participants(&r1.id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn heartbeat_refreshes_room_and_participant_silently() {
        let h = Harness::new();
        let room = h.lifecycle.create_room("Standup").await.unwrap();
        let ann = h.lifecycle.join_room(&room.id, "Ann", "fox").await.unwrap();
        let events_before = h.bus.events().len();

        h.clock.advance(Duration::from_secs(240));
        h.lifecycle.heartbeat(&room.id, Some(ann.participant_id.as_str())).await.unwrap();
        h.lifecycle.heartbeat(&room.id, Some("ghost")).await.unwrap();
        h.lifecycle.heartbeat(&room.id, None).await.unwrap();

        let now = h.clock.now();
        assert_eq!(h.store.get_participant(&ann.participant_id).await.unwrap().last_active_at, now);
        assert_eq!(h.store.get_room(&room.id).await.unwrap().last_active_at, now);
        assert_eq!(h.bus.events().len(), events_before);

        let err = h.lifecycle.heartbeat("deadbeef", None).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn heartbeat_ignores_participant_of_another_room() {
        let h = Harness::new();
        let r1 = h.lifecycle.create_room("one").await.unwrap();
        let r2 = h.lifecycle.create_room("two").await.unwrap();
        let ann = h.lifecycle.join_room(&r1.id, "Ann", "fox").await.unwrap();
        let joined_at = h.store.get_participant(&ann.participant_id).await.unwrap().last_active_at;

        h.clock.advance(Duration::from_secs(240));
        h.lifecycle.heartbeat(&r2.id, Some(ann.participant_id.as_str())).await.unwrap();

        assert_eq!(h.store.get_room(&r2.id).await.unwrap().last_active_at, h.clock.now());
        assert_eq!(
            h.store.get_participant(&ann.participant_id).await.unwrap().last_active_at,
            joined_at
        );
    }

    #[tokio::test]
    async fn publish_failure_does_not_undo_mutations() {
        let h = Harness::with_failing_bus();
        let room = h.lifecycle.create_room("Standup").await.unwrap();
        let ann = h.lifecycle.join_room(&room.id, "Ann", "fox").await.unwrap();
        assert_eq!(h.store.count_participants(&room.id).await.unwrap(), 1);

        let outcome = h.lifecycle.leave_room(&room.id, &ann.participant_id).await.unwrap();
        assert_eq!(outcome, LeaveOutcome::Left { room_deleted: true });
        assert!(h.store.get_room(&room.id).await.is_err());
        assert_eq!(h.bus.events().len(), 4);
    }

    #[tokio::test]
    async fn messages_are_logged_and_cleared_with_room() {
        let h = Harness::new();
        let room = h.lifecycle.create_room("Standup").await.unwrap();
        let ann = h.lifecycle.join_room(&room.id, "Ann", "fox").await.unwrap();

        let first = h
            .lifecycle
            .send_message(
                &room.id,
                MessageDraft {
                    participant_id: ann.participant_id.clone(),
                    content: "c1".into(),
                    ..MessageDraft::default()
                },
            )
            .await
            .unwrap();
        h.clock.advance(Duration::from_secs(1));
        let second = h
            .lifecycle
            .send_message(
                &room.id,
                MessageDraft {
                    participant_id: ann.participant_id.clone(),
                    content: "c2".into(),
                    ..MessageDraft::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(h.lifecycle.get_messages(&room.id, Some(first.timestamp)).await, vec![second.clone()]);
        assert_eq!(h.lifecycle.get_messages(&room.id, None).await, vec![first, second]);
        assert!(h.bus.events().iter().any(|e| e.kind == EventKind::Message));

        h.lifecycle.leave_room(&room.id, &ann.participant_id).await.unwrap();
        assert!(h.lifecycle.get_messages(&room.id, None).await.is_empty());
    }

    #[tokio::test]
    async fn send_message_validates_before_storing() {
        let h = Harness::new();
        let room = h.lifecycle.create_room("Standup").await.unwrap();

        let empty = MessageDraft {
            participant_id: "p1".into(),
            ..MessageDraft::default()
        };
        assert!(matches!(
            h.lifecycle.send_message(&room.id, empty).await,
            Err(AppError::Validation(_))
        ));

        let orphan = MessageDraft {
            participant_id: "p1".into(),
            content: "x".into(),
            ..MessageDraft::default()
        };
        assert!(h.lifecycle.send_message("deadbeef", orphan).await.unwrap_err().is_not_found());
        assert_eq!(h.messages.len(&room.id).await, 0);
    }

    #[tokio::test]
    async fn deleting_room_closes_live_connections() {
        let h = Harness::new();
        let room = h.lifecycle.create_room("Standup").await.unwrap();
        let ann = h.lifecycle.join_room(&room.id, "Ann", "fox").await.unwrap();
        let (conn, _rx) = h.hub.connect(&room.id, &ann.participant_id).await;

        h.lifecycle.leave_room(&room.id, &ann.participant_id).await.unwrap();
        assert!(conn.is_closed());
        assert_eq!(h.hub.connection_count(&room.id).await, 0);
    }

    #[tokio::test]
    async fn chat_relayed_after_room_deleted_is_not_stored() {
        let h = Harness::new();
        let room = h.lifecycle.create_room("Standup").await.unwrap();
        let ann = h.lifecycle.join_room(&room.id, "Ann", "fox").await.unwrap();
        let (conn, _rx) = h.hub.connect(&room.id, &ann.participant_id).await;

        h.lifecycle.leave_room(&room.id, &ann.participant_id).await.unwrap();

        let chat = r#"{"type":"message","payload":{"participant_id":"","content":"too late"}}"#;
        assert_eq!(h.hub.relay(&conn, chat).await, 0);
        assert_eq!(h.messages.len(&room.id).await, 0);
    }

    #[tokio::test]
    async fn list_rooms_reports_counts_without_keys() {
        let h = Harness::new();
        let room = h.lifecycle.create_room("Standup").await.unwrap();
        h.lifecycle.join_room(&room.id, "Ann", "fox").await.unwrap();

        let summaries = h.lifecycle.list_rooms().await.unwrap();
        assert_eq!(summaries.len(), 1);
        assert_eq!(summaries[0].participant_count, 1);

        let json = serde_json::to_value(&summaries[0]).unwrap();
        assert!(json.get("key_handle").is_none());
    }
}
