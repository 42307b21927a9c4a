use async_trait::async_trait;
use sqlx::SqlitePool;
use time::OffsetDateTime;

use super::{SessionStore, StoreError};
use crate::models::{Participant, Room};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS rooms (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    created_at INTEGER NOT NULL,
    last_active_at INTEGER NOT NULL,
    key_handle TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS participants (
    id TEXT PRIMARY KEY,
    room_id TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
    username TEXT NOT NULL,
    avatar TEXT NOT NULL,
    joined_at INTEGER NOT NULL,
    last_active_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS participants_room_id ON participants(room_id);
CREATE INDEX IF NOT EXISTS participants_last_active_at ON participants(last_active_at);
CREATE INDEX IF NOT EXISTS rooms_last_active_at ON rooms(last_active_at);
"#;

const ROOM_COLUMNS: &str = "id,name,created_at,last_active_at,key_handle";
const PARTICIPANT_COLUMNS: &str = "id,room_id,username,avatar,joined_at,last_active_at";

type RoomRow = (String, String, i64, i64, String);
type ParticipantRow = (String, String, String, String, i64, i64);

/// Session Store backed by SQLite. Timestamps are unix milliseconds so that
/// range comparisons stay numeric.
#[derive(Clone)]
pub struct SqliteStore {
    db_pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.db_pool).await?;
        Ok(())
    }
}

fn to_millis(at: OffsetDateTime) -> i64 {
    (at.unix_timestamp_nanos() / 1_000_000) as i64
}

fn from_millis(millis: i64) -> Result<OffsetDateTime, StoreError> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(millis) * 1_000_000)
        .map_err(|e| StoreError::Decode(format!("timestamp {millis}: {e}")))
}

fn room_from_row((id, name, created_at, last_active_at, key_handle): RoomRow) -> Result<Room, StoreError> {
    Ok(Room {
        id,
        name,
        created_at: from_millis(created_at)?,
        last_active_at: from_millis(last_active_at)?,
        key_handle,
    })
}

fn participant_from_row(
    (id, room_id, username, avatar, joined_at, last_active_at): ParticipantRow,
) -> Result<Participant, StoreError> {
    Ok(Participant {
        id,
        room_id,
        username,
        avatar,
        joined_at: from_millis(joined_at)?,
        last_active_at: from_millis(last_active_at)?,
    })
}

fn conflict_or(err: sqlx::Error, kind: &'static str) -> StoreError {
    match &err {
        sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::Conflict(kind),
        sqlx::Error::Database(db) if db.is_foreign_key_violation() => StoreError::NotFound("room"),
        _ => StoreError::Database(err),
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_room(&self, room: &Room) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO rooms (id,name,created_at,last_active_at,key_handle) VALUES (?,?,?,?,?)")
            .bind(&room.id)
            .bind(&room.name)
            .bind(to_millis(room.created_at))
            .bind(to_millis(room.last_active_at))
            .bind(&room.key_handle)
            .execute(&self.db_pool)
            .await
            .map_err(|e| conflict_or(e, "room"))?;
        Ok(())
    }

    async fn get_room(&self, id: &str) -> Result<Room, StoreError> {
        let row: Option<RoomRow> =
            sqlx::query_as(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE id=?"))
                .bind(id)
                .fetch_optional(&self.db_pool)
                .await?;

        room_from_row(row.ok_or(StoreError::NotFound("room"))?)
    }

    async fn list_rooms(&self) -> Result<Vec<Room>, StoreError> {
        let rows: Vec<RoomRow> =
            sqlx::query_as(&format!("SELECT {ROOM_COLUMNS} FROM rooms ORDER BY created_at DESC"))
                .fetch_all(&self.db_pool)
                .await?;

        rows.into_iter().map(room_from_row).collect()
    }

    async fn update_room_activity(&self, id: &str, now: OffsetDateTime) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE rooms SET last_active_at=? WHERE id=?")
            .bind(to_millis(now))
            .bind(id)
            .execute(&self.db_pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_room(&self, id: &str) -> Result<bool, StoreError> {
        let mut tx = self.db_pool.begin().await?;
        sqlx::query("DELETE FROM participants WHERE room_id=?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM rooms WHERE id=?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn add_participant(&self, participant: &Participant) -> Result<(), StoreError> {
        sqlx::query("INSERT INTO participants (id,room_id,username,avatar,joined_at,last_active_at) VALUES (?,?,?,?,?,?)")
            .bind(&participant.id)
            .bind(&participant.room_id)
            .bind(&participant.username)
            .bind(&participant.avatar)
            .bind(to_millis(participant.joined_at))
            .bind(to_millis(participant.last_active_at))
            .execute(&self.db_pool)
            .await
            .map_err(|e| conflict_or(e, "participant"))?;
        Ok(())
    }

    async fn get_participant(&self, id: &str) -> Result<Participant, StoreError> {
        let row: Option<ParticipantRow> =
            sqlx::query_as(&format!("SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE id=?"))
                .bind(id)
                .fetch_optional(&self.db_pool)
                .await?;

        participant_from_row(row.ok_or(StoreError::NotFound("participant"))?)
    }

    async fn get_participants(&self, room_id: &str) -> Result<Vec<Participant>, StoreError> {
        let rows: Vec<ParticipantRow> = sqlx::query_as(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE room_id=? ORDER BY joined_at, id"
        ))
        .bind(room_id)
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter().map(participant_from_row).collect()
    }

    async fn count_participants(&self, room_id: &str) -> Result<usize, StoreError> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM participants WHERE room_id=?")
            .bind(room_id)
            .fetch_one(&self.db_pool)
            .await?;
        Ok(count.max(0) as usize)
    }

    async fn update_participant_activity(
        &self,
        id: &str,
        now: OffsetDateTime,
    ) -> Result<bool, StoreError> {
        let result = sqlx::query("UPDATE participants SET last_active_at=? WHERE id=?")
            .bind(to_millis(now))
            .bind(id)
            .execute(&self.db_pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn remove_participant(&self, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM participants WHERE id=?")
            .bind(id)
            .execute(&self.db_pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    async fn participants_inactive_since(
        &self,
        threshold: OffsetDateTime,
    ) -> Result<Vec<Participant>, StoreError> {
        let rows: Vec<ParticipantRow> = sqlx::query_as(&format!(
            "SELECT {PARTICIPANT_COLUMNS} FROM participants WHERE last_active_at<?"
        ))
        .bind(to_millis(threshold))
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter().map(participant_from_row).collect()
    }

    async fn rooms_inactive_since(&self, threshold: OffsetDateTime) -> Result<Vec<Room>, StoreError> {
        let rows: Vec<RoomRow> =
            sqlx::query_as(&format!("SELECT {ROOM_COLUMNS} FROM rooms WHERE last_active_at<?"))
                .bind(to_millis(threshold))
                .fetch_all(&self.db_pool)
                .await?;

        rows.into_iter().map(room_from_row).collect()
    }
}
