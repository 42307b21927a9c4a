//! Live connections per room. Broadcast snapshots its targets under the read
//! lock and sends after releasing it; a full queue drops the connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, info, warn};

use crate::messages::MessageLog;
use crate::models::MessageDraft;

/// Payloads are shared between all recipients of one broadcast.
pub type Outbound = Arc<str>;

/// Frame kind the hub copies into the backfill log.
pub const CHAT_MESSAGE_KIND: &str = "message";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("outbound queue full")]
    Backpressure,
    #[error("connection closed")]
    Closed,
}

/// A live socket bound to one participant in one room. The hub only holds
/// the sending half of its outbound queue; the transport owns the receiver.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnectionId,
    pub room_id: String,
    pub participant_id: String,
    tx: Mutex<Option<mpsc::Sender<Outbound>>>,
}

impl Connection {
    pub fn new(
        id: ConnectionId,
        room_id: impl Into<String>,
        participant_id: impl Into<String>,
        capacity: usize,
    ) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let conn = Self {
            id,
            room_id: room_id.into(),
            participant_id: participant_id.into(),
            tx: Mutex::new(Some(tx)),
        };
        (conn, rx)
    }

    pub fn try_send(&self, payload: Outbound) -> Result<(), DeliveryError> {
        let guard = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(tx) = guard.as_ref() else {
            return Err(DeliveryError::Closed);
        };

        tx.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Backpressure,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Drops the sending half so the transport's writer sees end-of-stream.
    /// Only the first call does anything; returns whether it was this one.
    pub fn close(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub fn is_closed(&self) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }
}

#[derive(Deserialize)]
struct ClientFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    payload: serde_json::Value,
}

type RoomSet = HashMap<ConnectionId, Arc<Connection>>;

pub struct Hub {
    rooms: RwLock<HashMap<String, RoomSet>>,
    next_id: AtomicU64,
    queue_capacity: usize,
    backfill: Option<Arc<MessageLog>>,
}

impl Hub {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity,
            backfill: None,
        }
    }

    /// Chat frames relayed through the hub are also appended to `log`.
    pub fn with_backfill(mut self, log: Arc<MessageLog>) -> Self {
        self.backfill = Some(log);
        self
    }

    /// Create a connection for `participant_id` and register it in `room_id`.
    pub async fn connect(
        &self,
        room_id: &str,
        participant_id: &str,
    ) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (conn, rx) = Connection::new(id, room_id, participant_id, self.queue_capacity);
        let conn = Arc::new(conn);
        self.register(conn.clone()).await;
        (conn, rx)
    }

    /// Add `conn` to its room's set. A different connection already filed
    /// under the same id is replaced and closed.
    pub async fn register(&self, conn: Arc<Connection>) {
        let (replaced, total) = {
            let mut rooms = self.rooms.write().await;
            let set = rooms.entry(conn.room_id.clone()).or_default();
            let replaced = set
                .insert(conn.id, conn.clone())
                .filter(|previous| !Arc::ptr_eq(previous, &conn));
            (replaced, set.len())
        };

        if let Some(previous) = replaced {
            previous.close();
            warn!(conn_id = %previous.id, room_id = %previous.room_id, "replaced connection with duplicate id");
        }

        info!(
            conn_id = %conn.id,
            room_id = %conn.room_id,
            participant_id = %conn.participant_id,
            total,
            "connection registered"
        );
    }

    /// Remove `conn` from its room and close its queue. Safe to call any
    /// number of times, from any task; returns whether this call removed it.
    pub async fn unregister(&self, conn: &Connection) -> bool {
        let removed = {
            let mut rooms = self.rooms.write().await;
            let mut removed = false;
            if let Some(set) = rooms.get_mut(&conn.room_id) {
                if set
                    .get(&conn.id)
                    .is_some_and(|registered| std::ptr::eq(Arc::as_ptr(registered), conn))
                {
                    set.remove(&conn.id);
                    removed = true;
                }
                if set.is_empty() {
                    rooms.remove(&conn.room_id);
                    debug!(room_id = %conn.room_id, "room has no live connections, dropped from hub");
                }
            }
            removed
        };

        conn.close();

        if removed {
            info!(conn_id = %conn.id, room_id = %conn.room_id, "connection unregistered");
        }
        removed
    }

    /// Deliver `payload` to every connection in `room_id` except `exclude`.
    /// Connections whose queue is full or already closed are unregistered.
    /// Returns the number of connections that accepted the payload.
    pub async fn broadcast(
        &self,
        room_id: &str,
        payload: Outbound,
        exclude: Option<ConnectionId>,
    ) -> usize {
        let targets: Vec<Arc<Connection>> = {
            let rooms = self.rooms.read().await;
            match rooms.get(room_id) {
                Some(set) => set
                    .values()
                    .filter(|c| Some(c.id) != exclude)
                    .cloned()
                    .collect(),
                None => return 0,
            }
        };

        let mut delivered = 0;
        let mut dropped = Vec::new();
        for conn in targets {
            match conn.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::Backpressure) => {
                    warn!(conn_id = %conn.id, room_id, "outbound queue full, dropping slow connection");
                    dropped.push(conn);
                }
                Err(DeliveryError::Closed) => dropped.push(conn),
            }
        }

        for conn in &dropped {
            self.unregister(conn).await;
        }

        debug!(room_id, delivered, dropped = dropped.len(), "broadcast sent");
        delivered
    }

    /// Fan out a frame received from `from` to the rest of its room. Chat
    /// frames are copied into the backfill log first; every other kind, and
    /// anything that does not parse, passes through untouched. A connection
    /// that is no longer registered relays nothing.
    pub async fn relay(&self, from: &Connection, raw: &str) -> usize {
        {
            // held across the append so close_room cannot slip in between
            let rooms = self.rooms.read().await;
            let registered = rooms
                .get(&from.room_id)
                .and_then(|set| set.get(&from.id))
                .is_some_and(|conn| std::ptr::eq(Arc::as_ptr(conn), from));
            if !registered {
                debug!(conn_id = %from.id, room_id = %from.room_id, "frame from unregistered connection dropped");
                return 0;
            }

            if let Some(log) = &self.backfill {
                Self::store_chat(log, from, raw).await;
            }
        }

        self.broadcast(&from.room_id, Arc::from(raw), Some(from.id)).await
    }

    async fn store_chat(log: &MessageLog, from: &Connection, raw: &str) {
        let frame = match serde_json::from_str::<ClientFrame>(raw) {
            Ok(frame) if frame.kind == CHAT_MESSAGE_KIND => frame,
            Ok(_) => return,
            Err(e) => {
                debug!(conn_id = %from.id, error = %e, "relaying unparsed frame");
                return;
            }
        };

        match serde_json::from_value::<MessageDraft>(frame.payload) {
            Ok(mut draft) => {
                if draft.participant_id.is_empty() {
                    draft.participant_id = from.participant_id.clone();
                }
                let stored = log.post(&from.room_id, draft).await;
                debug!(room_id = %from.room_id, message_id = %stored.id, "chat message stored for backfill");
            }
            Err(e) => {
                debug!(conn_id = %from.id, error = %e, "chat frame payload not storable");
            }
        }
    }

    /// Drop the hub's bookkeeping for a room and close every connection in it.
    pub async fn close_room(&self, room_id: &str) -> usize {
        let set = self.rooms.write().await.remove(room_id);
        let Some(set) = set else {
            return 0;
        };

        for conn in set.values() {
            conn.close();
        }
        info!(room_id, closed = set.len(), "closed live connections of room");
        set.len()
    }

    pub async fn connection_count(&self, room_id: &str) -> usize {
        self.rooms
            .read()
            .await
            .get(room_id)
            .map(HashMap::len)
            .unwrap_or(0)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn total_connections(&self) -> usize {
        self.rooms.read().await.values().map(HashMap::len).sum()
    }
}

impl fmt::Debug for Hub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hub")
            .field("queue_capacity", &self.queue_capacity)
            .field("backfill", &self.backfill.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use time::macros::datetime;

    use super::*;
    use crate::liveness::ManualClock;

    fn payload(s: &str) -> Outbound {
        Arc::from(s)
    }

    #[tokio::test]
    async fn register_and_unregister_track_room_sets() {
        let hub = Hub::new(8);
        let (a, _rx_a) = hub.connect("r1", "ann").await;
        let (b, _rx_b) = hub.connect("r1", "ben").await;
        assert_eq!(hub.connection_count("r1").await, 2);
        assert_eq!(hub.room_count().await, 1);

        assert!(hub.unregister(&a).await);
        assert_eq!(hub.connection_count("r1").await, 1);

        assert!(hub.unregister(&b).await);
        assert_eq!(hub.connection_count("r1").await, 0);
        assert_eq!(hub.room_count().await, 0);
    }

    #[tokio::test]
    async fn unregister_is_idempotent_and_closes_once() {
        let hub = Hub::new(8);
        let (conn, mut rx) = hub.connect("r1", "ann").await;

        assert!(hub.unregister(&conn).await);
        assert!(!hub.unregister(&conn).await);
        assert!(conn.is_closed());
        assert!(!conn.close());
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn broadcast_skips_excluded_sender() {
        let hub = Hub::new(8);
        let (ann, mut rx_ann) = hub.connect("r1", "ann").await;
        let (_ben, mut rx_ben) = hub.connect("r1", "ben").await;
        let (_other, mut rx_other) = hub.connect("r2", "cat").await;

        let delivered = hub.broadcast("r1", payload("hello"), Some(ann.id)).await;
        assert_eq!(delivered, 1);
        assert_eq!(rx_ben.try_recv().unwrap().as_ref(), "hello");
        assert!(rx_ann.try_recv().is_err());
        assert!(rx_other.try_recv().is_err());
    }

    #[tokio::test]
    async fn broadcast_to_unknown_room_is_noop() {
        let hub = Hub::new(8);
        assert_eq!(hub.broadcast("ghost", payload("x"), None).await, 0);
    }

    #[tokio::test]
    async fn saturated_connection_is_dropped_without_blocking_others() {
        let hub = Hub::new(1);
        let (slow, mut rx_slow) = hub.connect("r1", "slow").await;
        let mut others = Vec::new();
        for name in ["a", "b", "c"] {
            others.push(hub.connect("r1", name).await);
        }

        slow.try_send(payload("filler")).unwrap();
        assert_eq!(slow.try_send(payload("more")), Err(DeliveryError::Backpressure));

        let delivered = hub.broadcast("r1", payload("news"), None).await;
        assert_eq!(delivered, 3);
        assert_eq!(hub.connection_count("r1").await, 3);
        assert!(slow.is_closed());

        for (_, rx) in others.iter_mut() {
            assert_eq!(rx.try_recv().unwrap().as_ref(), "news");
        }
        assert_eq!(rx_slow.recv().await.as_deref(), Some("filler"));
        assert_eq!(rx_slow.recv().await, None);
    }

    #[tokio::test]
    async fn connection_with_gone_reader_is_pruned() {
        let hub = Hub::new(4);
        let (_conn, rx) = hub.connect("r1", "ann").await;
        drop(rx);

        assert_eq!(hub.broadcast("r1", payload("x"), None).await, 0);
        assert_eq!(hub.room_count().await, 0);
    }

    #[tokio::test]
    async fn duplicate_id_replaces_previous_connection() {
        let hub = Hub::new(4);
        let (first, _rx1) = Connection::new(ConnectionId(7), "r1", "ann", 4);
        let (second, mut rx2) = Connection::new(ConnectionId(7), "r1", "ann", 4);
        let first = Arc::new(first);
        let second = Arc::new(second);

        hub.register(first.clone()).await;
        hub.register(second.clone()).await;
        assert!(first.is_closed());
        assert_eq!(hub.connection_count("r1").await, 1);

        // the stale handle must not evict its replacement
        assert!(!hub.unregister(&first).await);
        assert_eq!(hub.connection_count("r1").await, 1);

        hub.broadcast("r1", payload("hi"), None).await;
        assert_eq!(rx2.try_recv().unwrap().as_ref(), "hi");
    }

    #[tokio::test]
    async fn concurrent_unregister_and_broadcast() {
        let hub = Arc::new(Hub::new(64));
        let mut conns = Vec::new();
        for i in 0..32 {
            conns.push(hub.connect("r1", &format!("p{i}")).await);
        }

        let mut tasks = Vec::new();
        for (conn, _) in &conns {
            let hub = hub.clone();
            let conn = conn.clone();
            tasks.push(tokio::spawn(async move { hub.unregister(&conn).await }));
        }
        for _ in 0..8 {
            let hub = hub.clone();
            tasks.push(tokio::spawn(async move {
                hub.broadcast("r1", Arc::from("tick"), None).await;
                true
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(hub.connection_count("r1").await, 0);
        assert_eq!(hub.room_count().await, 0);
        assert!(conns.iter().all(|(c, _)| c.is_closed()));
    }

    #[tokio::test]
    async fn relay_stores_chat_frames_only() {
        let clock = Arc::new(ManualClock::new(datetime!(2026-01-01 12:00 UTC)));
        let log = Arc::new(MessageLog::new(clock, 0));
        let hub = Hub::new(8).with_backfill(log.clone());
        let (ann, _rx_ann) = hub.connect("r1", "ann").await;
        let (_ben, mut rx_ben) = hub.connect("r1", "ben").await;

        let chat = r#"{"type":"message","payload":{"participant_id":"ann","content":"ciphertext","username":"Ann"}}"#;
        let typing = r#"{"type":"typing","payload":{"participant_id":"ann"}}"#;
        assert_eq!(hub.relay(&ann, chat).await, 1);
        assert_eq!(hub.relay(&ann, typing).await, 1);
        assert_eq!(hub.relay(&ann, "not json").await, 1);

        assert_eq!(rx_ben.try_recv().unwrap().as_ref(), chat);
        assert_eq!(rx_ben.try_recv().unwrap().as_ref(), typing);
        assert_eq!(rx_ben.try_recv().unwrap().as_ref(), "not json");

        let stored = log.since("r1", None).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "ciphertext");
        assert_eq!(stored[0].participant_id, "ann");
    }

    #[tokio::test]
    async fn relay_from_dropped_connection_stores_nothing() {
        let clock = Arc::new(ManualClock::new(datetime!(2026-01-01 12:00 UTC)));
        let log = Arc::new(MessageLog::new(clock, 0));
        let hub = Hub::new(8).with_backfill(log.clone());
        let (ann, _rx_ann) = hub.connect("r1", "ann").await;
        let (ben, _rx_ben) = hub.connect("r1", "ben").await;
        let (_cat, mut rx_cat) = hub.connect("r1", "cat").await;

        let chat = r#"{"type":"message","payload":{"participant_id":"","content":"ciphertext"}}"#;
        hub.unregister(&ann).await;
        assert_eq!(hub.relay(&ann, chat).await, 0);
        assert!(rx_cat.try_recv().is_err());

        hub.close_room("r1").await;
        assert_eq!(hub.relay(&ben, chat).await, 0);
        assert_eq!(log.len("r1").await, 0);
    }

    #[tokio::test]
    async fn close_room_closes_every_connection() {
        let hub = Hub::new(8);
        let (a, mut rx_a) = hub.connect("r1", "ann").await;
        let (b, _rx_b) = hub.connect("r1", "ben").await;

        assert_eq!(hub.close_room("r1").await, 2);
        assert!(a.is_closed() && b.is_closed());
        assert_eq!(rx_a.recv().await, None);
        assert!(!hub.unregister(&a).await);
        assert_eq!(hub.close_room("r1").await, 0);
    }
}
