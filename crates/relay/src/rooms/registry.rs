// Room membership registry.
//
// Maps a room (thread id) to the connections currently subscribed to it.
// The registry never owns a connection: it stores an id plus a weak handle
// to the connection's outbound queue. Only the connection task can close
// its socket.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
    },
    time::Duration,
};

use axum::extract::ws::Utf8Bytes;
use globechat_common::types::RoomId;
use tokio::sync::mpsc::{
    self,
    error::{SendTimeoutError, TrySendError},
};

/// A serialized server frame. Cloning shares the underlying bytes.
pub type OutboundFrame = Utf8Bytes;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of one accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Why a frame could not be handed to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    #[error("connection is gone")]
    Gone,
    #[error("outbound queue stayed full for {0:?}")]
    TimedOut(Duration),
}

/// Observing reference to a live connection's outbound queue.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbound: mpsc::WeakSender<OutboundFrame>,
}

impl ConnectionHandle {
    /// Wraps a queue owned by the connection task. The handle does not keep
    /// the queue open.
    pub fn new(id: ConnectionId, outbound: &mpsc::Sender<OutboundFrame>) -> Self {
        Self { id, outbound: outbound.downgrade() }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Enqueues without waiting. A full queue hands the frame back.
    pub(crate) fn try_deliver(&self, frame: OutboundFrame) -> Result<(), TryDeliverError> {
        let Some(sender) = self.outbound.upgrade() else {
            return Err(TryDeliverError::Gone);
        };

        sender.try_send(frame).map_err(|error| match error {
            TrySendError::Full(frame) => TryDeliverError::Full(frame),
            TrySendError::Closed(_) => TryDeliverError::Gone,
        })
    }

    /// Enqueues, waiting at most `timeout` for queue space.
    pub(crate) async fn deliver(
        &self,
        frame: OutboundFrame,
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        let Some(sender) = self.outbound.upgrade() else {
            return Err(DeliveryError::Gone);
        };

        sender.send_timeout(frame, timeout).await.map_err(|error| match error {
            SendTimeoutError::Timeout(_) => DeliveryError::TimedOut(timeout),
            SendTimeoutError::Closed(_) => DeliveryError::Gone,
        })
    }
}

pub(crate) enum TryDeliverError {
    Full(OutboundFrame),
    Gone,
}

type Rooms = HashMap<RoomId, HashMap<ConnectionId, ConnectionHandle>>;

/// Room id -> subscribed connections. No entry ever maps to an empty set.
#[derive(Debug, Default)]
pub struct RoomRegistry {
    rooms: RwLock<Rooms>,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes `handle` to `room_id`. Returns false if it was already a member.
    pub fn join(&self, handle: &ConnectionHandle, room_id: RoomId) -> bool {
        let mut rooms = self.write();
        let members = rooms.entry(room_id).or_default();
        if members.contains_key(&handle.id) {
            return false;
        }
        members.insert(handle.id, handle.clone());
        true
    }

    /// Unsubscribes a connection from one room. Returns false if it was not a member.
    pub fn leave(&self, connection_id: ConnectionId, room_id: RoomId) -> bool {
        let mut rooms = self.write();
        let Some(members) = rooms.get_mut(&room_id) else {
            return false;
        };

        let removed = members.remove(&connection_id).is_some();
        if members.is_empty() {
            rooms.remove(&room_id);
        }
        removed
    }

    /// Removes a connection from every room. Returns the rooms it left, sorted.
    pub fn leave_all(&self, connection_id: ConnectionId) -> Vec<RoomId> {
        let mut rooms = self.write();
        let mut left = Vec::new();
        rooms.retain(|room_id, members| {
            if members.remove(&connection_id).is_some() {
                left.push(*room_id);
            }
            !members.is_empty()
        });
        left.sort_unstable();
        left
    }

    /// Point-in-time copy of a room's members; empty when the room does not exist.
    pub fn snapshot(&self, room_id: RoomId) -> Vec<ConnectionHandle> {
        self.read()
            .get(&room_id)
            .map(|members| members.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn contains(&self, room_id: RoomId, connection_id: ConnectionId) -> bool {
        self.read().get(&room_id).is_some_and(|members| members.contains_key(&connection_id))
    }

    pub fn member_count(&self, room_id: RoomId) -> usize {
        self.read().get(&room_id).map_or(0, HashMap::len)
    }

    pub fn room_count(&self) -> usize {
        self.read().len()
    }

    pub fn rooms_for(&self, connection_id: ConnectionId) -> Vec<RoomId> {
        let mut rooms = self
            .read()
            .iter()
            .filter(|(_, members)| members.contains_key(&connection_id))
            .map(|(room_id, _)| *room_id)
            .collect::<Vec<_>>();
        rooms.sort_unstable();
        rooms
    }

    // Each mutation leaves the map consistent before it can panic, so a
    // poisoned lock still guards valid data.
    fn read(&self) -> RwLockReadGuard<'_, Rooms> {
        self.rooms.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Rooms> {
        self.rooms.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
pub(crate) fn test_handle(
    capacity: usize,
) -> (ConnectionHandle, mpsc::Sender<OutboundFrame>, mpsc::Receiver<OutboundFrame>) {
    let (sender, receiver) = mpsc::channel(capacity);
    (ConnectionHandle::new(ConnectionId::next(), &sender), sender, receiver)
}
