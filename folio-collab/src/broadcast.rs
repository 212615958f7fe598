//! Fan-out of relayed frames to every member of a room, with backpressure.
//!
//! Uses tokio broadcast channels so one send reaches all subscribers.
//! Each member gets an independent receiver that buffers up to `capacity`
//! frames; a member that falls further behind loses the oldest frames and
//! recovers them through the sync handshake.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use uuid::Uuid;

use crate::room::RoomId;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default)]
pub struct BroadcastStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
    pub active_peers: usize,
}

/// Atomic counters, so the send path never takes a lock.
struct AtomicBroadcastStats {
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl AtomicBroadcastStats {
    fn new() -> Self {
        Self {
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }
}

/// One encoded frame plus the connection it came from, so the sender's
/// own forwarder can skip it.
#[derive(Debug, Clone)]
pub struct RelayFrame {
    pub origin: Uuid,
    pub payload: Arc<Vec<u8>>,
}

/// The members of one room on the relay.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RelayFrame>,

    /// connection id → user id
    peers: Arc<RwLock<HashMap<Uuid, String>>>,

    capacity: usize,

    atomic_stats: Arc<AtomicBroadcastStats>,
}

impl BroadcastGroup {
    /// `capacity` is how many frames each member may lag behind before it
    /// starts losing them.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: Arc::new(RwLock::new(HashMap::new())),
            capacity,
            atomic_stats: Arc::new(AtomicBroadcastStats::new()),
        }
    }

    /// Add a connection to the room and return its receiver.
    pub async fn add_peer(&self, conn_id: Uuid, user_id: impl Into<String>) -> broadcast::Receiver<RelayFrame> {
        let mut peers = self.peers.write().await;
        peers.insert(conn_id, user_id.into());
        self.sender.subscribe()
    }

    /// Remove a connection, returning the user it belonged to.
    pub async fn remove_peer(&self, conn_id: &Uuid) -> Option<String> {
        let mut peers = self.peers.write().await;
        peers.remove(conn_id)
    }

    /// Send pre-encoded bytes to every member. Returns the number of
    /// receivers, the origin's own included; skipping it is the
    /// receiver's job.
    pub fn broadcast_raw(&self, origin: Uuid, payload: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(RelayFrame { origin, payload }).unwrap_or(0);
        self.atomic_stats.frames_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for frames a lagging member never saw.
    pub fn record_dropped(&self, frames: u64) {
        self.atomic_stats.frames_dropped.fetch_add(frames, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    /// User ids of the current members, one per connection.
    pub async fn users(&self) -> Vec<String> {
        let mut users: Vec<String> = self.peers.read().await.values().cloned().collect();
        users.sort();
        users
    }

    pub async fn has_peer(&self, conn_id: &Uuid) -> bool {
        self.peers.read().await.contains_key(conn_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        let peers = self.peers.read().await;
        BroadcastStats {
            frames_sent: self.atomic_stats.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.atomic_stats.frames_dropped.load(Ordering::Relaxed),
            active_peers: peers.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps room names to broadcast groups so traffic never crosses rooms.
pub struct RoomManager {
    rooms: Arc<RwLock<HashMap<RoomId, Arc<BroadcastGroup>>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: Arc::new(RwLock::new(HashMap::new())),
            default_capacity,
        }
    }

    pub async fn get_or_create(&self, room: &RoomId) -> Arc<BroadcastGroup> {
        {
            let rooms = self.rooms.read().await;
            if let Some(group) = rooms.get(room) {
                return group.clone();
            }
        }

        let mut rooms = self.rooms.write().await;
        // Double-check after acquiring write lock
        if let Some(group) = rooms.get(room) {
            return group.clone();
        }

        log::debug!("Creating relay group for room {room}");
        let group = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(room.clone(), group.clone());
        group
    }

    pub async fn get(&self, room: &RoomId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room).cloned()
    }

    /// Drop the group for `room` if nobody is left in it.
    pub async fn remove_if_empty(&self, room: &RoomId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(group) = rooms.get(room) {
            if group.peer_count().await == 0 {
                rooms.remove(room);
                log::debug!("Room {room} removed (empty)");
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        let mut rooms: Vec<RoomId> = self.rooms.read().await.keys().cloned().collect();
        rooms.sort();
        rooms
    }
}
