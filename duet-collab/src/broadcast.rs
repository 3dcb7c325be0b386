//! Fan-out broadcast to the other peers of a room.
//!
//! Uses tokio broadcast channels for O(1) send to all subscribers. Each
//! envelope carries its sender so per-peer forwarders can skip their own
//! messages without decoding them. Lagging receivers drop the oldest
//! messages; the count is reported in [`BroadcastStats`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use duet_core::ClientId;
use tokio::sync::{broadcast, RwLock};

use crate::protocol::{PeerInfo, ProtocolError, SyncMessage};
use crate::room::RoomId;

/// One encoded message and the peer it came from.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub from: ClientId,
    pub bytes: Arc<Vec<u8>>,
}

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

/// Atomic broadcast stats, so the send path never takes a lock.
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A broadcast group for a single room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<Envelope>,
    peers: RwLock<HashMap<ClientId, PeerInfo>>,
    /// Last awareness payload per peer, replayed to late joiners.
    awareness: RwLock<HashMap<ClientId, Arc<Vec<u8>>>>,
    capacity: usize,
    atomic_stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` is how many messages each peer may lag behind before it
    /// starts losing the oldest ones.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            awareness: RwLock::new(HashMap::new()),
            capacity,
            atomic_stats: AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            },
        }
    }

    /// Add a peer and return its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<Envelope> {
        let mut peers = self.peers.write().await;
        peers.insert(info.client_id, info);
        self.sender.subscribe()
    }

    /// Remove a peer along with its cached awareness.
    pub async fn remove_peer(&self, client_id: ClientId) -> Option<PeerInfo> {
        self.awareness.write().await.remove(&client_id);
        self.peers.write().await.remove(&client_id)
    }

    /// Encode and send `msg` to every subscriber. Filtering out the sender
    /// is the receiver's job.
    pub fn broadcast(&self, from: ClientId, msg: &SyncMessage) -> Result<usize, ProtocolError> {
        let bytes = Arc::new(msg.encode()?);
        Ok(self.broadcast_raw(Envelope { from, bytes }))
    }

    /// Send pre-encoded bytes without re-serializing.
    pub fn broadcast_raw(&self, envelope: Envelope) -> usize {
        let count = self.sender.send(envelope).unwrap_or(0);
        self.atomic_stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub async fn cache_awareness(&self, client_id: ClientId, encoded: Arc<Vec<u8>>) {
        self.awareness.write().await.insert(client_id, encoded);
    }

    /// Cached awareness messages from everyone except `exclude`.
    pub async fn cached_awareness(&self, exclude: ClientId) -> Vec<Arc<Vec<u8>>> {
        self.awareness
            .read()
            .await
            .iter()
            .filter(|(id, _)| **id != exclude)
            .map(|(_, bytes)| bytes.clone())
            .collect()
    }

    pub fn record_dropped(&self, count: u64) {
        self.atomic_stats.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peers(&self) -> Vec<PeerInfo> {
        self.peers.read().await.values().cloned().collect()
    }

    pub async fn has_peer(&self, client_id: ClientId) -> bool {
        self.peers.read().await.contains_key(&client_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.atomic_stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.atomic_stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Maps room ids to broadcast groups so traffic never crosses rooms.
pub struct RoomManager {
    rooms: RwLock<HashMap<RoomId, Arc<BroadcastGroup>>>,
    default_capacity: usize,
}

impl RoomManager {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the group for `room`.
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
        let group = Arc::new(BroadcastGroup::new(self.default_capacity));
        rooms.insert(room.clone(), group.clone());
        group
    }

    pub async fn get(&self, room: &RoomId) -> Option<Arc<BroadcastGroup>> {
        self.rooms.read().await.get(room).cloned()
    }

    /// Drop the group if nobody is left in it. Returns `true` if removed.
    pub async fn remove_if_empty(&self, room: &RoomId) -> bool {
        let mut rooms = self.rooms.write().await;
        if let Some(group) = rooms.get(room) {
            if group.peer_count().await == 0 {
                rooms.remove(room);
                return true;
            }
        }
        false
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }
}
