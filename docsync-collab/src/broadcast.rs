//! Per-room fan-out of encoded frames to every other connection.
//!
//! One tokio broadcast channel per room; each connection holds a receiver
//! and skips messages it originated itself. Frames are encoded once by the
//! sender and shared as `Arc<Vec<u8>>`, so fan-out to N peers costs N pointer
//! clones rather than N encodes.
//!
//! Performance notes:
//! - `broadcast()` is lock-free; the stats counters are relaxed atomics.
//! - The peer table sits behind an `RwLock` and is only written on join,
//!   leave and awareness changes, never per document update.
//! - A receiver more than `capacity` frames behind gets `Lagged`; the relay
//!   then resends the full room state instead of the missed frames.
//!
//! The group also remembers the last awareness entry each connection
//! announced, so a joining peer is shown everyone present right away and the
//! entries can be withdrawn when their connection closes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{broadcast, RwLock};

use crate::awareness::{AwarenessEntry, AwarenessUpdate};

/// Pre-encoded frames sent by connection `origin`.
#[derive(Debug, Clone)]
pub struct RoomMessage {
    pub origin: u64,
    pub payload: Arc<Vec<u8>>,
}

/// A connection in a room.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub conn_id: u64,
    pub addr: SocketAddr,
    /// Latest awareness entry per client id announced on this connection.
    pub awareness_clients: HashMap<u64, AwarenessEntry>,
    pub joined_at: Instant,
}

impl PeerInfo {
    pub fn new(conn_id: u64, addr: SocketAddr) -> Self {
        Self {
            conn_id,
            addr,
            awareness_clients: HashMap::new(),
            joined_at: Instant::now(),
        }
    }
}

/// Broadcast health counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub active_peers: usize,
}

#[derive(Default)]
struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// Fan-out group of one room.
pub struct BroadcastGroup {
    sender: broadcast::Sender<RoomMessage>,
    peers: RwLock<HashMap<u64, PeerInfo>>,
    capacity: usize,
    stats: AtomicBroadcastStats,
}

impl BroadcastGroup {
    /// `capacity` messages are buffered per receiver before a slow peer lags.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            peers: RwLock::new(HashMap::new()),
            capacity,
            stats: AtomicBroadcastStats::default(),
        }
    }

    /// Register a connection and return its receiver.
    pub async fn add_peer(&self, info: PeerInfo) -> broadcast::Receiver<RoomMessage> {
        let mut peers = self.peers.write().await;
        peers.insert(info.conn_id, info);
        self.sender.subscribe()
    }

    pub async fn remove_peer(&self, conn_id: u64) -> Option<PeerInfo> {
        self.peers.write().await.remove(&conn_id)
    }

    /// Track awareness entries announced by `conn_id` (`None` state = removed).
    /// An entry older than the one already held is ignored.
    pub async fn record_awareness(&self, conn_id: u64, entries: &[AwarenessEntry]) {
        let mut peers = self.peers.write().await;
        let Some(peer) = peers.get_mut(&conn_id) else {
            return;
        };
        for entry in entries {
            if peer
                .awareness_clients
                .get(&entry.client_id)
                .is_some_and(|held| held.clock > entry.clock)
            {
                continue;
            }
            if entry.state.is_some() {
                peer.awareness_clients.insert(entry.client_id, entry.clone());
            } else {
                peer.awareness_clients.remove(&entry.client_id);
            }
        }
    }

    /// Every live awareness entry in the room.
    pub async fn awareness_snapshot(&self) -> AwarenessUpdate {
        let peers = self.peers.read().await;
        let mut entries: Vec<AwarenessEntry> = peers
            .values()
            .flat_map(|peer| peer.awareness_clients.values().cloned())
            .collect();
        entries.sort_by_key(|e| e.client_id);
        AwarenessUpdate { entries }
    }

    /// Send to every receiver; returns how many there were.
    pub fn broadcast(&self, origin: u64, payload: Arc<Vec<u8>>) -> usize {
        let count = self.sender.send(RoomMessage { origin, payload }).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    /// Account for messages a lagging receiver missed.
    pub fn record_dropped(&self, count: u64) {
        self.stats.messages_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn has_peer(&self, conn_id: u64) -> bool {
        self.peers.read().await.contains_key(&conn_id)
    }

    pub async fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            active_peers: self.peers.read().await.len(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
