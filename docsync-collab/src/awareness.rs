//! Presence channel: who is in the room and where their cursor is.
//!
//! Awareness travels in `Awareness` frames next to document updates but is
//! never persisted. Each client re-broadcasts its own state every heartbeat;
//! peers forget a client once its `last_seen` is older than the timeout, and
//! forget everyone when the connection drops.
//!
//! ```text
//! set_local_state() ──► AwarenessUpdate (clock+1) ──► Awareness frame
//!                                                         │
//!             remote Awareness::apply_update() ◄──────────┘
//!                    │  newer clock wins, None = removal
//!                    ▼
//!             AwarenessChange { added, updated, removed }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::error::DecodeError;

/// Cursor or selection inside the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CursorPosition {
    /// Cell id for notebooks, `None` for plain text.
    pub cell: Option<String>,
    pub anchor: u32,
    pub head: u32,
}

/// Presence published by one client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessState {
    pub display_name: String,
    /// CSS color, `#rrggbb`.
    pub user_color: String,
    pub cursor: Option<CursorPosition>,
}

impl AwarenessState {
    /// State with a color derived from the client id.
    pub fn new(client_id: u64, display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            user_color: color_for_client(client_id),
            cursor: None,
        }
    }

    pub fn with_cursor(mut self, cursor: CursorPosition) -> Self {
        self.cursor = Some(cursor);
        self
    }
}

/// One client's entry in an awareness update. `state: None` removes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AwarenessEntry {
    pub client_id: u64,
    pub clock: u64,
    pub state: Option<AwarenessState>,
}

/// Payload of an `Awareness` frame.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AwarenessUpdate {
    pub entries: Vec<AwarenessEntry>,
}

impl AwarenessUpdate {
    /// Encode to binary (bincode).
    pub fn encode(&self) -> Result<Vec<u8>, DecodeError> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| DecodeError::Awareness(e.to_string()))
    }

    /// Decode from binary.
    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let (update, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| DecodeError::Awareness(e.to_string()))?;
        Ok(update)
    }

    /// Removal entries for the given clients.
    pub fn removal(clients: impl IntoIterator<Item = (u64, u64)>) -> Self {
        Self {
            entries: clients
                .into_iter()
                .map(|(client_id, clock)| AwarenessEntry { client_id, clock, state: None })
                .collect(),
        }
    }
}

/// A remote client as seen locally.
#[derive(Debug, Clone)]
pub struct PeerPresence {
    pub state: AwarenessState,
    pub clock: u64,
    pub last_seen: Instant,
}

/// What changed after applying an update or expiring peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AwarenessChange {
    pub added: Vec<u64>,
    pub updated: Vec<u64>,
    pub removed: Vec<u64>,
}

impl AwarenessChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }
}

/// Presence state for one room: our own entry plus every remote peer.
#[derive(Debug)]
pub struct Awareness {
    client_id: u64,
    local: Option<AwarenessState>,
    clock: u64,
    peers: HashMap<u64, PeerPresence>,
    timeout: Duration,
}

impl Awareness {
    pub fn new(client_id: u64, timeout: Duration) -> Self {
        Self {
            client_id,
            local: None,
            clock: 0,
            peers: HashMap::new(),
            timeout,
        }
    }

    pub fn client_id(&self) -> u64 {
        self.client_id
    }

    pub fn local_state(&self) -> Option<&AwarenessState> {
        self.local.as_ref()
    }

    /// Replace our own state and return the update to broadcast.
    pub fn set_local_state(&mut self, state: Option<AwarenessState>) -> AwarenessUpdate {
        self.local = state;
        self.local_update()
    }

    /// Our current entry with a fresh clock (heartbeat renewal).
    pub fn local_update(&mut self) -> AwarenessUpdate {
        self.clock += 1;
        AwarenessUpdate {
            entries: vec![AwarenessEntry {
                client_id: self.client_id,
                clock: self.clock,
                state: self.local.clone(),
            }],
        }
    }

    /// Merge a remote update.
    ///
    /// An entry wins if its clock is newer than what we know, or equal and
    /// it is a removal. Our own client id is ignored.
    pub fn apply_update(&mut self, update: &AwarenessUpdate, now: Instant) -> AwarenessChange {
        let mut change = AwarenessChange::default();
        for entry in &update.entries {
            if entry.client_id == self.client_id {
                continue;
            }
            let known = self.peers.get(&entry.client_id).map(|p| p.clock);
            let newer = match known {
                None => true,
                Some(clock) => entry.clock > clock || (entry.clock == clock && entry.state.is_none()),
            };
            if !newer {
                continue;
            }

            match &entry.state {
                None => {
                    if self.peers.remove(&entry.client_id).is_some() {
                        change.removed.push(entry.client_id);
                    }
                }
                Some(state) => {
                    let previous = self.peers.insert(
                        entry.client_id,
                        PeerPresence {
                            state: state.clone(),
                            clock: entry.clock,
                            last_seen: now,
                        },
                    );
                    match previous {
                        None => change.added.push(entry.client_id),
                        Some(prev) if prev.state != *state => change.updated.push(entry.client_id),
                        Some(_) => {}
                    }
                }
            }
        }
        change
    }

    /// Forget peers not heard from within the timeout.
    pub fn remove_stale(&mut self, now: Instant) -> Vec<u64> {
        let timeout = self.timeout;
        let stale: Vec<u64> = self
            .peers
            .iter()
            .filter(|(_, p)| now.saturating_duration_since(p.last_seen) > timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            self.peers.remove(id);
        }
        stale
    }

    /// Forget every remote peer (connection lost).
    pub fn clear_remote(&mut self) -> Vec<u64> {
        self.peers.drain().map(|(id, _)| id).collect()
    }

    pub fn peers(&self) -> &HashMap<u64, PeerPresence> {
        &self.peers
    }

    pub fn peer(&self, client_id: u64) -> Option<&PeerPresence> {
        self.peers.get(&client_id)
    }
}

/// Shared handle used by the provider API and the transport task.
#[derive(Clone)]
pub struct AwarenessHandle {
    inner: Arc<Mutex<Awareness>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
    changes: broadcast::Sender<AwarenessChange>,
}

impl AwarenessHandle {
    /// Create a handle and the receiver the transport drains into frames.
    pub fn new(client_id: u64, timeout: Duration) -> (Self, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (changes, _) = broadcast::channel(64);
        let handle = Self {
            inner: Arc::new(Mutex::new(Awareness::new(client_id, timeout))),
            outbound,
            changes,
        };
        (handle, outbound_rx)
    }

    pub fn client_id(&self) -> u64 {
        self.lock().client_id()
    }

    /// Publish our presence. Dropped silently while offline; the transport
    /// re-announces the latest state after reconnecting.
    pub fn set_local_state(&self, state: AwarenessState) {
        let update = self.lock().set_local_state(Some(state));
        self.queue(&update);
    }

    /// Withdraw our presence (e.g. the editor lost focus for good).
    pub fn clear_local_state(&self) {
        let update = self.lock().set_local_state(None);
        self.queue(&update);
    }

    pub fn local_state(&self) -> Option<AwarenessState> {
        self.lock().local_state().cloned()
    }

    /// Current remote presence, keyed by client id.
    pub fn peers(&self) -> HashMap<u64, AwarenessState> {
        self.lock()
            .peers()
            .iter()
            .map(|(id, p)| (*id, p.state.clone()))
            .collect()
    }

    /// Subscribe to presence changes.
    pub fn subscribe(&self) -> broadcast::Receiver<AwarenessChange> {
        self.changes.subscribe()
    }

    pub(crate) fn apply_remote(&self, payload: &[u8]) -> Result<(), DecodeError> {
        let update = AwarenessUpdate::decode(payload)?;
        let change = self.lock().apply_update(&update, Instant::now());
        self.publish(change);
        Ok(())
    }

    /// Renewal payload for the heartbeat; expires silent peers on the way.
    pub(crate) fn heartbeat(&self) -> Option<Vec<u8>> {
        let (removed, update) = {
            let mut awareness = self.lock();
            let removed = awareness.remove_stale(Instant::now());
            let update = awareness.local_state().is_some().then(|| awareness.local_update());
            (removed, update)
        };
        self.publish(AwarenessChange { removed, ..Default::default() });
        update.and_then(|u| encode_or_log(&u))
    }

    /// Full local entry to send right after a (re)connect.
    pub(crate) fn announce(&self) -> Option<Vec<u8>> {
        let update = {
            let mut awareness = self.lock();
            awareness.local_state().is_some().then(|| awareness.local_update())
        };
        update.and_then(|u| encode_or_log(&u))
    }

    pub(crate) fn on_disconnect(&self) {
        let removed = self.lock().clear_remote();
        self.publish(AwarenessChange { removed, ..Default::default() });
    }

    fn queue(&self, update: &AwarenessUpdate) {
        if let Some(bytes) = encode_or_log(update) {
            let _ = self.outbound.send(bytes);
        }
    }

    fn publish(&self, change: AwarenessChange) {
        if !change.is_empty() {
            let _ = self.changes.send(change);
        }
    }

    fn lock(&self) -> MutexGuard<'_, Awareness> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl std::fmt::Debug for AwarenessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwarenessHandle").finish_non_exhaustive()
    }
}

fn encode_or_log(update: &AwarenessUpdate) -> Option<Vec<u8>> {
    match update.encode() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            log::warn!("Failed to encode awareness update: {e}");
            None
        }
    }
}

/// Stable, visually distinct `#rrggbb` color for a client id.
pub fn color_for_client(client_id: u64) -> String {
    let hue = (client_id % 360) as f32 / 360.0;
    let (r, g, b) = hsl_to_rgb(hue, 0.7, 0.6);
    format!(
        "#{:02x}{:02x}{:02x}",
        (r * 255.0).round() as u8,
        (g * 255.0).round() as u8,
        (b * 255.0).round() as u8
    )
}

fn hsl_to_rgb(h: f32, s: f32, l: f32) -> (f32, f32, f32) {
    let q = if l < 0.5 { l * (1.0 + s) } else { l + s - l * s };
    let p = 2.0 * l - q;
    (
        hue_to_rgb(p, q, h + 1.0 / 3.0),
        hue_to_rgb(p, q, h),
        hue_to_rgb(p, q, h - 1.0 / 3.0),
    )
}

fn hue_to_rgb(p: f32, q: f32, mut t: f32) -> f32 {
    if t < 0.0 {
        t += 1.0;
    }
    if t > 1.0 {
        t -= 1.0;
    }
    if t < 1.0 / 6.0 {
        return p + (q - p) * 6.0 * t;
    }
    if t < 1.0 / 2.0 {
        return q;
    }
    if t < 2.0 / 3.0 {
        return p + (q - p) * (2.0 / 3.0 - t) * 6.0;
    }
    p
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(name: &str) -> AwarenessState {
        AwarenessState::new(7, name)
    }

    fn entry(client_id: u64, clock: u64, state: Option<AwarenessState>) -> AwarenessUpdate {
        AwarenessUpdate { entries: vec![AwarenessEntry { client_id, clock, state }] }
    }

    #[test]
    fn test_update_encode_decode() {
        let update = AwarenessUpdate {
            entries: vec![
                AwarenessEntry {
                    client_id: 1,
                    clock: 3,
                    state: Some(state("Alice").with_cursor(CursorPosition {
                        cell: Some("c1".into()),
                        anchor: 4,
                        head: 9,
                    })),
                },
                AwarenessEntry { client_id: 2, clock: 1, state: None },
            ],
        };
        let decoded = AwarenessUpdate::decode(&update.encode().unwrap()).unwrap();
        assert_eq!(decoded, update);
    }

    #[test]
    fn test_decode_garbage() {
        assert!(matches!(
            AwarenessUpdate::decode(&[0xFF, 0xFF, 0xFF, 0xFF]),
            Err(DecodeError::Awareness(_))
        ));
    }

    #[test]
    fn test_add_update_remove() {
        let mut awareness = Awareness::new(100, Duration::from_secs(30));
        let now = Instant::now();

        let change = awareness.apply_update(&entry(1, 1, Some(state("Alice"))), now);
        assert_eq!(change.added, vec![1]);

        // Same state with a newer clock only refreshes liveness.
        let change = awareness.apply_update(&entry(1, 2, Some(state("Alice"))), now);
        assert!(change.is_empty());

        let change = awareness.apply_update(&entry(1, 3, Some(state("Alice B."))), now);
        assert_eq!(change.updated, vec![1]);

        let change = awareness.apply_update(&entry(1, 3, None), now);
        assert_eq!(change.removed, vec![1]);
        assert!(awareness.peers().is_empty());
    }

    #[test]
    fn test_stale_clock_ignored() {
        let mut awareness = Awareness::new(100, Duration::from_secs(30));
        let now = Instant::now();
        awareness.apply_update(&entry(1, 5, Some(state("new"))), now);
        let change = awareness.apply_update(&entry(1, 4, Some(state("old"))), now);
        assert!(change.is_empty());
        assert_eq!(awareness.peer(1).unwrap().state.display_name, "new");
    }

    #[test]
    fn test_own_entries_ignored() {
        let mut awareness = Awareness::new(100, Duration::from_secs(30));
        let change = awareness.apply_update(&entry(100, 9, Some(state("me"))), Instant::now());
        assert!(change.is_empty());
        assert!(awareness.peers().is_empty());
    }

    #[test]
    fn test_remove_stale_peers() {
        let mut awareness = Awareness::new(100, Duration::from_millis(50));
        let start = Instant::now();
        awareness.apply_update(&entry(1, 1, Some(state("quiet"))), start);
        awareness.apply_update(&entry(2, 1, Some(state("chatty"))), start + Duration::from_millis(40));

        let removed = awareness.remove_stale(start + Duration::from_millis(60));
        assert_eq!(removed, vec![1]);
        assert!(awareness.peer(2).is_some());
    }

    #[test]
    fn test_local_clock_increments() {
        let mut awareness = Awareness::new(100, Duration::from_secs(30));
        let first = awareness.set_local_state(Some(state("me")));
        let second = awareness.local_update();
        assert_eq!(first.entries[0].clock, 1);
        assert_eq!(second.entries[0].clock, 2);
        assert_eq!(second.entries[0].client_id, 100);
    }

    #[test]
    fn test_clear_remote() {
        let mut awareness = Awareness::new(100, Duration::from_secs(30));
        let now = Instant::now();
        awareness.apply_update(&entry(1, 1, Some(state("a"))), now);
        awareness.apply_update(&entry(2, 1, Some(state("b"))), now);
        let mut removed = awareness.clear_remote();
        removed.sort();
        assert_eq!(removed, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_handle_queues_and_publishes() {
        let (handle, mut outbound) = AwarenessHandle::new(100, Duration::from_secs(30));
        let mut changes = handle.subscribe();

        handle.set_local_state(state("me"));
        let bytes = outbound.recv().await.unwrap();
        let update = AwarenessUpdate::decode(&bytes).unwrap();
        assert_eq!(update.entries[0].client_id, 100);

        let remote = entry(5, 1, Some(state("peer"))).encode().unwrap();
        handle.apply_remote(&remote).unwrap();
        assert_eq!(changes.recv().await.unwrap().added, vec![5]);
        assert!(handle.peers().contains_key(&5));

        handle.on_disconnect();
        assert_eq!(changes.recv().await.unwrap().removed, vec![5]);
        assert!(handle.peers().is_empty());
    }

    #[test]
    fn test_announce_requires_local_state() {
        let (handle, _rx) = AwarenessHandle::new(1, Duration::from_secs(30));
        assert!(handle.announce().is_none());
        handle.set_local_state(state("me"));
        assert!(handle.announce().is_some());
    }

    #[test]
    fn test_color_is_stable() {
        assert_eq!(color_for_client(42), color_for_client(42));
        assert!(color_for_client(42).starts_with('#'));
        assert_eq!(color_for_client(42).len(), 7);
    }
}
