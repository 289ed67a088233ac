//! Relay server: per-room authoritative document, fan-out and lock REST API.
//!
//! ```text
//! Client A ──┐  ws://host/{room}
//!             ├── Room ── yrs Doc ── BroadcastGroup ──► Client A, B, C
//! Client B ──┘               │
//!                            └── RoomStore (RocksDB)
//!                                   ├── snapshots (LZ4)
//!                                   ├── updates   (LZ4)
//!                                   └── rooms     (initialized marker)
//!
//! http://host/rooms/{room}/lock|initialized ── RoomLocks (lease)
//! ```
//!
//! The relay opens every connection with its own `SyncStep1`, answers the
//! client's `SyncStep1` with a diff, merges `SyncStep2`/`Update` payloads into
//! the room document and re-broadcasts them as `Update`. Awareness frames are
//! relayed untouched. The relay keeps the latest entry per client so a new
//! connection gets the room's presence right after the `SyncStep1`, and the
//! entries seen on a connection are withdrawn when it closes. With a store configured, the room is snapshotted and evicted when
//! its last peer leaves.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use docsync_core::DocumentError;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response as WsResponse};
use tokio_tungstenite::tungstenite::Message;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use crate::awareness::AwarenessUpdate;
use crate::broadcast::{BroadcastGroup, PeerInfo, RoomMessage};
use crate::codec::{Frame, FrameDecoder, FrameKind, DEFAULT_MAX_FRAME_LEN};
use crate::config::parse_flag;
use crate::error::{DecodeError, LockError, ServerError, TransportError};
use crate::lock::{LockGrant, LockToken, RoomLocks, DEFAULT_LOCK_LEASE};
use crate::store::{RoomStore, StoreConfig};

/// v1 encoding of an update that carries nothing.
const EMPTY_UPDATE_LEN: usize = 2;

/// Relay configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket listener
    pub bind_addr: String,
    /// Lock REST listener
    pub api_addr: String,
    /// Required `?token=` value (None = open relay)
    pub auth_token: Option<String>,
    /// Lock reclamation lease
    pub lock_lease: Duration,
    /// Frames buffered per peer before it lags
    pub broadcast_capacity: usize,
    pub max_frame_len: usize,
    /// Persistence directory (None = in-memory only)
    pub storage_path: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            api_addr: "127.0.0.1:9091".to_string(),
            auth_token: None,
            lock_lease: DEFAULT_LOCK_LEASE,
            broadcast_capacity: 256,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
            storage_path: None,
        }
    }
}

impl ServerConfig {
    /// Ephemeral ports on localhost.
    pub fn for_testing(storage_path: Option<PathBuf>) -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            api_addr: "127.0.0.1:0".to_string(),
            storage_path,
            ..Self::default()
        }
    }

    /// Defaults overridden by `DOCSYNC_BIND_ADDR`, `DOCSYNC_API_ADDR`,
    /// `DOCSYNC_AUTH_TOKEN`, `DOCSYNC_LOCK_LEASE_SECS`,
    /// `DOCSYNC_BROADCAST_CAPACITY`, `DOCSYNC_STORAGE_PATH` and
    /// `DOCSYNC_IN_MEMORY`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(v) = lookup("DOCSYNC_BIND_ADDR") {
            config.bind_addr = v;
        }
        if let Some(v) = lookup("DOCSYNC_API_ADDR") {
            config.api_addr = v;
        }
        config.auth_token = lookup("DOCSYNC_AUTH_TOKEN").filter(|t| !t.is_empty());
        if let Some(secs) = lookup("DOCSYNC_LOCK_LEASE_SECS").and_then(|v| v.parse().ok()) {
            config.lock_lease = Duration::from_secs(secs);
        }
        if let Some(n) = lookup("DOCSYNC_BROADCAST_CAPACITY").and_then(|v| v.parse().ok()) {
            config.broadcast_capacity = n;
        }
        config.storage_path = lookup("DOCSYNC_STORAGE_PATH").map(PathBuf::from);
        if lookup("DOCSYNC_IN_MEMORY").is_some_and(|v| parse_flag(&v)) {
            config.storage_path = None;
        }
        config
    }
}

/// Relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_frames: u64,
    pub total_bytes: u64,
    pub rejected_frames: u64,
    pub denied_connections: u64,
    pub active_rooms: usize,
    pub persisted_updates: u64,
    pub persisted_snapshots: u64,
}

/// One live room.
struct Room {
    name: String,
    doc: Mutex<Doc>,
    broadcast: Arc<BroadcastGroup>,
}

impl Room {
    fn new(name: &str, doc: Doc, broadcast_capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            doc: Mutex::new(doc),
            broadcast: Arc::new(BroadcastGroup::new(broadcast_capacity)),
        }
    }

    fn doc(&self) -> MutexGuard<'_, Doc> {
        self.doc.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn state_vector(&self) -> Vec<u8> {
        self.doc().transact().state_vector().encode_v1()
    }

    fn diff(&self, state_vector: &[u8]) -> Result<Vec<u8>, DecodeError> {
        let sv = StateVector::decode_v1(state_vector)
            .map_err(|e| DecodeError::Document(DocumentError::StateVector(e.to_string())))?;
        Ok(self.doc().transact().encode_state_as_update_v1(&sv))
    }

    fn snapshot(&self) -> Vec<u8> {
        self.doc().transact().encode_state_as_update_v1(&StateVector::default())
    }

    /// Decode first, then merge, so a corrupt payload never touches the doc.
    fn apply(&self, payload: &[u8]) -> Result<(), DecodeError> {
        let update = Update::decode_v1(payload)
            .map_err(|e| DecodeError::Document(DocumentError::Decode(e.to_string())))?;
        let doc = self.doc();
        let mut txn = doc.transact_mut();
        txn.apply_update(update)
            .map_err(|e| DecodeError::Document(DocumentError::Apply(e.to_string())))
    }
}

/// Listeners bound by [`RelayServer::bind`].
pub struct BoundRelay {
    ws: TcpListener,
    api: TcpListener,
}

impl BoundRelay {
    pub fn ws_addr(&self) -> std::io::Result<SocketAddr> {
        self.ws.local_addr()
    }

    pub fn api_addr(&self) -> std::io::Result<SocketAddr> {
        self.api.local_addr()
    }
}

/// The relay.
pub struct RelayServer {
    config: ServerConfig,
    rooms: RwLock<HashMap<String, Arc<Room>>>,
    locks: Arc<RoomLocks>,
    store: Option<Arc<RoomStore>>,
    stats: RwLock<ServerStats>,
    next_conn_id: AtomicU64,
}

impl RelayServer {
    /// Open the store (if configured) and set up the lock arbiter.
    pub fn new(config: ServerConfig) -> Result<Self, ServerError> {
        let store = match &config.storage_path {
            Some(path) => Some(Arc::new(RoomStore::open(StoreConfig {
                path: path.clone(),
                ..StoreConfig::default()
            })?)),
            None => None,
        };
        let mut locks = RoomLocks::new(config.lock_lease);
        if let Some(store) = &store {
            locks = locks.with_store(store.clone());
        }

        Ok(Self {
            config,
            rooms: RwLock::new(HashMap::new()),
            locks: Arc::new(locks),
            store,
            stats: RwLock::new(ServerStats::default()),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn locks(&self) -> &Arc<RoomLocks> {
        &self.locks
    }

    pub fn store(&self) -> Option<&Arc<RoomStore>> {
        self.store.as_ref()
    }

    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.stats.read().await.clone();
        stats.active_rooms = self.rooms.read().await.len();
        stats
    }

    /// Full state of a live room.
    pub async fn room_snapshot(&self, room: &str) -> Option<Vec<u8>> {
        let rooms = self.rooms.read().await;
        rooms.get(room).map(|r| r.snapshot())
    }

    pub async fn bind(&self) -> Result<BoundRelay, ServerError> {
        let ws = TcpListener::bind(&self.config.bind_addr).await?;
        let api = TcpListener::bind(&self.config.api_addr).await?;
        log::info!(
            "Relay listening on ws://{} (lock API on http://{})",
            ws.local_addr()?,
            api.local_addr()?
        );
        Ok(BoundRelay { ws, api })
    }

    /// Bind and serve until `shutdown` resolves.
    pub async fn run_until<F>(self: Arc<Self>, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let bound = self.bind().await?;
        self.serve(bound, shutdown).await
    }

    /// Serve already-bound listeners until `shutdown` resolves, then close
    /// every connection (persisting their rooms) and return.
    pub async fn serve<F>(self: Arc<Self>, bound: BoundRelay, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut api_stop = stop_rx.clone();
        let api = axum::serve(bound.api, api_router(self.locks.clone())).with_graceful_shutdown(async move {
            let _ = api_stop.changed().await;
        });
        let api_task = tokio::spawn(async move {
            if let Err(e) = api.await {
                log::error!("Lock API server failed: {e}");
            }
        });

        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                accepted = bound.ws.accept() => match accepted {
                    Ok((stream, addr)) => {
                        log::debug!("New TCP connection from {addr}");
                        connections.spawn(self.clone().handle_connection(stream, addr, stop_rx.clone()));
                    }
                    Err(e) => log::warn!("Accept failed: {e}"),
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        log::info!("Relay shutting down ({} open connections)", connections.len());
        let _ = stop_tx.send(true);
        let drained = tokio::time::timeout(Duration::from_secs(5), async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            log::warn!("Connections did not close in time, aborting");
            connections.abort_all();
        }
        let _ = api_task.await;
        Ok(())
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, addr: SocketAddr, shutdown: watch::Receiver<bool>) {
        if let Err(e) = self.serve_connection(stream, addr, shutdown).await {
            log::debug!("Connection from {addr} ended: {e}");
        }
    }

    async fn serve_connection(
        &self,
        stream: TcpStream,
        addr: SocketAddr,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<(), TransportError> {
        let mut uri = String::new();
        let capture = |request: &Request, response: WsResponse| -> Result<WsResponse, ErrorResponse> {
            uri = request.uri().to_string();
            Ok(response)
        };
        let ws = tokio_tungstenite::accept_hdr_async(stream, capture).await?;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let (room_name, token) = parse_room_uri(&uri);
        if room_name.is_empty() || !self.authorized(token.as_deref()) {
            log::warn!("Denying connection from {addr} to {uri:?}");
            self.stats.write().await.denied_connections += 1;
            let reason = if room_name.is_empty() { "missing room" } else { "invalid token" };
            ws_tx.send(Message::binary(Frame::permission_denied(reason).encode())).await?;
            let _ = ws_tx.send(Message::Close(None)).await;
            return Ok(());
        }

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (room, mut room_rx) = self.join_room(&room_name, PeerInfo::new(conn_id, addr)).await;
        {
            let mut stats = self.stats.write().await;
            stats.total_connections += 1;
            stats.active_connections += 1;
        }
        log::info!("Connection {conn_id} from {addr} joined room {room_name}");

        let result = self
            .relay(&room, conn_id, &mut ws_tx, &mut ws_rx, &mut room_rx, &mut shutdown)
            .await;

        self.leave_room(&room, conn_id).await;
        self.stats.write().await.active_connections -= 1;
        log::info!("Connection {conn_id} left room {room_name}");
        result
    }

    async fn relay<Tx, Rx>(
        &self,
        room: &Arc<Room>,
        conn_id: u64,
        ws_tx: &mut Tx,
        ws_rx: &mut Rx,
        room_rx: &mut broadcast::Receiver<RoomMessage>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), TransportError>
    where
        Tx: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
        Rx: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        ws_tx.send(Message::binary(Frame::sync_step1(room.state_vector()).encode())).await?;
        let present = room.broadcast.awareness_snapshot().await;
        if !present.entries.is_empty() {
            match present.encode() {
                Ok(payload) => ws_tx.send(Message::binary(Frame::awareness(payload).encode())).await?,
                Err(e) => log::warn!("Connection {conn_id}: cannot encode room presence: {e}"),
            }
        }
        let mut decoder = FrameDecoder::new(self.config.max_frame_len);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = ws_tx.send(Message::Close(None)).await;
                    return Ok(());
                }
                message = ws_rx.next() => match message {
                    Some(Ok(Message::Binary(data))) => {
                        {
                            let mut stats = self.stats.write().await;
                            stats.total_bytes += data.len() as u64;
                        }
                        decoder.push(&data);
                        loop {
                            match decoder.next_frame() {
                                Ok(Some(frame)) => {
                                    self.stats.write().await.total_frames += 1;
                                    if let Some(reply) = self.handle_frame(room, conn_id, frame).await {
                                        ws_tx.send(Message::binary(reply.encode())).await?;
                                    }
                                }
                                Ok(None) => break,
                                Err(e) => {
                                    log::warn!("Connection {conn_id}: dropping undecodable data: {e}");
                                    self.stats.write().await.rejected_frames += 1;
                                    break;
                                }
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) => ws_tx.flush().await?,
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                outgoing = room_rx.recv() => match outgoing {
                    Ok(message) if message.origin == conn_id => {}
                    Ok(message) => ws_tx.send(Message::binary(message.payload.to_vec())).await?,
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("Connection {conn_id} lagged by {n} frames, resending room state");
                        room.broadcast.record_dropped(n);
                        ws_tx.send(Message::binary(Frame::update(room.snapshot()).encode())).await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => return Ok(()),
                },
            }
        }
    }

    /// Process one inbound frame; returns the direct reply, if any.
    async fn handle_frame(&self, room: &Arc<Room>, conn_id: u64, frame: Frame) -> Option<Frame> {
        match frame.kind {
            FrameKind::SyncStep1 => match room.diff(&frame.payload) {
                Ok(diff) => Some(Frame::sync_step2(diff)),
                Err(e) => {
                    self.reject(conn_id, &e).await;
                    None
                }
            },
            FrameKind::SyncStep2 | FrameKind::Update => {
                if frame.payload.len() <= EMPTY_UPDATE_LEN {
                    return None;
                }
                if let Err(e) = room.apply(&frame.payload) {
                    self.reject(conn_id, &e).await;
                    return None;
                }
                let encoded = Arc::new(Frame::update(frame.payload.to_vec()).encode());
                room.broadcast.broadcast(conn_id, encoded);
                self.persist_update(room, &frame.payload).await;
                None
            }
            FrameKind::Awareness => {
                match AwarenessUpdate::decode(&frame.payload) {
                    Ok(update) => {
                        room.broadcast.record_awareness(conn_id, &update.entries).await;
                        room.broadcast.broadcast(conn_id, Arc::new(frame.encode()));
                    }
                    Err(e) => self.reject(conn_id, &e).await,
                }
                None
            }
            FrameKind::Auth => None,
        }
    }

    async fn reject(&self, conn_id: u64, error: &DecodeError) {
        log::warn!("Connection {conn_id}: dropping frame: {error}");
        self.stats.write().await.rejected_frames += 1;
    }

    async fn persist_update(&self, room: &Room, payload: &[u8]) {
        let Some(store) = &self.store else {
            return;
        };
        match store.append_update(&room.name, payload) {
            Ok(_) => self.stats.write().await.persisted_updates += 1,
            Err(e) => log::error!("Failed to persist update for room {}: {e}", room.name),
        }
    }

    fn authorized(&self, token: Option<&str>) -> bool {
        match &self.config.auth_token {
            Some(expected) => token == Some(expected.as_str()),
            None => true,
        }
    }

    /// Get or create the room and register the peer under the rooms lock, so
    /// a concurrent eviction cannot hand out a dying room.
    async fn join_room(&self, name: &str, peer: PeerInfo) -> (Arc<Room>, broadcast::Receiver<RoomMessage>) {
        let mut rooms = self.rooms.write().await;
        let room = match rooms.get(name) {
            Some(room) => room.clone(),
            None => {
                let room = Arc::new(Room::new(name, self.load_doc(name), self.config.broadcast_capacity));
                rooms.insert(name.to_string(), room.clone());
                room
            }
        };
        let rx = room.broadcast.add_peer(peer).await;
        (room, rx)
    }

    fn load_doc(&self, name: &str) -> Doc {
        let Some(store) = &self.store else {
            return Doc::new();
        };
        match store.load_room_state(name) {
            Ok(Some(doc)) => {
                log::info!("Loaded persisted state for room {name}");
                doc
            }
            Ok(None) => Doc::new(),
            Err(e) => {
                log::error!("Failed to load room {name}, starting empty: {e}");
                Doc::new()
            }
        }
    }

    async fn leave_room(&self, room: &Arc<Room>, conn_id: u64) {
        let mut rooms = self.rooms.write().await;
        if let Some(peer) = room.broadcast.remove_peer(conn_id).await {
            if !peer.awareness_clients.is_empty() {
                let removal = AwarenessUpdate::removal(
                    peer.awareness_clients.values().map(|entry| (entry.client_id, entry.clock + 1)),
                );
                match removal.encode() {
                    Ok(payload) => {
                        room.broadcast.broadcast(conn_id, Arc::new(Frame::awareness(payload).encode()));
                    }
                    Err(e) => log::warn!("Failed to encode awareness removal: {e}"),
                }
            }
        }

        if room.broadcast.peer_count().await > 0 {
            return;
        }
        let Some(store) = &self.store else {
            // Without a store the room document is the only copy.
            return;
        };
        match store.save_snapshot(&room.name, &room.snapshot()) {
            Ok(meta) => {
                if let Err(e) = store.compact_updates(&room.name, meta.next_seq) {
                    log::error!("Failed to compact updates of room {}: {e}", room.name);
                }
                self.stats.write().await.persisted_snapshots += 1;
                rooms.remove(&room.name);
                log::info!("Persisted and closed empty room {}", room.name);
            }
            Err(e) => log::error!("Failed to persist room {}, keeping it open: {e}", room.name),
        }
    }
}

/// Split `/room?token=x` into the room name and token.
fn parse_room_uri(uri: &str) -> (String, Option<String>) {
    let (path, query) = match uri.split_once('?') {
        Some((path, query)) => (path, Some(query)),
        None => (uri, None),
    };
    let room = path.trim_start_matches('/').trim_end_matches('/').to_string();
    let token = query.and_then(|q| {
        q.split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "token")
            .map(|(_, value)| value.to_string())
    });
    (room, token)
}

// ─── Lock REST surface ────────────────────────────────────────────────

/// `POST /rooms/{guid}/lock`, `PUT|DELETE /rooms/{guid}/lock/{token}`,
/// `GET|PUT /rooms/{guid}/initialized`.
pub fn api_router(locks: Arc<RoomLocks>) -> Router {
    Router::new()
        .route("/rooms/{guid}/lock", post(acquire_lock))
        .route("/rooms/{guid}/lock/{token}", put(renew_lock).delete(release_lock))
        .route("/rooms/{guid}/initialized", get(get_initialized).put(put_initialized))
        .with_state(locks)
}

fn lock_error_response(error: LockError) -> Response {
    match error {
        LockError::Contention(_) | LockError::NotHeld { .. } => {
            (StatusCode::CONFLICT, error.to_string()).into_response()
        }
        other => {
            log::error!("Lock API error: {other}");
            (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response()
        }
    }
}

async fn acquire_lock(State(locks): State<Arc<RoomLocks>>, Path(guid): Path<String>) -> Response {
    match locks.try_acquire(&guid) {
        Ok(token) => Json(LockGrant { token }).into_response(),
        Err(e) => lock_error_response(e),
    }
}

async fn release_lock(
    State(locks): State<Arc<RoomLocks>>,
    Path((guid, token)): Path<(String, u64)>,
) -> Response {
    match locks.try_release(&guid, LockToken(token)) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => lock_error_response(e),
    }
}

async fn renew_lock(
    State(locks): State<Arc<RoomLocks>>,
    Path((guid, token)): Path<(String, u64)>,
) -> Response {
    match locks.try_renew(&guid, LockToken(token)) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => lock_error_response(e),
    }
}

async fn get_initialized(State(locks): State<Arc<RoomLocks>>, Path(guid): Path<String>) -> Response {
    match locks.initialized(&guid) {
        Ok(initialized) => Json(initialized).into_response(),
        Err(e) => lock_error_response(e),
    }
}

async fn put_initialized(State(locks): State<Arc<RoomLocks>>, Path(guid): Path<String>) -> Response {
    match locks.set_initialized(&guid) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => lock_error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use yrs::{GetString, Text};

    #[test]
    fn test_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.lock_lease, Duration::from_secs(30));
        assert!(config.storage_path.is_none());
        assert!(config.auth_token.is_none());
    }

    #[test]
    fn test_config_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("DOCSYNC_BIND_ADDR", "0.0.0.0:7000"),
            ("DOCSYNC_AUTH_TOKEN", "s3cret"),
            ("DOCSYNC_LOCK_LEASE_SECS", "5"),
            ("DOCSYNC_STORAGE_PATH", "/var/lib/docsync"),
        ]
        .into_iter()
        .collect();
        let config = ServerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(config.bind_addr, "0.0.0.0:7000");
        assert_eq!(config.api_addr, "127.0.0.1:9091");
        assert_eq!(config.auth_token.as_deref(), Some("s3cret"));
        assert_eq!(config.lock_lease, Duration::from_secs(5));
        assert_eq!(config.storage_path, Some(PathBuf::from("/var/lib/docsync")));
    }

    #[test]
    fn test_parse_room_uri() {
        assert_eq!(parse_room_uri("/doc-42"), ("doc-42".to_string(), None));
        assert_eq!(
            parse_room_uri("/doc-42?x=1&token=abc"),
            ("doc-42".to_string(), Some("abc".to_string()))
        );
        assert_eq!(parse_room_uri("/").0, "");
    }

    #[test]
    fn test_room_rejects_corrupt_update() {
        let room = Room::new("r", Doc::new(), 4);
        let before = room.snapshot();
        assert!(room.apply(&[0xFF, 0xFF, 0xFF, 0xFF]).is_err());
        assert_eq!(room.snapshot(), before);
    }

    #[test]
    fn test_room_diff_and_apply() {
        let source = Doc::new();
        let text = source.get_or_insert_text("source");
        {
            let mut txn = source.transact_mut();
            text.insert(&mut txn, 0, "relay me");
        }
        let update = source.transact().encode_state_as_update_v1(&StateVector::default());

        let room = Room::new("r", Doc::new(), 4);
        let empty_sv = room.state_vector();
        room.apply(&update).unwrap();
        room.apply(&update).unwrap();

        let replica = Doc::new();
        let diff = room.diff(&empty_sv).unwrap();
        {
            let mut txn = replica.transact_mut();
            txn.apply_update(Update::decode_v1(&diff).unwrap()).unwrap();
        }
        let replica_text = replica.get_or_insert_text("source");
        assert_eq!(replica_text.get_string(&replica.transact()), "relay me");
        assert!(room.diff(&[0xFF, 0xFF]).is_err());
    }

    #[tokio::test]
    async fn test_server_with_storage() {
        let dir = tempfile::tempdir().unwrap();
        let server = RelayServer::new(ServerConfig::for_testing(Some(dir.path().join("db")))).unwrap();
        assert!(server.store().is_some());
        assert_eq!(server.stats().await, ServerStats::default());
    }

    #[tokio::test]
    async fn test_stored_room_is_restored() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db");
        {
            let store = RoomStore::open(StoreConfig::for_testing(&path)).unwrap();
            let doc = Doc::new();
            let text = doc.get_or_insert_text("source");
            {
                let mut txn = doc.transact_mut();
                text.insert(&mut txn, 0, "persisted");
            }
            let snapshot = doc.transact().encode_state_as_update_v1(&StateVector::default());
            store.save_snapshot("doc-1", &snapshot).unwrap();
        }

        let server = RelayServer::new(ServerConfig::for_testing(Some(path))).unwrap();
        let doc = server.load_doc("doc-1");
        let text = doc.get_or_insert_text("source");
        assert_eq!(text.get_string(&doc.transact()), "persisted");
    }
}
