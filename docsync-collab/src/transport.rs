//! One room over a reconnecting WebSocket.
//!
//! ```text
//!            ┌────────────── destroy() from any state ─────────────┐
//!            ▼                                                     │
//!  Connecting ──► Open ──► Syncing ──► Synced                     Closed
//!      ▲                                  │
//!      └──── Reconnecting ◄── transport error / liveness timeout ─┘
//! ```
//!
//! A single task owns the socket, the frame decoder and the per-connection
//! barrier queue. Every (re)connection re-runs the full `SyncStep1`/`SyncStep2`
//! handshake, which also carries any edits made while offline; queued local
//! updates are therefore discarded when a session starts.

use std::cell::Cell;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use docsync_core::{SyncDocument, UpdateSubscription};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use crate::awareness::AwarenessHandle;
use crate::backoff::Backoff;
use crate::codec::{Frame, FrameDecoder, FrameKind};
use crate::config::TransportConfig;
use crate::error::TransportError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle phase of a room connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Syncing,
    Synced,
    Reconnecting,
    Closed,
}

/// Snapshot published on the connection status channel.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub connected: bool,
    /// Failed attempts since the last completed handshake.
    pub reconnect_attempt: u32,
    pub last_error: Option<TransportError>,
}

impl ConnectionState {
    pub(crate) fn new(status: ConnectionStatus, connected: bool) -> Self {
        Self {
            status,
            connected,
            reconnect_attempt: 0,
            last_error: None,
        }
    }
}

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct RoomAddress {
    /// WebSocket base URL of the relay.
    pub url: String,
    pub room: String,
    pub token: Option<String>,
}

impl RoomAddress {
    /// `{url}/{room}`, plus `?token=` when a token is set.
    pub fn endpoint(&self) -> String {
        let base = self.url.trim_end_matches('/');
        match &self.token {
            Some(token) => format!("{base}/{}?token={token}", self.room),
            None => format!("{base}/{}", self.room),
        }
    }
}

enum Command {
    Barrier(oneshot::Sender<()>),
}

thread_local! {
    /// Set while this thread runs a gated frame handler.
    static IN_HANDLER: Cell<bool> = const { Cell::new(false) };
}

struct HandlerGuard;

impl HandlerGuard {
    fn enter() -> Self {
        IN_HANDLER.with(|flag| flag.set(true));
        HandlerGuard
    }
}

impl Drop for HandlerGuard {
    fn drop(&mut self) {
        IN_HANDLER.with(|flag| flag.set(false));
    }
}

/// State shared between the handle and the connection task.
struct Shared {
    room: String,
    disposed: AtomicBool,
    /// Held while an inbound frame touches the document.
    handler_gate: Mutex<()>,
    state: watch::Sender<ConnectionState>,
}

impl Shared {
    fn new(room: String, disposed: bool, state: ConnectionState) -> Self {
        Self {
            room,
            disposed: AtomicBool::new(disposed),
            handler_gate: Mutex::new(()),
            state: watch::Sender::new(state),
        }
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Run `f` unless disposed. A concurrent [`Shared::dispose`] returns only
    /// after `f` has finished.
    fn unless_disposed<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let _gate = lock(&self.handler_gate);
        if self.is_disposed() {
            return None;
        }
        let _guard = HandlerGuard::enter();
        Some(f())
    }

    /// Returns `false` if already disposed.
    fn dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return false;
        }
        // Called from inside a handler (e.g. a change listener) there is
        // nothing to wait for and the gate is ours.
        if !IN_HANDLER.with(Cell::get) {
            drop(lock(&self.handler_gate));
        }
        true
    }

    fn set_status(&self, status: ConnectionStatus, connected: bool) {
        self.state.send_if_modified(|state| {
            if state.status == ConnectionStatus::Closed || state.status == status {
                return false;
            }
            log::debug!("Room {}: {:?} -> {:?}", self.room, state.status, status);
            state.status = status;
            state.connected = connected;
            true
        });
    }

    fn record_failure(&self, error: TransportError, attempt: u32) {
        self.state.send_if_modified(|state| {
            if state.status == ConnectionStatus::Closed {
                return false;
            }
            state.status = ConnectionStatus::Reconnecting;
            state.connected = false;
            state.reconnect_attempt = attempt;
            state.last_error = Some(error);
            true
        });
    }

    fn mark_synced(&self) {
        self.state.send_if_modified(|state| {
            if state.status == ConnectionStatus::Closed {
                return false;
            }
            state.status = ConnectionStatus::Synced;
            state.connected = true;
            state.reconnect_attempt = 0;
            true
        });
    }
}

/// Handle to a room connection task.
///
/// Must be created inside a tokio runtime. Dropping the handle destroys the
/// connection.
pub struct RoomTransport {
    shared: Arc<Shared>,
    shutdown: watch::Sender<bool>,
    commands: mpsc::UnboundedSender<Command>,
    subscription: Mutex<Option<UpdateSubscription>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl RoomTransport {
    /// Subscribe to local updates and start connecting.
    pub fn connect(
        address: RoomAddress,
        document: Arc<dyn SyncDocument>,
        awareness: AwarenessHandle,
        awareness_rx: mpsc::UnboundedReceiver<Vec<u8>>,
        config: TransportConfig,
    ) -> Result<Self, TransportError> {
        let (local_tx, local_rx) = mpsc::unbounded_channel();
        let subscription = document
            .observe_local_updates(Box::new(move |update| {
                let _ = local_tx.send(update.to_vec());
            }))
            .map_err(|e| TransportError::WebSocket(format!("cannot observe document: {e}")))?;

        let shared = Arc::new(Shared::new(
            address.room.clone(),
            false,
            ConnectionState::new(ConnectionStatus::Connecting, false),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let (commands, commands_rx) = mpsc::unbounded_channel();

        let task = ConnectionTask {
            shared: shared.clone(),
            address,
            document,
            awareness,
            config,
            shutdown: shutdown_rx,
            local_rx,
            awareness_rx,
            commands: commands_rx,
        };
        let handle = tokio::spawn(task.run());

        Ok(Self {
            shared,
            shutdown,
            commands,
            subscription: Mutex::new(Some(subscription)),
            task: Mutex::new(Some(handle)),
        })
    }

    pub fn room(&self) -> &str {
        &self.shared.room
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Receiver of every status change.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Wait until the handshake has completed. `false` on timeout or close.
    pub async fn wait_synced(&self, timeout: Duration) -> bool {
        let mut rx = self.subscribe();
        let reached = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| matches!(s.status, ConnectionStatus::Synced | ConnectionStatus::Closed)),
        )
        .await;
        matches!(reached, Ok(Ok(state)) if state.status == ConnectionStatus::Synced)
    }

    /// Resolve once the relay has answered a `SyncStep1` sent after every
    /// frame already queued on this connection.
    pub async fn barrier(&self, timeout: Duration) -> bool {
        if self.shared.is_disposed() {
            return false;
        }
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Barrier(tx)).is_err() {
            return false;
        }
        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())))
    }

    /// Stop the connection. Idempotent and synchronous: after it returns no
    /// update is applied or sent, and no reconnect timer fires.
    pub fn destroy(&self) {
        if !self.shared.dispose() {
            return;
        }
        self.shared.state.send_modify(|state| {
            state.status = ConnectionStatus::Closed;
            state.connected = false;
        });
        let _ = self.shutdown.send(true);
        drop(lock(&self.subscription).take());
        log::info!("Room {}: transport destroyed", self.shared.room);
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Wait for the connection task to exit (after `destroy`).
    pub async fn closed(&self) {
        let handle = lock(&self.task).take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}

impl Drop for RoomTransport {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for RoomTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoomTransport")
            .field("room", &self.shared.room)
            .field("state", &*self.shared.state.borrow())
            .finish()
    }
}

/// Everything the connection task owns.
struct ConnectionTask {
    shared: Arc<Shared>,
    address: RoomAddress,
    document: Arc<dyn SyncDocument>,
    awareness: AwarenessHandle,
    config: TransportConfig,
    shutdown: watch::Receiver<bool>,
    local_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    awareness_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    commands: mpsc::UnboundedReceiver<Command>,
}

/// Why a session ended.
enum SessionEnd {
    Shutdown,
    Failed(TransportError),
}

impl ConnectionTask {
    async fn run(mut self) {
        let endpoint = self.address.endpoint();
        let mut backoff = Backoff::new(self.config.backoff.clone());

        while !self.shared.is_disposed() {
            self.shared.set_status(ConnectionStatus::Connecting, false);
            let connect = tokio::time::timeout(
                self.config.connect_timeout,
                tokio_tungstenite::connect_async(endpoint.as_str()),
            );
            let attempt = tokio::select! {
                _ = self.shutdown.changed() => break,
                attempt = connect => attempt,
            };

            let error = match attempt {
                Ok(Ok((socket, _))) => {
                    log::info!("Room {}: connected to {}", self.address.room, self.address.url);
                    match self.session(socket, &mut backoff).await {
                        SessionEnd::Shutdown => break,
                        SessionEnd::Failed(e) => e,
                    }
                }
                Ok(Err(e)) => TransportError::Connect {
                    url: self.address.url.clone(),
                    reason: e.to_string(),
                },
                Err(_) => TransportError::Timeout(self.config.connect_timeout),
            };
            if self.shared.is_disposed() {
                break;
            }

            self.awareness.on_disconnect();
            let delay = backoff.next_delay();
            log::warn!(
                "Room {}: {error}; reconnecting in {delay:?} (attempt {})",
                self.address.room,
                backoff.attempt()
            );
            self.shared.record_failure(error, backoff.attempt());

            tokio::select! {
                _ = self.shutdown.changed() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.awareness.on_disconnect();
        log::debug!("Room {}: connection task finished", self.address.room);
    }

    /// Drive one connected socket until it fails or shutdown is signalled.
    async fn session(&mut self, socket: Socket, backoff: &mut Backoff) -> SessionEnd {
        let (mut sink, mut stream) = socket.split();
        let mut session = Session {
            shared: self.shared.clone(),
            document: self.document.clone(),
            awareness: self.awareness.clone(),
            decoder: FrameDecoder::new(self.config.max_frame_len),
            barriers: VecDeque::new(),
            decode_errors: 0,
            max_decode_errors: self.config.max_decode_errors,
            outbox: Vec::new(),
        };

        self.shared.set_status(ConnectionStatus::Open, true);

        // The handshake delivers everything these carried.
        let mut discarded = 0usize;
        while self.local_rx.try_recv().is_ok() {
            discarded += 1;
        }
        while self.awareness_rx.try_recv().is_ok() {}
        if discarded > 0 {
            log::debug!("Room {}: dropped {discarded} queued updates before handshake", self.address.room);
        }

        session.barriers.push_back(None);
        session.queue(Frame::sync_step1(self.document.state_vector()));
        if let Some(payload) = self.awareness.announce() {
            session.queue(Frame::awareness(payload));
        }
        if let Err(e) = session.flush(&mut sink).await {
            return SessionEnd::Failed(e);
        }
        self.shared.set_status(ConnectionStatus::Syncing, true);

        let liveness = self.config.liveness_timeout();
        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut last_received = Instant::now();

        let error = loop {
            let step = tokio::select! {
                biased;
                _ = self.shutdown.changed() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Shutdown;
                }
                message = stream.next() => match message {
                    None => Err(TransportError::Closed),
                    Some(Err(e)) => Err(e.into()),
                    Some(Ok(message)) => {
                        last_received = Instant::now();
                        match message {
                            Message::Binary(data) => session.handle_data(&data, backoff),
                            Message::Close(_) => Err(TransportError::Closed),
                            Message::Text(_) => {
                                log::warn!("Room {}: ignoring text message", self.address.room);
                                Ok(())
                            }
                            _ => Ok(()),
                        }
                    }
                },
                Some(update) = self.local_rx.recv() => {
                    session.queue(Frame::update(update));
                    Ok(())
                }
                Some(payload) = self.awareness_rx.recv() => {
                    session.queue(Frame::awareness(payload));
                    Ok(())
                }
                Some(command) = self.commands.recv() => match command {
                    Command::Barrier(done) => {
                        session.barriers.push_back(Some(done));
                        session.queue(Frame::sync_step1(self.document.state_vector()));
                        Ok(())
                    }
                },
                _ = heartbeat.tick() => {
                    if last_received.elapsed() > liveness {
                        Err(TransportError::Timeout(liveness))
                    } else {
                        if let Some(payload) = self.awareness.heartbeat() {
                            session.queue(Frame::awareness(payload));
                        }
                        if self.shared.is_disposed() {
                            Ok(())
                        } else {
                            sink.send(Message::Ping(Default::default())).await.map_err(Into::into)
                        }
                    }
                }
            };
            if let Err(e) = step {
                break e;
            }
            if let Err(e) = session.flush(&mut sink).await {
                break e;
            }
        };

        let _ = sink.close().await;
        SessionEnd::Failed(error)
    }
}

/// Per-connection protocol state.
struct Session {
    shared: Arc<Shared>,
    document: Arc<dyn SyncDocument>,
    awareness: AwarenessHandle,
    decoder: FrameDecoder,
    /// One entry per `SyncStep1` we sent; `None` is the handshake.
    barriers: VecDeque<Option<oneshot::Sender<()>>>,
    decode_errors: u32,
    max_decode_errors: u32,
    outbox: Vec<Frame>,
}

impl Session {
    fn queue(&mut self, frame: Frame) {
        self.outbox.push(frame);
    }

    async fn flush<S>(&mut self, sink: &mut S) -> Result<(), TransportError>
    where
        S: futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
    {
        if self.shared.is_disposed() {
            self.outbox.clear();
            return Ok(());
        }
        for frame in self.outbox.drain(..) {
            sink.send(Message::binary(frame.encode())).await?;
        }
        Ok(())
    }

    fn handle_data(&mut self, data: &[u8], backoff: &mut Backoff) -> Result<(), TransportError> {
        self.decoder.push(data);
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => self.handle_frame(frame, backoff)?,
                Ok(None) => return Ok(()),
                Err(e) => {
                    self.decode_failed(&e)?;
                    return Ok(());
                }
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame, backoff: &mut Backoff) -> Result<(), TransportError> {
        let shared = self.shared.clone();
        shared
            .unless_disposed(|| self.dispatch(frame, backoff))
            .unwrap_or(Ok(()))
    }

    fn dispatch(&mut self, frame: Frame, backoff: &mut Backoff) -> Result<(), TransportError> {
        let room = self.shared.room.clone();
        match frame.kind {
            FrameKind::SyncStep1 => match self.document.encode_state_as_update(Some(&frame.payload)) {
                Ok(diff) => {
                    self.decode_errors = 0;
                    self.queue(Frame::sync_step2(diff));
                }
                Err(e) => self.decode_failed(&e)?,
            },
            FrameKind::SyncStep2 => {
                let applied = self.document.apply_update(&frame.payload);
                match self.barriers.pop_front() {
                    Some(None) => {
                        if let Err(e) = applied {
                            log::warn!("Room {room}: handshake answer rejected: {e}");
                            return Err(TransportError::WebSocket(format!("invalid handshake: {e}")));
                        }
                        backoff.reset();
                        self.shared.mark_synced();
                        log::info!("Room {room}: synced");
                    }
                    Some(Some(done)) => {
                        let _ = done.send(());
                    }
                    None => log::debug!("Room {room}: unsolicited SyncStep2"),
                }
                match applied {
                    Ok(()) => self.decode_errors = 0,
                    Err(e) => self.decode_failed(&e)?,
                }
            }
            FrameKind::Update => match self.document.apply_update(&frame.payload) {
                Ok(()) => self.decode_errors = 0,
                Err(e) => self.decode_failed(&e)?,
            },
            FrameKind::Awareness => match self.awareness.apply_remote(&frame.payload) {
                Ok(()) => self.decode_errors = 0,
                Err(e) => self.decode_failed(&e)?,
            },
            FrameKind::Auth => {
                if let Some(reason) = frame.denial_reason() {
                    return Err(TransportError::PermissionDenied(reason));
                }
            }
        }
        Ok(())
    }

    fn decode_failed(&mut self, error: &dyn std::fmt::Display) -> Result<(), TransportError> {
        self.decode_errors += 1;
        log::warn!(
            "Room {}: dropping undecodable frame ({} in a row): {error}",
            self.shared.room,
            self.decode_errors
        );
        if self.decode_errors > self.max_decode_errors {
            return Err(TransportError::Corrupted(self.decode_errors));
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint() {
        let mut address = RoomAddress {
            url: "ws://relay:9090/".to_string(),
            room: "doc-42".to_string(),
            token: None,
        };
        assert_eq!(address.endpoint(), "ws://relay:9090/doc-42");
        address.token = Some("abc".to_string());
        assert_eq!(address.endpoint(), "ws://relay:9090/doc-42?token=abc");
    }

    #[test]
    fn test_closed_is_terminal() {
        let shared = Shared::new(
            "r".to_string(),
            true,
            ConnectionState::new(ConnectionStatus::Closed, false),
        );
        shared.set_status(ConnectionStatus::Connecting, false);
        shared.mark_synced();
        shared.record_failure(TransportError::Closed, 3);
        assert_eq!(shared.state.borrow().status, ConnectionStatus::Closed);
        assert_eq!(shared.state.borrow().last_error, None);
    }

    #[test]
    fn test_failure_records_attempt() {
        let shared = Shared::new(
            "r".to_string(),
            false,
            ConnectionState::new(ConnectionStatus::Synced, true),
        );
        shared.record_failure(TransportError::Timeout(Duration::from_secs(1)), 2);
        let state = shared.state.borrow().clone();
        assert_eq!(state.status, ConnectionStatus::Reconnecting);
        assert!(!state.connected);
        assert_eq!(state.reconnect_attempt, 2);

        shared.mark_synced();
        assert_eq!(shared.state.borrow().reconnect_attempt, 0);
    }

    #[test]
    fn test_gated_handler_skipped_after_dispose() {
        let shared = Shared::new("r".to_string(), false, ConnectionState::new(ConnectionStatus::Synced, true));
        assert_eq!(shared.unless_disposed(|| 1), Some(1));

        // Disposing from inside a handler must not deadlock.
        assert_eq!(shared.unless_disposed(|| shared.dispose()), Some(true));
        assert!(!shared.dispose());
        assert_eq!(shared.unless_disposed(|| 2), None);
    }
}
