//! Provider factory and lifecycle.
//!
//! Editor code holds a `Box<dyn DocumentProvider>` and never learns whether it
//! is networked. [`create_provider`] is the only place that looks at
//! `CollabConfig::collaborative`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use docsync_core::SyncDocument;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::awareness::AwarenessHandle;
use crate::config::CollabConfig;
use crate::error::{LockError, ProviderError};
use crate::lock::{
    initialize_room, HttpLockClient, InitOutcome, LockApi, LockToken, SeedFn, DEFAULT_LOCK_RENEW_INTERVAL,
};
use crate::transport::{ConnectionState, ConnectionStatus, RoomAddress, RoomTransport};

/// What the document context passes when opening a document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOptions {
    /// WebSocket base URL of the relay.
    pub url: String,
    pub room: String,
    pub token: Option<String>,
}

impl ProviderOptions {
    pub fn new(url: impl Into<String>, room: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            room: room.into(),
            token: None,
        }
    }

    /// Relay URL and token taken from `config`.
    pub fn from_config(config: &CollabConfig, room: impl Into<String>) -> Self {
        Self {
            url: config.server_url.clone(),
            room: room.into(),
            token: config.token.clone(),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }
}

/// Per-document synchronization provider.
#[async_trait]
pub trait DocumentProvider: Send + Sync {
    fn room(&self) -> &str;

    /// Status signal for UI display.
    fn connection_status(&self) -> watch::Receiver<ConnectionState>;

    fn awareness(&self) -> &AwarenessHandle;

    /// Upper bound for the waits inside [`DocumentProvider::initialize`].
    fn sync_timeout(&self) -> Duration;

    /// `true` if the room already has content (or we cannot tell).
    async fn request_initial_content(&self) -> bool;

    async fn acquire_lock(&self) -> Result<LockToken, LockError>;

    /// Mark the room initialized. Idempotent.
    async fn put_initialized_state(&self) -> Result<(), LockError>;

    async fn release_lock(&self, token: LockToken) -> Result<(), LockError>;

    /// Restart the lease of a held lock.
    async fn renew_lock(&self, _token: LockToken) -> Result<(), LockError> {
        Ok(())
    }

    /// Period at which a held lock is renewed.
    fn lock_renew_interval(&self) -> Duration {
        DEFAULT_LOCK_RENEW_INTERVAL
    }

    /// Wait for the first handshake. `false` on timeout or destroy.
    async fn wait_synced(&self, timeout: Duration) -> bool;

    /// Wait until the relay has processed everything sent so far.
    async fn barrier(&self, timeout: Duration) -> bool;

    /// Seed the room if nobody else has; see [`initialize_room`].
    async fn initialize(&self, seed: SeedFn) -> InitOutcome {
        initialize_room(self, &seed).await
    }

    /// Stop relaying in both directions. Runs its effect once.
    fn destroy(&self);

    fn is_destroyed(&self) -> bool;
}

/// Pick the networked or the local provider for `document`.
///
/// Must be called inside a tokio runtime when `config.collaborative` is set.
pub fn create_provider(
    config: &CollabConfig,
    options: ProviderOptions,
    document: Arc<dyn SyncDocument>,
) -> Result<Box<dyn DocumentProvider>, ProviderError> {
    if config.collaborative {
        log::info!("Opening room {} on {}", options.room, options.url);
        Ok(Box::new(NetworkProvider::connect(config, options, document)?))
    } else {
        log::debug!("Opening room {} in local mode", options.room);
        Ok(Box::new(LocalProvider::new(options.room, config.transport.awareness_timeout())))
    }
}

fn new_client_id() -> u64 {
    u64::from(rand::random::<u32>())
}

// ─── Local ────────────────────────────────────────────────────────────

/// Single-user offline provider: no transport, content always "exists".
pub struct LocalProvider {
    room: String,
    awareness: AwarenessHandle,
    status: watch::Sender<ConnectionState>,
    destroyed: AtomicBool,
}

impl LocalProvider {
    pub fn new(room: impl Into<String>, awareness_timeout: Duration) -> Self {
        let (awareness, _outbound) = AwarenessHandle::new(new_client_id(), awareness_timeout);
        Self {
            room: room.into(),
            awareness,
            status: watch::Sender::new(ConnectionState::new(ConnectionStatus::Synced, false)),
            destroyed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl DocumentProvider for LocalProvider {
    fn room(&self) -> &str {
        &self.room
    }

    fn connection_status(&self) -> watch::Receiver<ConnectionState> {
        self.status.subscribe()
    }

    fn awareness(&self) -> &AwarenessHandle {
        &self.awareness
    }

    fn sync_timeout(&self) -> Duration {
        Duration::ZERO
    }

    async fn request_initial_content(&self) -> bool {
        true
    }

    async fn acquire_lock(&self) -> Result<LockToken, LockError> {
        if self.is_destroyed() {
            return Err(LockError::Disposed);
        }
        Ok(LockToken(0))
    }

    async fn put_initialized_state(&self) -> Result<(), LockError> {
        Ok(())
    }

    async fn release_lock(&self, _token: LockToken) -> Result<(), LockError> {
        Ok(())
    }

    async fn wait_synced(&self, _timeout: Duration) -> bool {
        !self.is_destroyed()
    }

    async fn barrier(&self, _timeout: Duration) -> bool {
        !self.is_destroyed()
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.status.send_modify(|s| s.status = ConnectionStatus::Closed);
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl Drop for LocalProvider {
    fn drop(&mut self) {
        self.destroy();
    }
}

// ─── Network ──────────────────────────────────────────────────────────

/// Provider relaying a document through the relay server.
pub struct NetworkProvider {
    session: Arc<NetworkSession>,
}

impl NetworkProvider {
    /// Open the room transport and an HTTP lock client from `config`.
    pub fn connect(
        config: &CollabConfig,
        options: ProviderOptions,
        document: Arc<dyn SyncDocument>,
    ) -> Result<Self, ProviderError> {
        let locks = HttpLockClient::new(&config.lock_api_url, config.lock_request_timeout)?;
        Self::with_lock_api(config, options, document, Arc::new(locks))
    }

    /// Like [`NetworkProvider::connect`], arbitrating through `locks`.
    pub fn with_lock_api(
        config: &CollabConfig,
        options: ProviderOptions,
        document: Arc<dyn SyncDocument>,
        locks: Arc<dyn LockApi>,
    ) -> Result<Self, ProviderError> {
        let (awareness, awareness_rx) =
            AwarenessHandle::new(new_client_id(), config.transport.awareness_timeout());
        let address = RoomAddress {
            url: options.url,
            room: options.room.clone(),
            token: options.token,
        };
        let transport = RoomTransport::connect(
            address,
            document,
            awareness.clone(),
            awareness_rx,
            config.transport.clone(),
        )?;

        Ok(Self {
            session: Arc::new(NetworkSession {
                room: options.room,
                transport,
                awareness,
                locks,
                sync_timeout: config.sync_timeout,
                lock_renew_interval: config.lock_renew_interval,
                destroyed: AtomicBool::new(false),
                retry: Mutex::new(None),
            }),
        })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.session.transport.state()
    }

    /// Resolves once the connection task has exited after [`DocumentProvider::destroy`].
    pub async fn closed(&self) {
        self.session.closed().await;
    }
}

#[async_trait]
impl DocumentProvider for NetworkProvider {
    fn room(&self) -> &str {
        self.session.room()
    }

    fn connection_status(&self) -> watch::Receiver<ConnectionState> {
        self.session.connection_status()
    }

    fn awareness(&self) -> &AwarenessHandle {
        self.session.awareness()
    }

    fn sync_timeout(&self) -> Duration {
        self.session.sync_timeout()
    }

    async fn request_initial_content(&self) -> bool {
        self.session.request_initial_content().await
    }

    async fn acquire_lock(&self) -> Result<LockToken, LockError> {
        self.session.acquire_lock().await
    }

    async fn put_initialized_state(&self) -> Result<(), LockError> {
        self.session.put_initialized_state().await
    }

    async fn release_lock(&self, token: LockToken) -> Result<(), LockError> {
        self.session.release_lock(token).await
    }

    async fn renew_lock(&self, token: LockToken) -> Result<(), LockError> {
        self.session.renew_lock(token).await
    }

    fn lock_renew_interval(&self) -> Duration {
        self.session.lock_renew_interval()
    }

    async fn wait_synced(&self, timeout: Duration) -> bool {
        self.session.wait_synced(timeout).await
    }

    async fn barrier(&self, timeout: Duration) -> bool {
        self.session.barrier(timeout).await
    }

    /// Deferred outcomes are retried in the background after each reconnect
    /// until the protocol settles or the provider is destroyed.
    async fn initialize(&self, seed: SeedFn) -> InitOutcome {
        let outcome = initialize_room(&*self.session, &seed).await;
        if outcome == InitOutcome::Deferred {
            NetworkSession::schedule_retry(&self.session, seed);
        }
        outcome
    }

    fn destroy(&self) {
        self.session.destroy();
    }

    fn is_destroyed(&self) -> bool {
        self.session.is_destroyed()
    }
}

impl Drop for NetworkProvider {
    fn drop(&mut self) {
        self.session.destroy();
    }
}

impl std::fmt::Debug for NetworkProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkProvider")
            .field("room", &self.session.room)
            .field("destroyed", &self.session.is_destroyed())
            .finish()
    }
}

/// Shared with the deferred-initialization task.
struct NetworkSession {
    room: String,
    transport: RoomTransport,
    awareness: AwarenessHandle,
    locks: Arc<dyn LockApi>,
    sync_timeout: Duration,
    lock_renew_interval: Duration,
    destroyed: AtomicBool,
    retry: Mutex<Option<JoinHandle<()>>>,
}

impl NetworkSession {
    fn schedule_retry(session: &Arc<Self>, seed: SeedFn) {
        let task_session = session.clone();
        let handle = tokio::spawn(async move {
            let session = task_session;
            let mut after_loss = false;
            while session.wait_retry_due(after_loss).await {
                match initialize_room(&*session, &seed).await {
                    InitOutcome::Deferred => after_loss = true,
                    outcome => {
                        log::info!("Deferred initialization of room {} finished: {outcome:?}", session.room);
                        return;
                    }
                }
            }
        });

        let mut retry = session.retry.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(previous) = retry.replace(handle) {
            previous.abort();
        }
        if session.is_destroyed() {
            if let Some(handle) = retry.take() {
                handle.abort();
            }
        }
    }

    /// Wait until the transport is synced. With `after_loss`, a transport
    /// that is synced right now has to drop and complete a fresh handshake
    /// first. `false` once the transport is closed.
    async fn wait_retry_due(&self, after_loss: bool) -> bool {
        let mut rx = self.transport.subscribe();
        let current = rx.borrow_and_update().status;
        if after_loss && current == ConnectionStatus::Synced {
            let lost = rx
                .wait_for(|s| s.status != ConnectionStatus::Synced)
                .await
                .map(|s| s.status);
            if !matches!(lost, Ok(status) if status != ConnectionStatus::Closed) {
                return false;
            }
        }
        let reached = rx
            .wait_for(|s| matches!(s.status, ConnectionStatus::Synced | ConnectionStatus::Closed))
            .await
            .map(|s| s.status);
        matches!(reached, Ok(ConnectionStatus::Synced))
    }

    async fn closed(&self) {
        self.transport.closed().await;
    }
}

#[async_trait]
impl DocumentProvider for NetworkSession {
    fn room(&self) -> &str {
        &self.room
    }

    fn connection_status(&self) -> watch::Receiver<ConnectionState> {
        self.transport.subscribe()
    }

    fn awareness(&self) -> &AwarenessHandle {
        &self.awareness
    }

    fn sync_timeout(&self) -> Duration {
        self.sync_timeout
    }

    async fn request_initial_content(&self) -> bool {
        if self.is_destroyed() {
            return true;
        }
        match self.locks.is_initialized(&self.room).await {
            Ok(initialized) => initialized,
            Err(e) => {
                log::warn!("Cannot tell whether room {} has content, assuming it does: {e}", self.room);
                true
            }
        }
    }

    async fn acquire_lock(&self) -> Result<LockToken, LockError> {
        if self.is_destroyed() {
            return Err(LockError::Disposed);
        }
        self.locks.acquire(&self.room).await
    }

    async fn put_initialized_state(&self) -> Result<(), LockError> {
        self.locks.mark_initialized(&self.room).await
    }

    async fn release_lock(&self, token: LockToken) -> Result<(), LockError> {
        self.locks.release(&self.room, token).await
    }

    async fn renew_lock(&self, token: LockToken) -> Result<(), LockError> {
        if self.is_destroyed() {
            return Err(LockError::Disposed);
        }
        self.locks.renew(&self.room, token).await
    }

    fn lock_renew_interval(&self) -> Duration {
        self.lock_renew_interval
    }

    async fn wait_synced(&self, timeout: Duration) -> bool {
        !self.is_destroyed() && self.transport.wait_synced(timeout).await
    }

    async fn barrier(&self, timeout: Duration) -> bool {
        !self.is_destroyed() && self.transport.barrier(timeout).await
    }

    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.transport.destroy();
        let retry = self.retry.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(handle) = retry {
            handle.abort();
        }
        log::info!("Provider for room {} destroyed", self.room);
    }

    fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::SeedError;
    use docsync_core::SharedDocument;

    #[tokio::test]
    async fn test_local_provider_contract() {
        let provider = LocalProvider::new("notes.md", Duration::from_secs(15));
        assert!(provider.request_initial_content().await);
        assert!(provider.wait_synced(Duration::from_millis(1)).await);

        let status = provider.connection_status();
        assert_eq!(status.borrow().status, ConnectionStatus::Synced);
        assert!(!status.borrow().connected);

        let seeded = Arc::new(AtomicBool::new(false));
        let flag = seeded.clone();
        let outcome = provider
            .initialize(Arc::new(move || -> Result<(), SeedError> {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            }))
            .await;
        assert_eq!(outcome, InitOutcome::AlreadyInitialized);
        assert!(!seeded.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_local_provider_destroy_once() {
        let provider = LocalProvider::new("r", Duration::from_secs(15));
        let status = provider.connection_status();
        provider.destroy();
        provider.destroy();
        assert!(provider.is_destroyed());
        assert_eq!(status.borrow().status, ConnectionStatus::Closed);
        assert_eq!(provider.acquire_lock().await, Err(LockError::Disposed));
        assert_eq!(provider.initialize(Arc::new(|| -> Result<(), SeedError> { Ok(()) })).await, InitOutcome::Disposed);
    }

    #[tokio::test]
    async fn test_factory_respects_flag() {
        let document = Arc::new(SharedDocument::new("r"));
        let config = CollabConfig::default();
        let provider = create_provider(&config, ProviderOptions::new("ws://unused", "r"), document).unwrap();
        assert!(!provider.connection_status().borrow().connected);
        assert!(provider.request_initial_content().await);
    }

    #[test]
    fn test_options_from_config() {
        let config = CollabConfig {
            token: Some("t".to_string()),
            ..CollabConfig::for_testing(1, 2)
        };
        let options = ProviderOptions::from_config(&config, "doc-42");
        assert_eq!(options.url, "ws://127.0.0.1:1");
        assert_eq!(options.token.as_deref(), Some("t"));
        assert_eq!(ProviderOptions::new("u", "r").with_token("x").token.as_deref(), Some("x"));
    }
}
