//! First-writer arbitration for rooms without persisted content.
//!
//! Exactly one client may seed a fresh room. The relay hands out a single
//! lock token per room; the holder re-checks the initialized marker, seeds,
//! waits for the relay to acknowledge the seed, marks the room initialized
//! and always releases the lock. Everyone else follows the room through the
//! normal sync handshake.
//!
//! A grant is a lease. The relay reclaims it once it goes unrenewed for the
//! lease period, which only happens when the holder vanished: a live holder
//! renews every `lock_renew_interval` for as long as it holds the lock, and
//! confirms the lease right before seeding and right before marking. A holder
//! that finds its lease gone follows instead.
//!
//! ```text
//! initialized? ──yes──► AlreadyInitialized
//!      │no
//! acquire ──contention──► Follower
//!      │  └──timeout───► Deferred (retried after reconnect)
//! initialized? ──yes──► Follower           ┐
//! wait synced ──no───► Deferred            │ lock held and renewed,
//! lease lost? ──yes──► Follower            │ always released
//! seed ──panic/error──► Follower           │
//! barrier                                  │
//! lease lost? ──yes──► Follower            │
//! mark initialized ──► Seeded              ┘
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::error::LockError;
use crate::provider::DocumentProvider;
use crate::store::RoomStore;

/// Lease after which the relay reclaims a lock whose holder vanished.
pub const DEFAULT_LOCK_LEASE: Duration = Duration::from_secs(30);

/// How often a holder renews its lease; a third of the default lease.
pub const DEFAULT_LOCK_RENEW_INTERVAL: Duration = Duration::from_secs(10);

/// Proof of holding a room lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockToken(pub u64);

impl fmt::Display for LockToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Body of a successful `POST /rooms/{guid}/lock`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockGrant {
    pub token: LockToken,
}

/// The relay's lock and initialized-marker surface.
#[async_trait]
pub trait LockApi: Send + Sync {
    async fn is_initialized(&self, room: &str) -> Result<bool, LockError>;

    /// Take the room lock. `LockError::Contention` if someone holds it.
    async fn acquire(&self, room: &str) -> Result<LockToken, LockError>;

    async fn release(&self, room: &str, token: LockToken) -> Result<(), LockError>;

    /// Restart the lease of a held lock. `LockError::NotHeld` once it was
    /// released or reclaimed.
    async fn renew(&self, room: &str, token: LockToken) -> Result<(), LockError>;

    /// Idempotent.
    async fn mark_initialized(&self, room: &str) -> Result<(), LockError>;
}

#[derive(Debug, Default)]
struct RoomLockState {
    holder: Option<(LockToken, Instant)>,
    initialized: bool,
}

/// In-process lock arbiter, used by the relay behind its REST surface.
#[derive(Debug)]
pub struct RoomLocks {
    rooms: Mutex<HashMap<String, RoomLockState>>,
    lease: Duration,
    store: Option<Arc<RoomStore>>,
}

impl Default for RoomLocks {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_LEASE)
    }
}

impl RoomLocks {
    pub fn new(lease: Duration) -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
            lease,
            store: None,
        }
    }

    /// Persist initialized markers through `store`.
    pub fn with_store(mut self, store: Arc<RoomStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn lease(&self) -> Duration {
        self.lease
    }

    pub fn try_acquire(&self, room: &str) -> Result<LockToken, LockError> {
        self.try_acquire_at(room, Instant::now())
    }

    fn try_acquire_at(&self, room: &str, now: Instant) -> Result<LockToken, LockError> {
        let mut rooms = self.rooms();
        let state = rooms.entry(room.to_string()).or_default();
        if let Some((token, acquired_at)) = state.holder {
            if now.saturating_duration_since(acquired_at) < self.lease {
                return Err(LockError::Contention(room.to_string()));
            }
            log::warn!("Reclaiming expired lock {token} on room {room}");
        }
        let token = LockToken(rand::random());
        state.holder = Some((token, now));
        log::debug!("Lock {token} granted on room {room}");
        Ok(token)
    }

    pub fn try_release(&self, room: &str, token: LockToken) -> Result<(), LockError> {
        let mut rooms = self.rooms();
        match rooms.get_mut(room) {
            Some(state) if state.holder.is_some_and(|(held, _)| held == token) => {
                state.holder = None;
                log::debug!("Lock {token} released on room {room}");
                Ok(())
            }
            _ => Err(LockError::NotHeld {
                room: room.to_string(),
                token: token.0,
            }),
        }
    }

    pub fn try_renew(&self, room: &str, token: LockToken) -> Result<(), LockError> {
        self.try_renew_at(room, token, Instant::now())
    }

    /// A lease that ran out is still renewable until someone reclaims it.
    fn try_renew_at(&self, room: &str, token: LockToken, now: Instant) -> Result<(), LockError> {
        let mut rooms = self.rooms();
        match rooms.get_mut(room).and_then(|state| state.holder.as_mut()) {
            Some((held, acquired_at)) if *held == token => {
                *acquired_at = now;
                log::trace!("Lock {token} renewed on room {room}");
                Ok(())
            }
            _ => Err(LockError::NotHeld {
                room: room.to_string(),
                token: token.0,
            }),
        }
    }

    pub fn initialized(&self, room: &str) -> Result<bool, LockError> {
        if self.rooms().get(room).is_some_and(|s| s.initialized) {
            return Ok(true);
        }
        match &self.store {
            Some(store) => Ok(store.is_initialized(room)?),
            None => Ok(false),
        }
    }

    pub fn set_initialized(&self, room: &str) -> Result<(), LockError> {
        if let Some(store) = &self.store {
            store.mark_initialized(room)?;
        }
        self.rooms().entry(room.to_string()).or_default().initialized = true;
        Ok(())
    }

    /// Whether a live (unexpired) lock is held on `room`.
    pub fn is_locked(&self, room: &str) -> bool {
        self.rooms()
            .get(room)
            .and_then(|s| s.holder)
            .is_some_and(|(_, at)| at.elapsed() < self.lease)
    }

    fn rooms(&self) -> MutexGuard<'_, HashMap<String, RoomLockState>> {
        self.rooms.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl LockApi for RoomLocks {
    async fn is_initialized(&self, room: &str) -> Result<bool, LockError> {
        self.initialized(room)
    }

    async fn acquire(&self, room: &str) -> Result<LockToken, LockError> {
        self.try_acquire(room)
    }

    async fn release(&self, room: &str, token: LockToken) -> Result<(), LockError> {
        self.try_release(room, token)
    }

    async fn renew(&self, room: &str, token: LockToken) -> Result<(), LockError> {
        self.try_renew(room, token)
    }

    async fn mark_initialized(&self, room: &str) -> Result<(), LockError> {
        self.set_initialized(room)
    }
}

/// `LockApi` over the relay's REST surface.
#[derive(Debug, Clone)]
pub struct HttpLockClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpLockClient {
    /// Every request is bounded by `timeout`.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, LockError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| LockError::Http(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn room_url(&self, room: &str) -> String {
        format!("{}/rooms/{room}", self.base_url)
    }
}

fn request_error(room: &str, error: reqwest::Error) -> LockError {
    if error.is_timeout() {
        LockError::Timeout(room.to_string())
    } else {
        LockError::Http(error.to_string())
    }
}

fn unexpected_status(status: StatusCode) -> LockError {
    LockError::Http(format!("unexpected status {status}"))
}

#[async_trait]
impl LockApi for HttpLockClient {
    async fn is_initialized(&self, room: &str) -> Result<bool, LockError> {
        let response = self
            .client
            .get(format!("{}/initialized", self.room_url(room)))
            .send()
            .await
            .map_err(|e| request_error(room, e))?;
        if !response.status().is_success() {
            return Err(unexpected_status(response.status()));
        }
        response.json::<bool>().await.map_err(|e| request_error(room, e))
    }

    async fn acquire(&self, room: &str) -> Result<LockToken, LockError> {
        let response = self
            .client
            .post(format!("{}/lock", self.room_url(room)))
            .send()
            .await
            .map_err(|e| request_error(room, e))?;
        match response.status() {
            StatusCode::CONFLICT => Err(LockError::Contention(room.to_string())),
            status if status.is_success() => {
                let grant: LockGrant = response.json().await.map_err(|e| request_error(room, e))?;
                Ok(grant.token)
            }
            status => Err(unexpected_status(status)),
        }
    }

    async fn release(&self, room: &str, token: LockToken) -> Result<(), LockError> {
        let response = self
            .client
            .delete(format!("{}/lock/{token}", self.room_url(room)))
            .send()
            .await
            .map_err(|e| request_error(room, e))?;
        match response.status() {
            StatusCode::CONFLICT => Err(LockError::NotHeld {
                room: room.to_string(),
                token: token.0,
            }),
            status if status.is_success() => Ok(()),
            status => Err(unexpected_status(status)),
        }
    }

    async fn renew(&self, room: &str, token: LockToken) -> Result<(), LockError> {
        let response = self
            .client
            .put(format!("{}/lock/{token}", self.room_url(room)))
            .send()
            .await
            .map_err(|e| request_error(room, e))?;
        match response.status() {
            StatusCode::CONFLICT => Err(LockError::NotHeld {
                room: room.to_string(),
                token: token.0,
            }),
            status if status.is_success() => Ok(()),
            status => Err(unexpected_status(status)),
        }
    }

    async fn mark_initialized(&self, room: &str) -> Result<(), LockError> {
        let response = self
            .client
            .put(format!("{}/initialized", self.room_url(room)))
            .send()
            .await
            .map_err(|e| request_error(room, e))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(unexpected_status(response.status()))
        }
    }
}

/// Why a client did not seed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowReason {
    /// Another client holds the lock.
    Contention,
    /// The room became initialized while we were acquiring.
    InitializedUnderLock,
    /// The seed function failed or panicked.
    SeedFailed(String),
    /// The relay reclaimed our lease before we marked the room.
    LeaseLost,
    /// The lock surface failed for another reason.
    LockUnavailable(String),
}

/// Result of [`initialize_room`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitOutcome {
    AlreadyInitialized,
    Seeded,
    Follower(FollowReason),
    /// The lock request timed out or the first handshake did not complete.
    Deferred,
    Disposed,
}

/// Error a seed function may report.
pub type SeedError = Box<dyn std::error::Error + Send + Sync>;

/// Writes the initial content into the document. May run again after a
/// deferred attempt, but never after a successful one.
pub type SeedFn = Arc<dyn Fn() -> Result<(), SeedError> + Send + Sync>;

/// Run the initialization protocol once against `provider`.
///
/// Never fails: every error ends in an outcome and a log line.
pub async fn initialize_room<P>(provider: &P, seed: &SeedFn) -> InitOutcome
where
    P: DocumentProvider + ?Sized,
{
    let room = provider.room().to_string();
    if provider.is_destroyed() {
        return InitOutcome::Disposed;
    }
    if provider.request_initial_content().await {
        log::debug!("Room {room} already initialized, following");
        return InitOutcome::AlreadyInitialized;
    }

    let token = match provider.acquire_lock().await {
        Ok(token) => token,
        Err(LockError::Contention(_)) => {
            log::info!("Room {room} is being seeded by another client");
            return InitOutcome::Follower(FollowReason::Contention);
        }
        Err(LockError::Timeout(_)) => {
            log::warn!("Lock request for room {room} timed out, retrying after reconnect");
            return InitOutcome::Deferred;
        }
        Err(LockError::Disposed) => return InitOutcome::Disposed,
        Err(e) => {
            log::warn!("Cannot lock room {room}: {e}");
            return InitOutcome::Follower(FollowReason::LockUnavailable(e.to_string()));
        }
    };

    let outcome = tokio::select! {
        outcome = seed_under_lock(provider, &room, token, seed) => outcome,
        reason = hold_lease(provider, &room, token) => reason,
    };

    if let Err(e) = provider.release_lock(token).await {
        log::warn!("Failed to release lock {token} on room {room}: {e}");
    }
    outcome
}

/// Renew `token` until the lease is lost. Transient failures are retried on
/// the next tick; the relay only reclaims after a full unrenewed lease.
async fn hold_lease<P>(provider: &P, room: &str, token: LockToken) -> InitOutcome
where
    P: DocumentProvider + ?Sized,
{
    let period = provider.lock_renew_interval().max(Duration::from_millis(1));
    let mut ticks = tokio::time::interval(period);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticks.tick().await;
    loop {
        ticks.tick().await;
        match provider.renew_lock(token).await {
            Ok(()) => {}
            Err(LockError::Disposed) => return InitOutcome::Disposed,
            Err(LockError::NotHeld { .. }) => {
                log::warn!("Lost lock {token} on room {room} while holding it");
                return InitOutcome::Follower(FollowReason::LeaseLost);
            }
            Err(e) => log::warn!("Failed to renew lock {token} on room {room}: {e}"),
        }
    }
}

/// `None` while `token` is still ours. Any doubt counts as lost.
async fn confirm_lease<P>(provider: &P, room: &str, token: LockToken) -> Option<InitOutcome>
where
    P: DocumentProvider + ?Sized,
{
    match provider.renew_lock(token).await {
        Ok(()) => None,
        Err(LockError::Disposed) => Some(InitOutcome::Disposed),
        Err(LockError::NotHeld { .. }) => {
            log::warn!("Lock {token} on room {room} was reclaimed, following");
            Some(InitOutcome::Follower(FollowReason::LeaseLost))
        }
        Err(e) => {
            log::warn!("Cannot confirm lock {token} on room {room}: {e}");
            Some(InitOutcome::Follower(FollowReason::LockUnavailable(e.to_string())))
        }
    }
}

async fn seed_under_lock<P>(provider: &P, room: &str, token: LockToken, seed: &SeedFn) -> InitOutcome
where
    P: DocumentProvider + ?Sized,
{
    if provider.request_initial_content().await {
        return InitOutcome::Follower(FollowReason::InitializedUnderLock);
    }
    if !provider.wait_synced(provider.sync_timeout()).await {
        if provider.is_destroyed() {
            return InitOutcome::Disposed;
        }
        log::warn!("Room {room} did not sync in time, deferring initialization");
        return InitOutcome::Deferred;
    }
    if provider.is_destroyed() {
        return InitOutcome::Disposed;
    }
    if let Some(outcome) = confirm_lease(provider, room, token).await {
        return outcome;
    }

    // `hold_lease` keeps ticking while the seed runs on the blocking pool.
    let seed = seed.clone();
    let failure = match tokio::task::spawn_blocking(move || seed()).await {
        Ok(Ok(())) => None,
        Ok(Err(e)) => Some(e.to_string()),
        Err(e) if e.is_panic() => Some(panic_message(&*e.into_panic())),
        Err(e) => Some(e.to_string()),
    };
    if let Some(reason) = failure {
        log::error!("Seeding room {room} failed: {reason}");
        return InitOutcome::Follower(FollowReason::SeedFailed(reason));
    }

    if !provider.barrier(provider.sync_timeout()).await {
        log::warn!("Relay did not acknowledge the seed of room {room}; the next handshake delivers it");
    }
    // The content is in the document by now; only proof that the lease
    // moved on stops the marking.
    if let Err(e @ LockError::NotHeld { .. }) = provider.renew_lock(token).await {
        log::warn!("Seeded room {room} but not marking it: {e}");
        return InitOutcome::Follower(FollowReason::LeaseLost);
    }
    if let Err(e) = provider.put_initialized_state().await {
        log::warn!("Failed to mark room {room} initialized: {e}");
    }
    log::info!("Seeded room {room}");
    InitOutcome::Seeded
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "seed panicked".to_string()
    }
}
