//! The narrow seam between a CRDT document and whatever relays its updates.
//!
//! A provider never reaches into document internals. It reads the state
//! vector, encodes deltas, applies remote deltas and listens for locally
//! originated updates. Nothing else.

use crate::error::DocumentError;

/// Callback receiving one locally originated, v1-encoded update.
pub type LocalUpdateFn = Box<dyn Fn(&[u8]) + Send + Sync>;

/// Keeps a local-update observer registered. Dropping it unsubscribes.
pub struct UpdateSubscription {
    inner: Option<yrs::Subscription>,
}

impl UpdateSubscription {
    pub(crate) fn new(inner: yrs::Subscription) -> Self {
        Self { inner: Some(inner) }
    }

    /// A subscription that observes nothing (useful for test doubles).
    pub fn detached() -> Self {
        Self { inner: None }
    }
}

impl std::fmt::Debug for UpdateSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateSubscription")
            .field("attached", &self.inner.is_some())
            .finish()
    }
}

/// Operations a synchronization provider may perform on a document.
pub trait SyncDocument: Send + Sync {
    /// Room GUID this document belongs to.
    fn guid(&self) -> &str;

    /// Merge a remote delta. Idempotent; rejects malformed input atomically.
    fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError>;

    /// Delta bringing a peer at `since` up to date (`None` = full snapshot).
    fn encode_state_as_update(&self, since: Option<&[u8]>) -> Result<Vec<u8>, DocumentError>;

    /// v1-encoded state vector of this replica.
    fn state_vector(&self) -> Vec<u8>;

    /// Register `f` for every update that did not come through `apply_update`.
    fn observe_local_updates(&self, f: LocalUpdateFn) -> Result<UpdateSubscription, DocumentError>;
}
