//! Error taxonomy of the synchronization layer.
//!
//! None of these reach editor code from the steady-state relay: transport
//! errors feed the reconnect policy, decode errors drop the offending frame,
//! lock errors fall back to following the room.

use docsync_core::DocumentError;
use thiserror::Error;

/// A frame, or the CRDT payload inside it, could not be decoded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("varint length prefix exceeds 64 bits")]
    VarintOverflow,

    #[error("frame payload of {len} bytes exceeds limit of {max}")]
    FrameTooLarge { len: u64, max: usize },

    #[error("message ends inside a frame ({remaining} bytes left over)")]
    Truncated { remaining: usize },

    #[error("malformed awareness payload: {0}")]
    Awareness(String),

    #[error(transparent)]
    Document(#[from] DocumentError),
}

/// Socket-level failures. Always retried with backoff.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("connect to {url} failed: {reason}")]
    Connect { url: String, reason: String },

    #[error("connection closed by peer")]
    Closed,

    #[error("no traffic from peer for {0:?}")]
    Timeout(std::time::Duration),

    #[error("websocket error: {0}")]
    WebSocket(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("too many consecutive decode errors ({0})")]
    Corrupted(u32),
}

impl From<tokio_tungstenite::tungstenite::Error> for TransportError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        TransportError::WebSocket(e.to_string())
    }
}

/// Failures of the initialization lock surface.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LockError {
    /// Another client holds the room lock.
    #[error("room {0} is locked by another client")]
    Contention(String),

    /// The relay did not answer in time.
    #[error("lock request for room {0} timed out")]
    Timeout(String),

    /// The token is not the current holder (released, expired or foreign).
    #[error("lock token {token} is not held on room {room}")]
    NotHeld { room: String, token: u64 },

    #[error("lock endpoint error: {0}")]
    Http(String),

    #[error("lock storage error: {0}")]
    Store(String),

    #[error("provider destroyed")]
    Disposed,
}

/// Failures of the persistent room store.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("decompression error: {0}")]
    Compression(String),

    #[error("column family {0} missing")]
    MissingColumnFamily(&'static str),

    #[error("stored state of room {room} is corrupt: {reason}")]
    Corrupt { room: String, reason: String },
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

impl From<StoreError> for LockError {
    fn from(e: StoreError) -> Self {
        LockError::Store(e.to_string())
    }
}

/// Failures that stop the relay server.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A provider could not be constructed.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Lock(#[from] LockError),
}
