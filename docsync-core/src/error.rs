use thiserror::Error;

/// Errors raised by the shared document model.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DocumentError {
    /// The update bytes are not a valid CRDT update. Nothing was applied.
    #[error("malformed update: {0}")]
    Decode(String),

    /// The update decoded but could not be integrated.
    #[error("failed to integrate update: {0}")]
    Apply(String),

    /// The state vector supplied to `encode_state_as_update` is malformed.
    #[error("malformed state vector: {0}")]
    StateVector(String),

    /// A cell could not be (de)serialized to its JSON representation.
    #[error("cell serialization failed: {0}")]
    Serialization(String),

    #[error("index {index} out of bounds (len {len})")]
    OutOfBounds { index: u32, len: u32 },

    /// The document store is borrowed and cannot register an observer.
    #[error("cannot observe document: {0}")]
    Observe(String),
}

impl From<yrs::encoding::read::Error> for DocumentError {
    fn from(e: yrs::encoding::read::Error) -> Self {
        DocumentError::Decode(e.to_string())
    }
}

impl From<serde_json::Error> for DocumentError {
    fn from(e: serde_json::Error) -> Self {
        DocumentError::Serialization(e.to_string())
    }
}
