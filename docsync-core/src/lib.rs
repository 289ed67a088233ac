//! # docsync-core: shared document model
//!
//! A Yrs-backed document with typed sub-documents (text source, cells,
//! metadata, outputs), change notification and local-only undo/redo, plus
//! the [`SyncDocument`] seam through which providers exchange updates.

pub mod document;
pub mod error;
pub mod sync;

pub use document::{
    Cell, CellType, ChangeOrigin, DocumentChange, DocumentRoot, ListenerId, SharedDocument,
    LOCAL_ORIGIN, REMOTE_ORIGIN,
};
pub use error::DocumentError;
pub use sync::{LocalUpdateFn, SyncDocument, UpdateSubscription};
