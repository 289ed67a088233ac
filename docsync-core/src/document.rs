//! Shared document model backed by a Yrs `Doc`.
//!
//! Layout of the root types:
//! ```text
//! Doc (guid = room id)
//!  ├── "source"   Y.Text    plain text source (text files)
//!  ├── "cells"    Y.Array   notebook cells, one JSON string per cell
//!  ├── "metadata" Y.Map     string key/value metadata
//!  └── "outputs"  Y.Array   append-only output stream
//! ```
//!
//! Local edits run under `LOCAL_ORIGIN`, remote merges under `REMOTE_ORIGIN`.
//! The undo manager only tracks the former, so a peer's merge is never
//! reverted by a local undo.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Array, ArrayRef, Doc, GetString, Map, MapRef, Observable, Origin, Out, ReadTxn,
    StateVector, Subscription, Text, TextRef, Transact, UndoManager, Update,
};

use crate::error::DocumentError;
use crate::sync::{LocalUpdateFn, SyncDocument, UpdateSubscription};

/// Transaction origin of edits made through this API.
pub const LOCAL_ORIGIN: &str = "docsync-local";
/// Transaction origin of updates merged through `apply_update`.
pub const REMOTE_ORIGIN: &str = "docsync-remote";

const ROOT_SOURCE: &str = "source";
const ROOT_CELLS: &str = "cells";
const ROOT_METADATA: &str = "metadata";
const ROOT_OUTPUTS: &str = "outputs";

/// One of the typed sub-documents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DocumentRoot {
    Source,
    Cells,
    Metadata,
    Outputs,
}

/// Where a mutation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Editor input, undo or redo.
    Local,
    /// A delta merged via `apply_update`.
    Remote,
}

/// Delivered to change listeners after each committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentChange {
    pub origin: ChangeOrigin,
    /// Sub-documents touched by the transaction, in first-touched order.
    pub roots: Vec<DocumentRoot>,
}

impl DocumentChange {
    pub fn touches(&self, root: DocumentRoot) -> bool {
        self.roots.contains(&root)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CellType {
    Code,
    Markdown,
    Raw,
}

/// A notebook cell as stored in the `cells` array.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cell {
    pub id: String,
    pub cell_type: CellType,
    pub source: String,
}

impl Cell {
    pub fn new(cell_type: CellType, source: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            cell_type,
            source: source.into(),
        }
    }

    pub fn code(source: impl Into<String>) -> Self {
        Self::new(CellType::Code, source)
    }

    pub fn markdown(source: impl Into<String>) -> Self {
        Self::new(CellType::Markdown, source)
    }
}

/// Handle returned by [`SharedDocument::on_change`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type ChangeListener = Arc<dyn Fn(&DocumentChange) + Send + Sync>;

/// The collaborative document for one room.
///
/// All mutation goes through the typed methods below or through
/// [`SharedDocument::apply_update`]. Listeners run synchronously after the
/// transaction has committed, so they may read the document; they must not
/// register or remove listeners from inside the callback.
pub struct SharedDocument {
    guid: String,
    doc: Doc,
    source: TextRef,
    cells: ArrayRef,
    metadata: MapRef,
    outputs: ArrayRef,
    undo: Mutex<UndoManager>,
    /// Roots touched by the transaction currently committing.
    touched: Arc<Mutex<Vec<DocumentRoot>>>,
    /// Serializes mutate-then-drain so each change event is self-contained.
    mutation: Mutex<()>,
    listeners: Mutex<Vec<(ListenerId, ChangeListener)>>,
    next_listener: AtomicU64,
    _root_observers: Vec<Subscription>,
}

impl SharedDocument {
    /// Create an empty document for the given room.
    pub fn new(guid: impl Into<String>) -> Self {
        let doc = Doc::new();
        let source = doc.get_or_insert_text(ROOT_SOURCE);
        let cells = doc.get_or_insert_array(ROOT_CELLS);
        let metadata = doc.get_or_insert_map(ROOT_METADATA);
        let outputs = doc.get_or_insert_array(ROOT_OUTPUTS);

        let mut undo = UndoManager::new(&doc, &source);
        undo.expand_scope(&cells);
        undo.expand_scope(&metadata);
        undo.expand_scope(&outputs);
        undo.include_origin(LOCAL_ORIGIN);

        let touched = Arc::new(Mutex::new(Vec::new()));
        let root_observers = vec![
            source.observe(touch(&touched, DocumentRoot::Source)),
            cells.observe(touch(&touched, DocumentRoot::Cells)),
            metadata.observe(touch(&touched, DocumentRoot::Metadata)),
            outputs.observe(touch(&touched, DocumentRoot::Outputs)),
        ];

        Self {
            guid: guid.into(),
            doc,
            source,
            cells,
            metadata,
            outputs,
            undo: Mutex::new(undo),
            touched,
            mutation: Mutex::new(()),
            listeners: Mutex::new(Vec::new()),
            next_listener: AtomicU64::new(1),
            _root_observers: root_observers,
        }
    }

    /// Room GUID.
    pub fn guid(&self) -> &str {
        &self.guid
    }

    // ─── CRDT exchange ────────────────────────────────────────────────

    /// Merge a remote delta.
    ///
    /// The bytes are decoded before a transaction is opened, so a corrupt
    /// update is rejected without touching the document.
    pub fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        let update = Update::decode_v1(update).map_err(|e| {
            log::debug!("Document {}: rejecting malformed update: {e}", self.guid);
            DocumentError::from(e)
        })?;
        let guard = lock(&self.mutation);
        let result = {
            let mut txn = self.doc.transact_mut_with(REMOTE_ORIGIN);
            txn.apply_update(update)
                .map_err(|e| DocumentError::Apply(e.to_string()))
        };
        let roots = self.drain_touched();
        drop(guard);
        self.notify(ChangeOrigin::Remote, roots);
        if let Err(e) = &result {
            log::warn!("Document {}: remote update not integrated: {e}", self.guid);
        }
        result
    }

    /// Encode the delta a peer holding `since` is missing.
    ///
    /// `None` produces a full snapshot.
    pub fn encode_state_as_update(&self, since: Option<&[u8]>) -> Result<Vec<u8>, DocumentError> {
        let sv = match since {
            Some(bytes) => StateVector::decode_v1(bytes)
                .map_err(|e| DocumentError::StateVector(e.to_string()))?,
            None => StateVector::default(),
        };
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// v1-encoded state vector.
    pub fn state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Full snapshot of the document.
    pub fn snapshot(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Restore a snapshot produced by [`SharedDocument::snapshot`].
    pub fn load_snapshot(&self, snapshot: &[u8]) -> Result<(), DocumentError> {
        self.apply_update(snapshot)
    }

    /// Observe updates produced by local edits (including undo/redo).
    pub fn observe_local_updates(&self, f: LocalUpdateFn) -> Result<UpdateSubscription, DocumentError> {
        let remote = Origin::from(REMOTE_ORIGIN);
        let sub = self
            .doc
            .observe_update_v1(move |txn, event| {
                if txn.origin() != Some(&remote) {
                    f(&event.update);
                }
            })
            .map_err(|e| DocumentError::Observe(e.to_string()))?;
        Ok(UpdateSubscription::new(sub))
    }

    // ─── Change notification ─────────────────────────────────────────

    /// Register a listener fired after every local or remote mutation.
    pub fn on_change<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&DocumentChange) + Send + Sync + 'static,
    {
        let id = ListenerId(self.next_listener.fetch_add(1, Ordering::Relaxed));
        lock(&self.listeners).push((id, Arc::new(listener)));
        id
    }

    /// Remove a listener. Returns `false` if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut listeners = lock(&self.listeners);
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() != before
    }

    fn drain_touched(&self) -> Vec<DocumentRoot> {
        std::mem::take(&mut *lock(&self.touched))
    }

    fn notify(&self, origin: ChangeOrigin, roots: Vec<DocumentRoot>) {
        if roots.is_empty() {
            return;
        }
        let change = DocumentChange { origin, roots };
        let listeners: Vec<ChangeListener> =
            lock(&self.listeners).iter().map(|(_, l)| l.clone()).collect();
        for listener in listeners {
            listener(&change);
        }
    }

    /// Run a local edit under `LOCAL_ORIGIN` and notify listeners.
    fn edit<R>(&self, f: impl FnOnce(&mut yrs::TransactionMut) -> R) -> R {
        let guard = lock(&self.mutation);
        let out = {
            let mut txn = self.doc.transact_mut_with(LOCAL_ORIGIN);
            f(&mut txn)
        };
        let roots = self.drain_touched();
        drop(guard);
        self.notify(ChangeOrigin::Local, roots);
        out
    }

    // ─── Undo / redo ─────────────────────────────────────────────────

    pub fn can_undo(&self) -> bool {
        lock(&self.undo).can_undo()
    }

    pub fn can_redo(&self) -> bool {
        lock(&self.undo).can_redo()
    }

    /// Revert the last local change. Returns `false` if there was nothing to undo.
    pub fn undo(&self) -> bool {
        let guard = lock(&self.mutation);
        let undone = lock(&self.undo).undo_blocking();
        let roots = self.drain_touched();
        drop(guard);
        self.notify(ChangeOrigin::Local, roots);
        undone
    }

    /// Reapply the last undone local change.
    pub fn redo(&self) -> bool {
        let guard = lock(&self.mutation);
        let redone = lock(&self.undo).redo_blocking();
        let roots = self.drain_touched();
        drop(guard);
        self.notify(ChangeOrigin::Local, roots);
        redone
    }

    // ─── Text source ─────────────────────────────────────────────────

    pub fn source(&self) -> String {
        let txn = self.doc.transact();
        self.source.get_string(&txn)
    }

    pub fn source_len(&self) -> u32 {
        let txn = self.doc.transact();
        self.source.len(&txn)
    }

    pub fn insert_text(&self, index: u32, chunk: &str) -> Result<(), DocumentError> {
        self.edit(|txn| {
            let len = self.source.len(txn);
            if index > len {
                return Err(DocumentError::OutOfBounds { index, len });
            }
            self.source.insert(txn, index, chunk);
            Ok(())
        })
    }

    pub fn delete_text(&self, index: u32, count: u32) -> Result<(), DocumentError> {
        self.edit(|txn| {
            let len = self.source.len(txn);
            let end = index.saturating_add(count);
            if end > len {
                return Err(DocumentError::OutOfBounds { index: end, len });
            }
            self.source.remove_range(txn, index, count);
            Ok(())
        })
    }

    /// Replace the whole source (used to seed a room from disk).
    pub fn set_source(&self, text: &str) {
        self.edit(|txn| {
            let len = self.source.len(txn);
            if len > 0 {
                self.source.remove_range(txn, 0, len);
            }
            self.source.insert(txn, 0, text);
        });
    }

    // ─── Cells ───────────────────────────────────────────────────────

    pub fn cell_count(&self) -> u32 {
        let txn = self.doc.transact();
        self.cells.len(&txn)
    }

    pub fn cells(&self) -> Result<Vec<Cell>, DocumentError> {
        let txn = self.doc.transact();
        self.cells
            .iter(&txn)
            .map(|out| decode_cell(&out))
            .collect()
    }

    pub fn cell(&self, index: u32) -> Result<Option<Cell>, DocumentError> {
        let txn = self.doc.transact();
        self.cells.get(&txn, index).map(|out| decode_cell(&out)).transpose()
    }

    pub fn push_cell(&self, cell: &Cell) -> Result<(), DocumentError> {
        let json = serde_json::to_string(cell)?;
        self.edit(|txn| {
            self.cells.push_back(txn, json);
        });
        Ok(())
    }

    pub fn insert_cell(&self, index: u32, cell: &Cell) -> Result<(), DocumentError> {
        let json = serde_json::to_string(cell)?;
        self.edit(|txn| {
            let len = self.cells.len(txn);
            if index > len {
                return Err(DocumentError::OutOfBounds { index, len });
            }
            self.cells.insert(txn, index, json);
            Ok(())
        })
    }

    pub fn remove_cell(&self, index: u32) -> Result<(), DocumentError> {
        self.edit(|txn| {
            let len = self.cells.len(txn);
            if index >= len {
                return Err(DocumentError::OutOfBounds { index, len });
            }
            self.cells.remove(txn, index);
            Ok(())
        })
    }

    /// Replace the source of the cell at `index`, keeping its id and type.
    ///
    /// The read and the rewrite share one transaction, so a concurrent remote
    /// merge cannot move the cell out from under the index.
    pub fn set_cell_source(&self, index: u32, source: &str) -> Result<(), DocumentError> {
        self.edit(|txn| {
            let len = self.cells.len(txn);
            let mut cell = match self.cells.get(txn, index) {
                Some(out) => decode_cell(&out)?,
                None => return Err(DocumentError::OutOfBounds { index, len }),
            };
            cell.source = source.to_string();
            let json = serde_json::to_string(&cell)?;
            self.cells.remove(txn, index);
            self.cells.insert(txn, index, json);
            Ok(())
        })
    }

    // ─── Metadata ────────────────────────────────────────────────────

    pub fn set_metadata(&self, key: &str, value: &str) {
        self.edit(|txn| {
            self.metadata.insert(txn, key, value.to_string());
        });
    }

    pub fn metadata(&self, key: &str) -> Option<String> {
        let txn = self.doc.transact();
        self.metadata.get(&txn, key).and_then(|out| out_to_string(&out))
    }

    pub fn remove_metadata(&self, key: &str) -> Option<String> {
        self.edit(|txn| self.metadata.remove(txn, key))
            .and_then(|out| out_to_string(&out))
    }

    pub fn metadata_keys(&self) -> Vec<String> {
        let txn = self.doc.transact();
        let mut keys: Vec<String> = self.metadata.keys(&txn).map(|k| k.to_string()).collect();
        keys.sort();
        keys
    }

    // ─── Output stream ───────────────────────────────────────────────

    pub fn append_output(&self, chunk: &str) {
        self.edit(|txn| {
            self.outputs.push_back(txn, chunk.to_string());
        });
    }

    pub fn outputs(&self) -> Vec<String> {
        let txn = self.doc.transact();
        self.outputs
            .iter(&txn)
            .filter_map(|out| out_to_string(&out))
            .collect()
    }

    pub fn clear_outputs(&self) {
        self.edit(|txn| {
            let len = self.outputs.len(txn);
            if len > 0 {
                self.outputs.remove_range(txn, 0, len);
            }
        });
    }
}

impl SyncDocument for SharedDocument {
    fn guid(&self) -> &str {
        SharedDocument::guid(self)
    }

    fn apply_update(&self, update: &[u8]) -> Result<(), DocumentError> {
        SharedDocument::apply_update(self, update)
    }

    fn encode_state_as_update(&self, since: Option<&[u8]>) -> Result<Vec<u8>, DocumentError> {
        SharedDocument::encode_state_as_update(self, since)
    }

    fn state_vector(&self) -> Vec<u8> {
        SharedDocument::state_vector(self)
    }

    fn observe_local_updates(&self, f: LocalUpdateFn) -> Result<UpdateSubscription, DocumentError> {
        SharedDocument::observe_local_updates(self, f)
    }
}

impl std::fmt::Debug for SharedDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDocument")
            .field("guid", &self.guid)
            .finish_non_exhaustive()
    }
}

fn touch<E>(
    touched: &Arc<Mutex<Vec<DocumentRoot>>>,
    root: DocumentRoot,
) -> impl Fn(&yrs::TransactionMut, &E) + Send + Sync + 'static {
    let touched = touched.clone();
    move |_, _| {
        let mut roots = lock(&touched);
        if !roots.contains(&root) {
            roots.push(root);
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking listener must not wedge the document.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn out_to_string(out: &Out) -> Option<String> {
    match out {
        Out::Any(Any::String(s)) => Some(s.to_string()),
        _ => None,
    }
}

fn decode_cell(out: &Out) -> Result<Cell, DocumentError> {
    let json = out_to_string(out)
        .ok_or_else(|| DocumentError::Serialization("cell is not a JSON string".into()))?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn sync_pair(a: &SharedDocument, b: &SharedDocument) {
        let a_missing = b.encode_state_as_update(Some(&a.state_vector())).unwrap();
        let b_missing = a.encode_state_as_update(Some(&b.state_vector())).unwrap();
        a.apply_update(&a_missing).unwrap();
        b.apply_update(&b_missing).unwrap();
    }

    #[test]
    fn test_insert_and_read_source() {
        let doc = SharedDocument::new("room");
        doc.insert_text(0, "Hello").unwrap();
        doc.insert_text(5, ", world").unwrap();
        assert_eq!(doc.source(), "Hello, world");
        assert_eq!(doc.source_len(), 12);

        doc.delete_text(5, 7).unwrap();
        assert_eq!(doc.source(), "Hello");
    }

    #[test]
    fn test_insert_out_of_bounds() {
        let doc = SharedDocument::new("room");
        let err = doc.insert_text(3, "x").unwrap_err();
        assert_eq!(err, DocumentError::OutOfBounds { index: 3, len: 0 });
        assert!(doc.delete_text(0, 1).is_err());
    }

    #[test]
    fn test_document_is_shareable_across_threads() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<SharedDocument>();

        let doc: Arc<dyn SyncDocument> = Arc::new(SharedDocument::new("room"));
        let remote = doc.clone();
        std::thread::spawn(move || remote.state_vector()).join().unwrap();
    }

    #[test]
    fn test_delete_range_overflow_is_an_error() {
        let doc = SharedDocument::new("room");
        let err = doc.delete_text(u32::MAX, 1).unwrap_err();
        assert_eq!(err, DocumentError::OutOfBounds { index: u32::MAX, len: 0 });
        assert!(doc.set_cell_source(0, "x").is_err());
    }

    #[test]
    fn test_bounds_checked_against_concurrent_remote_deletes() {
        let doc = Arc::new(SharedDocument::new("room"));
        let peer = SharedDocument::new("room");
        peer.set_source(&"x".repeat(400));
        doc.apply_update(&peer.encode_state_as_update(None).unwrap()).unwrap();

        let shrink: Vec<Vec<u8>> = (0..200)
            .map(|_| {
                let before = peer.state_vector();
                peer.delete_text(peer.source_len() - 2, 2).unwrap();
                peer.encode_state_as_update(Some(&before)).unwrap()
            })
            .collect();

        let remote = {
            let doc = doc.clone();
            std::thread::spawn(move || {
                for update in shrink {
                    doc.apply_update(&update).unwrap();
                }
            })
        };
        for _ in 0..2000 {
            let tail = doc.source_len();
            match doc.delete_text(tail.saturating_sub(1), 1) {
                Ok(()) | Err(DocumentError::OutOfBounds { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
            match doc.insert_text(doc.source_len(), "y") {
                Ok(()) | Err(DocumentError::OutOfBounds { .. }) => {}
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        remote.join().unwrap();
    }

    #[test]
    fn test_snapshot_restore() {
        let a = SharedDocument::new("room");
        a.set_source("print('hi')");
        a.push_cell(&Cell::code("x = 1")).unwrap();
        a.set_metadata("kernel", "python3");

        let b = SharedDocument::new("room");
        b.load_snapshot(&a.snapshot()).unwrap();

        assert_eq!(b.source(), "print('hi')");
        assert_eq!(b.cells().unwrap(), a.cells().unwrap());
        assert_eq!(b.metadata("kernel").as_deref(), Some("python3"));
    }

    #[test]
    fn test_apply_update_idempotent() {
        let a = SharedDocument::new("room");
        a.insert_text(0, "abc").unwrap();
        let update = a.snapshot();

        let b = SharedDocument::new("room");
        b.apply_update(&update).unwrap();
        let once = (b.source(), b.state_vector());
        b.apply_update(&update).unwrap();
        assert_eq!((b.source(), b.state_vector()), once);
    }

    #[test]
    fn test_corrupt_update_rejected_atomically() {
        let doc = SharedDocument::new("room");
        doc.insert_text(0, "keep").unwrap();
        let sv = doc.state_vector();

        let err = doc.apply_update(&[0x03, 0x01]).unwrap_err();
        assert!(matches!(err, DocumentError::Decode(_)));
        assert_eq!(doc.source(), "keep");
        assert_eq!(doc.state_vector(), sv);
    }

    #[test]
    fn test_malformed_state_vector() {
        let doc = SharedDocument::new("room");
        let err = doc.encode_state_as_update(Some(&[0xFF, 0xFF, 0xFF])).unwrap_err();
        assert!(matches!(err, DocumentError::StateVector(_)));
    }

    #[test]
    fn test_concurrent_edits_converge() {
        let a = SharedDocument::new("room");
        let b = SharedDocument::new("room");
        a.insert_text(0, "left").unwrap();
        b.insert_text(0, "right").unwrap();
        a.push_cell(&Cell::code("a")).unwrap();
        b.push_cell(&Cell::markdown("b")).unwrap();

        sync_pair(&a, &b);
        // Duplicated delivery changes nothing.
        sync_pair(&a, &b);

        assert_eq!(a.source(), b.source());
        assert_eq!(a.cells().unwrap(), b.cells().unwrap());
        assert_eq!(a.cell_count(), 2);
        assert_eq!(a.state_vector(), b.state_vector());
    }

    #[test]
    fn test_delta_since_state_vector() {
        let a = SharedDocument::new("room");
        a.insert_text(0, "one").unwrap();
        let b = SharedDocument::new("room");
        b.apply_update(&a.snapshot()).unwrap();

        a.insert_text(3, " two").unwrap();
        let delta = a.encode_state_as_update(Some(&b.state_vector())).unwrap();
        b.apply_update(&delta).unwrap();
        assert_eq!(b.source(), "one two");
    }

    #[test]
    fn test_change_listener_origins() {
        let a = SharedDocument::new("room");
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        a.on_change(move |change| sink.lock().unwrap().push(change.clone()));

        a.insert_text(0, "x").unwrap();
        a.set_metadata("k", "v");

        let b = SharedDocument::new("room");
        b.append_output("out");
        a.apply_update(&b.snapshot()).unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0], DocumentChange { origin: ChangeOrigin::Local, roots: vec![DocumentRoot::Source] });
        assert_eq!(events[1].roots, vec![DocumentRoot::Metadata]);
        assert_eq!(events[2].origin, ChangeOrigin::Remote);
        assert!(events[2].touches(DocumentRoot::Outputs));
    }

    #[test]
    fn test_noop_update_does_not_notify() {
        let a = SharedDocument::new("room");
        a.insert_text(0, "x").unwrap();
        let snapshot = a.snapshot();

        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        a.on_change(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        a.apply_update(&snapshot).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_remove_listener() {
        let a = SharedDocument::new("room");
        let count = Arc::new(AtomicUsize::new(0));
        let c = count.clone();
        let id = a.on_change(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        a.insert_text(0, "x").unwrap();
        assert!(a.remove_listener(id));
        assert!(!a.remove_listener(id));
        a.insert_text(0, "y").unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_local_updates_skip_remote() {
        let a = SharedDocument::new("room");
        let seen = Arc::new(Mutex::new(Vec::<Vec<u8>>::new()));
        let sink = seen.clone();
        let _sub = a
            .observe_local_updates(Box::new(move |u| sink.lock().unwrap().push(u.to_vec())))
            .unwrap();

        a.insert_text(0, "local").unwrap();
        let b = SharedDocument::new("room");
        b.insert_text(0, "remote").unwrap();
        a.apply_update(&b.snapshot()).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);

        let c = SharedDocument::new("room");
        c.apply_update(&seen[0]).unwrap();
        assert_eq!(c.source(), "local");
    }

    #[test]
    fn test_undo_tracks_only_local() {
        let a = SharedDocument::new("room");
        assert!(!a.can_undo());
        a.insert_text(0, "mine").unwrap();
        assert!(a.can_undo());

        let b = SharedDocument::new("room");
        b.push_cell(&Cell::code("theirs")).unwrap();
        a.apply_update(&b.snapshot()).unwrap();

        assert!(a.undo());
        assert_eq!(a.source(), "");
        // The remote cell survives the undo.
        assert_eq!(a.cell_count(), 1);
        assert!(!a.can_undo());

        assert!(a.can_redo());
        assert!(a.redo());
        assert_eq!(a.source(), "mine");
    }

    #[test]
    fn test_undo_on_empty_history() {
        let a = SharedDocument::new("room");
        let b = SharedDocument::new("room");
        b.insert_text(0, "remote only").unwrap();
        a.apply_update(&b.snapshot()).unwrap();
        assert!(!a.can_undo());
        assert!(!a.undo());
        assert_eq!(a.source(), "remote only");
    }

    #[test]
    fn test_cells_roundtrip_and_edit() {
        let doc = SharedDocument::new("nb");
        let first = Cell::code("import os");
        doc.push_cell(&first).unwrap();
        doc.insert_cell(0, &Cell::markdown("# Title")).unwrap();
        assert_eq!(doc.cell_count(), 2);

        doc.set_cell_source(1, "import sys").unwrap();
        let cells = doc.cells().unwrap();
        assert_eq!(cells[0].cell_type, CellType::Markdown);
        assert_eq!(cells[1].id, first.id);
        assert_eq!(cells[1].source, "import sys");

        doc.remove_cell(0).unwrap();
        assert_eq!(doc.cell_count(), 1);
        assert!(doc.remove_cell(5).is_err());
        assert!(doc.cell(7).unwrap().is_none());
    }

    #[test]
    fn test_metadata_and_outputs() {
        let doc = SharedDocument::new("nb");
        doc.set_metadata("language", "python");
        doc.set_metadata("author", "someone");
        assert_eq!(doc.metadata_keys(), vec!["author".to_string(), "language".to_string()]);
        assert_eq!(doc.remove_metadata("author").as_deref(), Some("someone"));
        assert!(doc.metadata("author").is_none());

        doc.append_output("line 1\n");
        doc.append_output("line 2\n");
        assert_eq!(doc.outputs().len(), 2);
        doc.clear_outputs();
        assert!(doc.outputs().is_empty());
    }
}
