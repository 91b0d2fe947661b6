//! Thin handle over the yrs text replica of one document.
//!
//! The handle is cheap to clone; all clones share one `yrs::Doc`. Every
//! mutation goes through the handle so change listeners see both local
//! inserts and remote updates, tagged with their origin.

use std::sync::{Arc, Mutex, MutexGuard};

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, GetString, ReadTxn, StateVector, Text, TextRef, Transact, Update};

use crate::error::{CollabError, CollabResult};
use crate::listeners::{emit, ListenerId, Listeners};

/// Name of the shared text type holding the page body.
pub const CONTENT_FIELD: &str = "content";

/// Where a replica change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Produced on this replica; must be published to peers.
    Local,
    /// Applied from a peer or the server.
    Remote,
}

/// A change applied to the replica, with its yrs v1 update encoding.
#[derive(Debug, Clone)]
pub struct ReplicaChange {
    pub origin: ChangeOrigin,
    pub update: Arc<Vec<u8>>,
}

struct Inner {
    doc: Doc,
    text: TextRef,
    disposed: bool,
    listeners: Listeners<ReplicaChange>,
}

/// Shared handle to a CRDT text replica.
#[derive(Clone)]
pub struct ReplicaHandle {
    inner: Arc<Mutex<Inner>>,
}

impl ReplicaHandle {
    pub fn new() -> Self {
        let doc = Doc::new();
        let text = doc.get_or_insert_text(CONTENT_FIELD);
        Self {
            inner: Arc::new(Mutex::new(Inner {
                doc,
                text,
                disposed: false,
                listeners: Listeners::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Current text content.
    pub fn text(&self) -> String {
        let inner = self.lock();
        let txn = inner.doc.transact();
        inner.text.get_string(&txn)
    }

    /// Content length in UTF-8 bytes (the replica's index unit).
    pub fn len(&self) -> usize {
        let inner = self.lock();
        let txn = inner.doc.transact();
        inner.text.len(&txn) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert `chunk` at byte offset `index`.
    pub fn insert(&self, index: usize, chunk: &str) -> CollabResult<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let (update, listeners) = {
            let inner = self.lock();
            if inner.disposed {
                return Err(CollabError::Replica("replica disposed".into()));
            }
            let current = {
                let txn = inner.doc.transact();
                inner.text.get_string(&txn)
            };
            if index > current.len() || !current.is_char_boundary(index) {
                return Err(CollabError::Replica(format!(
                    "insert offset {index} is not a character boundary (len {})",
                    current.len()
                )));
            }
            let index = u32::try_from(index)
                .map_err(|_| CollabError::Replica(format!("offset {index} out of range")))?;
            let mut txn = inner.doc.transact_mut();
            inner.text.insert(&mut txn, index, chunk);
            let update = txn.encode_update_v1();
            drop(txn);
            (update, inner.listeners.snapshot())
        };
        Self::notify(&listeners, ChangeOrigin::Local, update);
        Ok(())
    }

    /// Apply a yrs v1 update received from the network.
    pub fn apply_remote(&self, update: &[u8]) -> CollabResult<()> {
        let decoded =
            Update::decode_v1(update).map_err(|e| CollabError::Replica(e.to_string()))?;
        let listeners = {
            let inner = self.lock();
            if inner.disposed {
                return Err(CollabError::Replica("replica disposed".into()));
            }
            let mut txn = inner.doc.transact_mut();
            txn.apply_update(decoded)
                .map_err(|e| CollabError::Replica(e.to_string()))?;
            drop(txn);
            inner.listeners.snapshot()
        };
        Self::notify(&listeners, ChangeOrigin::Remote, update.to_vec());
        Ok(())
    }

    /// Encoded state vector, sent as `SyncStep1`.
    pub fn state_vector(&self) -> Vec<u8> {
        let inner = self.lock();
        let txn = inner.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Everything this replica has that the holder of `state_vector` lacks.
    pub fn diff_since(&self, state_vector: &[u8]) -> CollabResult<Vec<u8>> {
        let remote =
            StateVector::decode_v1(state_vector).map_err(|e| CollabError::Replica(e.to_string()))?;
        let inner = self.lock();
        let txn = inner.doc.transact();
        Ok(txn.encode_diff_v1(&remote))
    }

    /// Full state as a single update.
    pub fn encode_state(&self) -> Vec<u8> {
        let inner = self.lock();
        let txn = inner.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Register a change listener. Listeners run after the replica lock is
    /// released and may read the replica.
    pub fn subscribe<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&ReplicaChange) + Send + Sync + 'static,
    {
        self.lock().listeners.add(listener)
    }

    /// Remove a listener. Unknown ids are ignored.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        self.lock().listeners.remove(id)
    }

    /// Drop all listeners and refuse further mutation. Idempotent.
    pub fn dispose(&self) -> bool {
        let mut inner = self.lock();
        if inner.disposed {
            return false;
        }
        inner.disposed = true;
        inner.listeners.clear();
        true
    }

    fn notify(
        listeners: &[Arc<dyn Fn(&ReplicaChange) + Send + Sync>],
        origin: ChangeOrigin,
        update: Vec<u8>,
    ) {
        if listeners.is_empty() {
            return;
        }
        let change = ReplicaChange {
            origin,
            update: Arc::new(update),
        };
        emit(listeners, &change);
    }
}

impl Default for ReplicaHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ReplicaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ReplicaHandle")
            .field("disposed", &inner.disposed)
            .field("listeners", &inner.listeners.len())
            .finish()
    }
}
