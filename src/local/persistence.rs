use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use log::{debug, error, warn};

use crate::error::{internal_error, is_transient, SyncResult};
use crate::local::document_overlay_cache::DocumentOverlayCache;
use crate::local::index_manager::{FieldIndex, IndexManager};
use crate::local::mutation_queue::MutationQueue;
use crate::local::remote_document_cache::RemoteDocumentCache;
use crate::local::target_cache::{TargetCache, TargetGlobals};
use crate::local::target_data::TargetData;
use crate::model::{
    BatchId, Document, DocumentKey, ListenSequenceNumber, MutationBatch, Overlay, ResourcePath,
    TargetId,
};

const MAX_STORAGE_ATTEMPTS: usize = 3;

/// A single durable write. The local state is the fold of every change ever committed.
#[derive(Clone, Debug, PartialEq)]
pub enum StorageChange {
    PutDocument(Document),
    RemoveDocument(DocumentKey),
    PutMutationBatch { user: String, batch: MutationBatch },
    RemoveMutationBatch { user: String, batch_id: BatchId },
    PutOverlay { user: String, overlay: Overlay },
    RemoveOverlay { user: String, key: DocumentKey },
    PutTarget(TargetData),
    RemoveTarget(TargetId),
    AddTargetDocument { target_id: TargetId, key: DocumentKey },
    RemoveTargetDocument { target_id: TargetId, key: DocumentKey },
    PutTargetGlobals(TargetGlobals),
    AddCollectionParent(ResourcePath),
    RemoveCollectionParent(ResourcePath),
    PutFieldIndex(FieldIndex),
    RemoveFieldIndex(i32),
    PutDocumentSequenceNumber {
        key: DocumentKey,
        sequence_number: ListenSequenceNumber,
    },
    RemoveDocumentSequenceNumber(DocumentKey),
}

/// Pending writes and their overlays for one user.
#[derive(Debug, Default)]
pub struct UserQueues {
    pub(crate) mutation_queue: MutationQueue,
    pub(crate) overlays: DocumentOverlayCache,
}

impl UserQueues {
    pub fn mutation_queue(&self) -> &MutationQueue {
        &self.mutation_queue
    }

    pub fn overlays(&self) -> &DocumentOverlayCache {
        &self.overlays
    }
}

#[derive(Debug, Default)]
pub struct PersistenceState {
    pub(crate) remote_documents: RemoteDocumentCache,
    pub(crate) target_cache: TargetCache,
    pub(crate) index_manager: IndexManager,
    /// Last sequence number at which each document was referenced or released.
    pub(crate) document_sequence_numbers: BTreeMap<DocumentKey, ListenSequenceNumber>,
    pub(crate) users: BTreeMap<String, UserQueues>,
    empty_user: UserQueues,
}

impl PersistenceState {
    pub fn remote_documents(&self) -> &RemoteDocumentCache {
        &self.remote_documents
    }

    pub fn target_cache(&self) -> &TargetCache {
        &self.target_cache
    }

    pub fn index_manager(&self) -> &IndexManager {
        &self.index_manager
    }

    pub fn user_queues(&self, user: &str) -> &UserQueues {
        self.users.get(user).unwrap_or(&self.empty_user)
    }

    pub fn users(&self) -> impl Iterator<Item = (&String, &UserQueues)> {
        self.users.iter()
    }

    pub fn document_sequence_number(&self, key: &DocumentKey) -> Option<ListenSequenceNumber> {
        self.document_sequence_numbers.get(key).copied()
    }

    /// Applies `change` and returns the change that reverts it, if any.
    fn apply(&mut self, change: StorageChange) -> Option<StorageChange> {
        match change {
            StorageChange::PutDocument(document) => {
                let key = document.key().clone();
                self.index_manager.index_document(&document);
                Some(match self.remote_documents.put(document) {
                    Some(previous) => StorageChange::PutDocument(previous),
                    None => StorageChange::RemoveDocument(key),
                })
            }
            StorageChange::RemoveDocument(key) => {
                self.index_manager.unindex_document(&key);
                self.remote_documents
                    .remove(&key)
                    .map(StorageChange::PutDocument)
            }
            StorageChange::PutMutationBatch { user, batch } => {
                let batch_id = batch.batch_id;
                let queue = &mut self.users.entry(user.clone()).or_default().mutation_queue;
                Some(match queue.put(batch) {
                    Some(previous) => StorageChange::PutMutationBatch {
                        user,
                        batch: previous,
                    },
                    None => StorageChange::RemoveMutationBatch { user, batch_id },
                })
            }
            StorageChange::RemoveMutationBatch { user, batch_id } => {
                let queue = &mut self.users.entry(user.clone()).or_default().mutation_queue;
                queue
                    .remove(batch_id)
                    .map(|batch| StorageChange::PutMutationBatch { user, batch })
            }
            StorageChange::PutOverlay { user, overlay } => {
                let key = overlay.key().clone();
                let overlays = &mut self.users.entry(user.clone()).or_default().overlays;
                Some(match overlays.put(overlay) {
                    Some(previous) => StorageChange::PutOverlay {
                        user,
                        overlay: previous,
                    },
                    None => StorageChange::RemoveOverlay { user, key },
                })
            }
            StorageChange::RemoveOverlay { user, key } => {
                let overlays = &mut self.users.entry(user.clone()).or_default().overlays;
                overlays
                    .remove(&key)
                    .map(|overlay| StorageChange::PutOverlay { user, overlay })
            }
            StorageChange::PutTarget(target_data) => {
                let target_id = target_data.target_id;
                Some(match self.target_cache.put(target_data) {
                    Some(previous) => StorageChange::PutTarget(previous),
                    None => StorageChange::RemoveTarget(target_id),
                })
            }
            StorageChange::RemoveTarget(target_id) => self
                .target_cache
                .remove(target_id)
                .map(StorageChange::PutTarget),
            StorageChange::AddTargetDocument { target_id, key } => {
                if self.target_cache.add_reference(key.clone(), target_id) {
                    Some(StorageChange::RemoveTargetDocument { target_id, key })
                } else {
                    None
                }
            }
            StorageChange::RemoveTargetDocument { target_id, key } => {
                if self.target_cache.remove_reference(&key, target_id) {
                    Some(StorageChange::AddTargetDocument { target_id, key })
                } else {
                    None
                }
            }
            StorageChange::PutTargetGlobals(globals) => Some(StorageChange::PutTargetGlobals(
                self.target_cache.set_globals(globals),
            )),
            StorageChange::AddCollectionParent(path) => {
                if self.index_manager.add_collection_parent(&path) {
                    Some(StorageChange::RemoveCollectionParent(path))
                } else {
                    None
                }
            }
            StorageChange::RemoveCollectionParent(path) => {
                if self.index_manager.remove_collection_parent(&path) {
                    Some(StorageChange::AddCollectionParent(path))
                } else {
                    None
                }
            }
            StorageChange::PutFieldIndex(index) => {
                let index_id = index.index_id;
                let previous = self
                    .index_manager
                    .put_field_index(index, &self.remote_documents);
                Some(match previous {
                    Some(previous) => StorageChange::PutFieldIndex(previous),
                    None => StorageChange::RemoveFieldIndex(index_id),
                })
            }
            StorageChange::RemoveFieldIndex(index_id) => self
                .index_manager
                .remove_field_index(index_id)
                .map(StorageChange::PutFieldIndex),
            StorageChange::PutDocumentSequenceNumber {
                key,
                sequence_number,
            } => Some(
                match self
                    .document_sequence_numbers
                    .insert(key.clone(), sequence_number)
                {
                    Some(previous) => StorageChange::PutDocumentSequenceNumber {
                        key,
                        sequence_number: previous,
                    },
                    None => StorageChange::RemoveDocumentSequenceNumber(key),
                },
            ),
            StorageChange::RemoveDocumentSequenceNumber(key) => self
                .document_sequence_numbers
                .remove(&key)
                .map(|sequence_number| StorageChange::PutDocumentSequenceNumber {
                    key,
                    sequence_number,
                }),
        }
    }
}

/// Scope of one atomic unit of work.
///
/// Component writes go through [`Transaction::record`]; if the closure passed to
/// [`MemoryPersistence::run_transaction`] fails, every recorded change is reverted.
pub struct Transaction<'a> {
    state: &'a mut PersistenceState,
    user: &'a str,
    sequence_number: ListenSequenceNumber,
    changes: Vec<StorageChange>,
    undo: Vec<StorageChange>,
}

impl<'a> Transaction<'a> {
    /// Storage key of the user whose mutation queue this transaction sees.
    pub fn user(&self) -> &str {
        self.user
    }

    /// Sequence number stamped on everything this transaction touches.
    pub fn sequence_number(&self) -> ListenSequenceNumber {
        self.sequence_number
    }

    pub fn state(&self) -> &PersistenceState {
        self.state
    }

    pub fn remote_documents(&self) -> &RemoteDocumentCache {
        &self.state.remote_documents
    }

    pub fn mutation_queue(&self) -> &MutationQueue {
        &self.state.user_queues(self.user).mutation_queue
    }

    pub fn document_overlays(&self) -> &DocumentOverlayCache {
        &self.state.user_queues(self.user).overlays
    }

    pub fn target_cache(&self) -> &TargetCache {
        &self.state.target_cache
    }

    pub fn index_manager(&self) -> &IndexManager {
        &self.state.index_manager
    }

    pub(crate) fn record(&mut self, change: StorageChange) {
        if let Some(inverse) = self.state.apply(change.clone()) {
            self.undo.push(inverse);
        }
        self.changes.push(change);
    }

    fn rollback(self) {
        let Transaction { state, mut undo, .. } = self;
        while let Some(inverse) = undo.pop() {
            state.apply(inverse);
        }
    }
}

/// Durable home for the change log.
pub trait StorageBackend: Send {
    /// Returns every change committed so far, oldest first.
    fn load(&mut self) -> SyncResult<Vec<StorageChange>>;

    fn commit(&mut self, changes: &[StorageChange]) -> SyncResult<()>;
}

/// Backend keeping the change log in shared memory, so a new persistence instance
/// can be reopened from what an earlier one committed.
#[derive(Clone, Default)]
pub struct ChangeLogBackend {
    log: Arc<Mutex<Vec<StorageChange>>>,
}

impl ChangeLogBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.log.lock().map(|log| log.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StorageBackend for ChangeLogBackend {
    fn load(&mut self) -> SyncResult<Vec<StorageChange>> {
        let log = self
            .log
            .lock()
            .map_err(|_| internal_error("Change log lock poisoned"))?;
        Ok(log.clone())
    }

    fn commit(&mut self, changes: &[StorageChange]) -> SyncResult<()> {
        let mut log = self
            .log
            .lock()
            .map_err(|_| internal_error("Change log lock poisoned"))?;
        log.extend_from_slice(changes);
        Ok(())
    }
}

/// Local cache state held in memory, optionally mirrored to a [`StorageBackend`].
///
/// Transactions run one at a time against `&mut self`; the in-memory state is
/// authoritative and the backend only ever receives fully committed change sets.
pub struct MemoryPersistence {
    state: PersistenceState,
    backend: Option<Box<dyn StorageBackend>>,
    listen_sequence: ListenSequenceNumber,
}

impl Default for MemoryPersistence {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryPersistence {
    pub fn new() -> Self {
        Self {
            state: PersistenceState::default(),
            backend: None,
            listen_sequence: 0,
        }
    }

    /// Restores the state from `backend`. An unreadable backend is dropped and the
    /// cache starts empty instead.
    pub fn with_backend(mut backend: Box<dyn StorageBackend>) -> Self {
        let mut persistence = Self::new();
        match retry_transient("load", || backend.load()) {
            Ok(changes) => {
                debug!("Restoring {} stored changes", changes.len());
                for change in changes {
                    persistence.state.apply(change);
                }
                persistence.backend = Some(backend);
            }
            Err(err) => {
                error!("Durable storage is unusable, continuing with an in-memory cache: {err}");
            }
        }
        persistence.listen_sequence = persistence
            .state
            .target_cache
            .globals()
            .highest_listen_sequence_number;
        persistence
    }

    pub fn is_durable(&self) -> bool {
        self.backend.is_some()
    }

    pub fn state(&self) -> &PersistenceState {
        &self.state
    }

    /// Runs `operation` atomically on behalf of `user`.
    pub fn run_transaction<T, F>(&mut self, label: &str, user: &str, operation: F) -> SyncResult<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> SyncResult<T>,
    {
        let highest = self
            .state
            .target_cache
            .globals()
            .highest_listen_sequence_number;
        self.listen_sequence = self.listen_sequence.max(highest) + 1;

        let mut txn = Transaction {
            state: &mut self.state,
            user,
            sequence_number: self.listen_sequence,
            changes: Vec::new(),
            undo: Vec::new(),
        };
        match operation(&mut txn) {
            Ok(value) => {
                let changes = std::mem::take(&mut txn.changes);
                self.commit(label, &changes);
                Ok(value)
            }
            Err(err) => {
                debug!("Transaction '{label}' failed, rolling back: {err}");
                txn.rollback();
                Err(err)
            }
        }
    }

    fn commit(&mut self, label: &str, changes: &[StorageChange]) {
        if changes.is_empty() {
            return;
        }
        let Some(backend) = self.backend.as_mut() else {
            return;
        };
        if let Err(err) = retry_transient(label, || backend.commit(changes)) {
            error!("Could not persist '{label}', continuing without durable storage: {err}");
            self.backend = None;
        }
    }
}

fn retry_transient<T>(label: &str, mut operation: impl FnMut() -> SyncResult<T>) -> SyncResult<T> {
    let mut attempt = 1;
    loop {
        match operation() {
            Ok(value) => return Ok(value),
            Err(err) if is_transient(err.code) && attempt < MAX_STORAGE_ATTEMPTS => {
                warn!("Storage operation '{label}' failed (attempt {attempt}), retrying: {err}");
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{data_loss, invalid_argument, unavailable};
    use crate::test_support::{doc, key, version};

    struct FlakyBackend {
        inner: ChangeLogBackend,
        failures: Vec<crate::error::SyncError>,
    }

    impl StorageBackend for FlakyBackend {
        fn load(&mut self) -> SyncResult<Vec<StorageChange>> {
            self.inner.load()
        }

        fn commit(&mut self, changes: &[StorageChange]) -> SyncResult<()> {
            if let Some(err) = self.failures.pop() {
                return Err(err);
            }
            self.inner.commit(changes)
        }
    }

    #[test]
    fn failed_transaction_rolls_back_every_change() {
        let mut persistence = MemoryPersistence::new();
        persistence
            .run_transaction("seed", "anonymous", |txn| {
                txn.put_document(doc("rooms/a", 1, &[]), version(1));
                Ok(())
            })
            .unwrap();

        let result: SyncResult<()> = persistence.run_transaction("fail", "anonymous", |txn| {
            txn.put_document(doc("rooms/a", 2, &[]), version(2));
            txn.put_document(doc("rooms/b", 2, &[]), version(2));
            Err(invalid_argument("boom"))
        });

        assert!(result.is_err());
        let documents = persistence.state().remote_documents();
        assert_eq!(documents.len(), 1);
        assert_eq!(documents.get(&key("rooms/a")).version(), version(1));
        assert!(!documents.contains_key(&key("rooms/b")));
    }

    #[test]
    fn reopening_replays_committed_changes() {
        let backend = ChangeLogBackend::new();
        let mut persistence = MemoryPersistence::with_backend(Box::new(backend.clone()));
        persistence
            .run_transaction("write", "anonymous", |txn| {
                txn.put_document(doc("rooms/a", 3, &[]), version(3));
                Ok(())
            })
            .unwrap();
        assert!(!backend.is_empty());

        let reopened = MemoryPersistence::with_backend(Box::new(backend));
        assert!(reopened.is_durable());
        assert_eq!(
            reopened.state().remote_documents().get(&key("rooms/a")).version(),
            version(3)
        );
    }

    #[test]
    fn transient_commit_failures_are_retried() {
        let inner = ChangeLogBackend::new();
        let backend = FlakyBackend {
            inner: inner.clone(),
            failures: vec![unavailable("busy"), unavailable("busy")],
        };
        let mut persistence = MemoryPersistence::with_backend(Box::new(backend));
        persistence
            .run_transaction("write", "anonymous", |txn| {
                txn.put_document(doc("rooms/a", 1, &[]), version(1));
                Ok(())
            })
            .unwrap();
        assert!(persistence.is_durable());
        assert!(!inner.is_empty());
    }

    #[test]
    fn unusable_backend_degrades_to_memory() {
        let backend = FlakyBackend {
            inner: ChangeLogBackend::new(),
            failures: vec![data_loss("corrupt")],
        };
        let mut persistence = MemoryPersistence::with_backend(Box::new(backend));
        persistence
            .run_transaction("write", "anonymous", |txn| {
                txn.put_document(doc("rooms/a", 1, &[]), version(1));
                Ok(())
            })
            .unwrap();
        assert!(!persistence.is_durable());
        assert!(persistence
            .state()
            .remote_documents()
            .contains_key(&key("rooms/a")));
    }

    #[test]
    fn sequence_numbers_increase_per_transaction() {
        let mut persistence = MemoryPersistence::new();
        let first = persistence
            .run_transaction("a", "anonymous", |txn| Ok(txn.sequence_number()))
            .unwrap();
        let second = persistence
            .run_transaction("b", "anonymous", |txn| Ok(txn.sequence_number()))
            .unwrap();
        assert!(second > first);
    }
}
