use std::collections::{BTreeMap, VecDeque};

use async_channel::Sender;
use log::{debug, warn};

use crate::core::view::{LimboDocumentChange, View, ViewDocumentChanges};
use crate::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::core::{Query, TargetIdGenerator};
use crate::error::{cancelled, internal_error, SyncError, SyncResult};
use crate::local::reference_set::ReferenceSet;
use crate::local::{LocalStore, LocalViewChanges, TargetData, TargetPurpose};
use crate::model::{
    BatchId, Document, DocumentKey, DocumentKeySet, DocumentMap, Mutation, MutationBatch, MutationBatchResult,
    SnapshotVersion, TargetId, Timestamp, LISTEN_SEQUENCE_INVALID,
};
use crate::remote::credentials::User;
use crate::remote::online_state_tracker::OnlineState;
use crate::remote::remote_event::RemoteEvent;
use crate::remote::remote_store::{RemoteStore, RemoteSyncer};

/// Resolved once the server accepts or permanently rejects a batch.
pub type WriteCompletion = Sender<SyncResult<()>>;

/// Output of the sync engine, drained by the event manager after each operation.
#[derive(Debug)]
pub enum SyncEngineEvent {
    Snapshots(Vec<ViewSnapshot>),
    ListenError { query: Query, error: SyncError },
    OnlineStateChanged(OnlineState),
}

#[derive(Debug)]
struct QueryView {
    query: Query,
    target_id: TargetId,
    view: View,
}

#[derive(Debug)]
struct LimboResolution {
    key: DocumentKey,
    /// The limbo target reported the document, so its absence later is a deletion.
    received_document: bool,
}

/// Coordinates the local store, the remote store and the live query views.
///
/// Every entry point runs on the client's queue. Snapshots produced along the way
/// are buffered as [`SyncEngineEvent`]s and handed out by [`SyncEngine::take_events`].
pub struct SyncEngine {
    local_store: LocalStore,
    query_views: BTreeMap<String, QueryView>,
    query_by_target: BTreeMap<TargetId, String>,
    max_concurrent_limbo_resolutions: usize,
    /// Limbo documents waiting for a free resolution slot, in arrival order.
    enqueued_limbo_resolutions: VecDeque<DocumentKey>,
    active_limbo_targets_by_key: BTreeMap<DocumentKey, TargetId>,
    active_limbo_resolutions_by_target: BTreeMap<TargetId, LimboResolution>,
    /// Which query targets hold each limbo document.
    limbo_document_refs: ReferenceSet,
    limbo_target_id_generator: TargetIdGenerator,
    /// Write completions per user key and batch.
    pending_writes: BTreeMap<String, BTreeMap<BatchId, WriteCompletion>>,
    online_state: OnlineState,
    events: Vec<SyncEngineEvent>,
}

impl SyncEngine {
    pub fn new(local_store: LocalStore, max_concurrent_limbo_resolutions: usize) -> Self {
        Self {
            local_store,
            query_views: BTreeMap::new(),
            query_by_target: BTreeMap::new(),
            max_concurrent_limbo_resolutions,
            enqueued_limbo_resolutions: VecDeque::new(),
            active_limbo_targets_by_key: BTreeMap::new(),
            active_limbo_resolutions_by_target: BTreeMap::new(),
            limbo_document_refs: ReferenceSet::new(),
            limbo_target_id_generator: TargetIdGenerator::for_sync_engine(),
            pending_writes: BTreeMap::new(),
            online_state: OnlineState::Unknown,
            events: Vec::new(),
        }
    }

    pub fn local_store(&self) -> &LocalStore {
        &self.local_store
    }

    pub fn local_store_mut(&mut self) -> &mut LocalStore {
        &mut self.local_store
    }

    pub fn online_state(&self) -> OnlineState {
        self.online_state
    }

    pub fn take_events(&mut self) -> Vec<SyncEngineEvent> {
        std::mem::take(&mut self.events)
    }

    pub fn target_id_for_query(&self, query: &Query) -> Option<TargetId> {
        self.query_views
            .get(&query.canonical_id())
            .map(|query_view| query_view.target_id)
    }

    /// Limbo documents currently being resolved by a dedicated target.
    pub fn active_limbo_documents(&self) -> Vec<DocumentKey> {
        self.active_limbo_targets_by_key.keys().cloned().collect()
    }

    pub fn enqueued_limbo_documents(&self) -> Vec<DocumentKey> {
        self.enqueued_limbo_resolutions.iter().cloned().collect()
    }

    /// Starts a view for `query` and returns its first snapshot.
    ///
    /// With `listen_to_remote`, the query's target is also registered with watch.
    pub fn listen(
        &mut self,
        remote: &mut RemoteStore,
        query: &Query,
        listen_to_remote: bool,
    ) -> SyncResult<ViewSnapshot> {
        if let Some(query_view) = self.query_views.get(&query.canonical_id()) {
            return Ok(query_view.view.compute_initial_snapshot());
        }

        let target_data = self.local_store.allocate_target(query)?;
        let snapshot = self.initialize_view_and_compute_snapshot(remote, query, &target_data)?;
        if listen_to_remote {
            remote.listen(self, target_data);
        }
        Ok(snapshot)
    }

    /// Stops the view for `query` and releases its target.
    pub fn unlisten(&mut self, remote: &mut RemoteStore, query: &Query, unlisten_from_remote: bool) -> SyncResult<()> {
        let Some(query_view) = self.query_views.get(&query.canonical_id()) else {
            debug!("Ignoring unlisten of unknown query {}", query.canonical_id());
            return Ok(());
        };
        let target_id = query_view.target_id;
        self.local_store.release_target(target_id)?;
        if unlisten_from_remote {
            remote.unlisten(self, target_id);
        }
        self.remove_and_clean_up_target(remote, target_id, None);
        Ok(())
    }

    /// Registers an existing cache-only view's target with watch.
    pub fn listen_to_remote(&mut self, remote: &mut RemoteStore, query: &Query) -> SyncResult<()> {
        let target_data = match self.local_store.get_target_data(query) {
            Some(target_data) => target_data,
            None => self.local_store.allocate_target(query)?,
        };
        remote.listen(self, target_data);
        Ok(())
    }

    pub fn unlisten_from_remote(&mut self, remote: &mut RemoteStore, query: &Query) {
        if let Some(target_id) = self.target_id_for_query(query) {
            remote.unlisten(self, target_id);
        }
    }

    /// Queues `mutations` as one batch, raises the optimistic snapshots, then hands
    /// the batch to the write pipeline.
    pub fn write(
        &mut self,
        remote: &mut RemoteStore,
        mutations: Vec<Mutation>,
        completion: WriteCompletion,
    ) -> SyncResult<BatchId> {
        let result = self
            .local_store
            .write_locally(mutations, Timestamp::now())
            .inspect_err(|err| warn!("Failed to persist write: {err}"))?;
        self.pending_writes
            .entry(self.local_store.user().key())
            .or_default()
            .insert(result.batch_id, completion);

        self.emit_new_snaps_and_notify_local_store(remote, &result.changes, None)?;
        remote.fill_write_pipeline(self);
        Ok(result.batch_id)
    }

    /// Switches to `user`'s mutation queue and recomputes every view.
    ///
    /// Completions of the previous user's writes are rejected; their batches stay
    /// queued under that user.
    pub fn handle_credential_change(&mut self, remote: &mut RemoteStore, user: User) -> SyncResult<()> {
        if self.local_store.user() == &user {
            return Ok(());
        }
        debug!("User change. New user: {}", user.key());
        let previous_user = self.local_store.user().key();
        let result = self.local_store.handle_user_change(user)?;

        if let Some(completions) = self.pending_writes.remove(&previous_user) {
            for (batch_id, completion) in completions {
                debug!("Cancelling completion of batch {batch_id} after user change");
                let outcome = Err(cancelled("The user changed before the write was acknowledged"));
                if let Err(err) = completion.try_send(outcome) {
                    debug!("Dropping cancelled completion of batch {batch_id}: {err}");
                }
            }
        }
        self.emit_new_snaps_and_notify_local_store(remote, &result.affected_documents, None)
    }

    fn initialize_view_and_compute_snapshot(
        &mut self,
        remote: &mut RemoteStore,
        query: &Query,
        target_data: &TargetData,
    ) -> SyncResult<ViewSnapshot> {
        let target_id = target_data.target_id;
        let query_result = self.local_store.execute_query(query, true)?;
        let mut view = View::new(query.clone(), query_result.remote_keys);
        let doc_changes = view.compute_doc_changes(&query_result.documents, None);
        let synthesized = RemoteEvent::synthesized_current_change(target_id, false, target_data.resume_token.clone());
        let view_change = view.apply_changes(doc_changes, true, synthesized.get(&target_id), false);

        self.query_views.insert(
            query.canonical_id(),
            QueryView {
                query: query.clone(),
                target_id,
                view,
            },
        );
        self.query_by_target.insert(target_id, query.canonical_id());
        self.update_tracked_limbos(remote, target_id, view_change.limbo_changes);

        view_change
            .snapshot
            .ok_or_else(|| internal_error("A new view always raises an initial snapshot"))
    }

    fn remove_and_clean_up_target(&mut self, remote: &mut RemoteStore, target_id: TargetId, error: Option<SyncError>) {
        if let Some(canonical_id) = self.query_by_target.remove(&target_id) {
            if let Some(query_view) = self.query_views.remove(&canonical_id) {
                if let Some(error) = error {
                    self.events.push(SyncEngineEvent::ListenError {
                        query: query_view.query,
                        error,
                    });
                }
            }
        }

        let limbo_keys = self.limbo_document_refs.remove_references_for_id(target_id);
        for key in limbo_keys {
            if !self.limbo_document_refs.contains_key(&key) {
                self.remove_limbo_target(remote, &key);
            }
        }
    }

    /// Recomputes every view against `changes` and buffers the resulting snapshots.
    fn emit_new_snaps_and_notify_local_store(
        &mut self,
        remote: &mut RemoteStore,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> SyncResult<()> {
        if self.query_views.is_empty() {
            return Ok(());
        }

        let mut new_snapshots = Vec::new();
        let mut view_changes = Vec::new();
        let canonical_ids: Vec<String> = self.query_views.keys().cloned().collect();
        for canonical_id in canonical_ids {
            let Some((target_id, snapshot)) = self.apply_doc_changes(remote, &canonical_id, changes, remote_event)?
            else {
                continue;
            };
            view_changes.push(local_view_changes(target_id, &snapshot));
            new_snapshots.push(snapshot);
        }

        if !new_snapshots.is_empty() {
            self.events.push(SyncEngineEvent::Snapshots(new_snapshots));
        }
        self.local_store.notify_local_view_changes(&view_changes)
    }

    fn apply_doc_changes(
        &mut self,
        remote: &mut RemoteStore,
        canonical_id: &str,
        changes: &DocumentMap,
        remote_event: Option<&RemoteEvent>,
    ) -> SyncResult<Option<(TargetId, ViewSnapshot)>> {
        let Some(query_view) = self.query_views.get(canonical_id) else {
            return Ok(None);
        };
        let target_id = query_view.target_id;
        let mut doc_changes = query_view.view.compute_doc_changes(changes, None);
        if doc_changes.needs_refill {
            // A document left a full limit query; pull its replacement from the cache.
            let query = query_view.query.clone();
            let documents = self.local_store.execute_query(&query, false)?.documents;
            doc_changes = self.refill(canonical_id, &documents, doc_changes);
        }

        let target_change = remote_event.and_then(|event| event.target_changes.get(&target_id));
        let pending_reset = remote_event.is_some_and(|event| event.target_mismatches.contains_key(&target_id));
        let Some(query_view) = self.query_views.get_mut(canonical_id) else {
            return Ok(None);
        };
        let view_change = query_view
            .view
            .apply_changes(doc_changes, true, target_change, pending_reset);
        self.update_tracked_limbos(remote, target_id, view_change.limbo_changes);
        Ok(view_change.snapshot.map(|snapshot| (target_id, snapshot)))
    }

    fn refill(&self, canonical_id: &str, documents: &DocumentMap, previous: ViewDocumentChanges) -> ViewDocumentChanges {
        match self.query_views.get(canonical_id) {
            Some(query_view) => query_view.view.compute_doc_changes(documents, Some(previous)),
            None => previous,
        }
    }

    fn update_tracked_limbos(
        &mut self,
        remote: &mut RemoteStore,
        target_id: TargetId,
        limbo_changes: Vec<LimboDocumentChange>,
    ) {
        for change in limbo_changes {
            match change {
                LimboDocumentChange::Added(key) => {
                    self.limbo_document_refs.add_reference(key.clone(), target_id);
                    self.track_limbo_change(remote, key);
                }
                LimboDocumentChange::Removed(key) => {
                    debug!("Document no longer in limbo: {key}");
                    self.limbo_document_refs.remove_reference(&key, target_id);
                    if !self.limbo_document_refs.contains_key(&key) {
                        self.remove_limbo_target(remote, &key);
                    }
                }
            }
        }
    }

    fn track_limbo_change(&mut self, remote: &mut RemoteStore, key: DocumentKey) {
        if self.active_limbo_targets_by_key.contains_key(&key) || self.enqueued_limbo_resolutions.contains(&key) {
            return;
        }
        debug!("New document in limbo: {key}");
        self.enqueued_limbo_resolutions.push_back(key);
        self.pump_enqueued_limbo_resolutions(remote);
    }

    /// Starts queued limbo resolutions while slots are free.
    fn pump_enqueued_limbo_resolutions(&mut self, remote: &mut RemoteStore) {
        while self.active_limbo_targets_by_key.len() < self.max_concurrent_limbo_resolutions {
            let Some(key) = self.enqueued_limbo_resolutions.pop_front() else {
                break;
            };
            let target_id = self.limbo_target_id_generator.next();
            self.active_limbo_resolutions_by_target.insert(
                target_id,
                LimboResolution {
                    key: key.clone(),
                    received_document: false,
                },
            );
            self.active_limbo_targets_by_key.insert(key.clone(), target_id);
            let target_data = TargetData::new(
                Query::document(&key),
                target_id,
                TargetPurpose::LimboResolution,
                LISTEN_SEQUENCE_INVALID,
            );
            remote.listen(self, target_data);
        }
    }

    fn remove_limbo_target(&mut self, remote: &mut RemoteStore, key: &DocumentKey) {
        self.enqueued_limbo_resolutions.retain(|queued| queued != key);
        let Some(target_id) = self.active_limbo_targets_by_key.remove(key) else {
            return;
        };
        self.active_limbo_resolutions_by_target.remove(&target_id);
        remote.unlisten(self, target_id);
        self.pump_enqueued_limbo_resolutions(remote);
    }

    fn complete_write(&mut self, batch_id: BatchId, result: SyncResult<()>) {
        let user_key = self.local_store.user().key();
        let Some(completions) = self.pending_writes.get_mut(&user_key) else {
            return;
        };
        if let Some(completion) = completions.remove(&batch_id) {
            if let Err(err) = completion.try_send(result) {
                debug!("Dropping completion of batch {batch_id}: {err}");
            }
        }
        if completions.is_empty() {
            self.pending_writes.remove(&user_key);
        }
    }
}

impl RemoteSyncer for SyncEngine {
    fn apply_remote_event(&mut self, remote: &mut RemoteStore, event: RemoteEvent) -> SyncResult<()> {
        for (target_id, change) in &event.target_changes {
            let Some(resolution) = self.active_limbo_resolutions_by_target.get_mut(target_id) else {
                continue;
            };
            if change.change_count() > 1 {
                warn!("Limbo target {target_id} reported more than one document change");
            }
            if !change.added_documents.is_empty() {
                resolution.received_document = true;
            } else if !change.modified_documents.is_empty() {
                if !resolution.received_document {
                    warn!("Limbo target {target_id} modified a document it never added");
                }
            } else if !change.removed_documents.is_empty() {
                resolution.received_document = false;
            }
        }

        let changes = self.local_store.apply_remote_event(&event)?;
        self.emit_new_snaps_and_notify_local_store(remote, &changes, Some(&event))
    }

    fn reject_listen(&mut self, remote: &mut RemoteStore, target_id: TargetId, error: SyncError) -> SyncResult<()> {
        if let Some(key) = self
            .active_limbo_resolutions_by_target
            .get(&target_id)
            .map(|resolution| resolution.key.clone())
        {
            // The limbo document cannot be read; treat it as deleted.
            let event = RemoteEvent {
                snapshot_version: SnapshotVersion::min(),
                target_changes: BTreeMap::new(),
                target_mismatches: BTreeMap::new(),
                document_updates: DocumentMap::from([(
                    key.clone(),
                    Document::new_no_document(key.clone(), SnapshotVersion::min()),
                )]),
                resolved_limbo_documents: DocumentKeySet::from([key.clone()]),
            };
            self.apply_remote_event(remote, event)?;
            self.active_limbo_targets_by_key.remove(&key);
            self.active_limbo_resolutions_by_target.remove(&target_id);
            self.pump_enqueued_limbo_resolutions(remote);
            return Ok(());
        }

        warn!("Listen for target {target_id} rejected: {error}");
        self.local_store.release_target(target_id)?;
        self.remove_and_clean_up_target(remote, target_id, Some(error));
        Ok(())
    }

    fn apply_successful_write(&mut self, remote: &mut RemoteStore, result: MutationBatchResult) -> SyncResult<()> {
        let batch_id = result.batch.batch_id;
        let changes = self.local_store.acknowledge_batch(&result)?;
        // Completions fire before the resulting snapshots.
        self.complete_write(batch_id, Ok(()));
        self.emit_new_snaps_and_notify_local_store(remote, &changes, None)
    }

    fn reject_failed_write(&mut self, remote: &mut RemoteStore, batch_id: BatchId, error: SyncError) -> SyncResult<()> {
        warn!("Write batch {batch_id} rejected: {error}");
        let changes = self.local_store.reject_batch(batch_id)?;
        self.complete_write(batch_id, Err(error));
        self.emit_new_snaps_and_notify_local_store(remote, &changes, None)
    }

    fn apply_online_state_change(&mut self, state: OnlineState) {
        let snapshots: Vec<ViewSnapshot> = self
            .query_views
            .values_mut()
            .filter_map(|query_view| query_view.view.apply_online_state_change(state).snapshot)
            .collect();
        self.events.push(SyncEngineEvent::OnlineStateChanged(state));
        if !snapshots.is_empty() {
            self.events.push(SyncEngineEvent::Snapshots(snapshots));
        }
        self.online_state = state;
    }

    fn next_mutation_batch(&self, after_batch_id: BatchId) -> Option<MutationBatch> {
        self.local_store.next_mutation_batch_after(after_batch_id)
    }

    fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.local_store.last_remote_snapshot_version()
    }

    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
        if let Some(resolution) = self.active_limbo_resolutions_by_target.get(&target_id) {
            if resolution.received_document {
                return DocumentKeySet::from([resolution.key.clone()]);
            }
            return DocumentKeySet::new();
        }
        match self
            .query_by_target
            .get(&target_id)
            .and_then(|canonical_id| self.query_views.get(canonical_id))
        {
            Some(query_view) => query_view.view.synced_documents().clone(),
            None => DocumentKeySet::new(),
        }
    }

    fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
        if let Some(resolution) = self.active_limbo_resolutions_by_target.get(&target_id) {
            return Some(TargetData::new(
                Query::document(&resolution.key),
                target_id,
                TargetPurpose::LimboResolution,
                LISTEN_SEQUENCE_INVALID,
            ));
        }
        let canonical_id = self.query_by_target.get(&target_id)?;
        let query_view = self.query_views.get(canonical_id)?;
        self.local_store.get_target_data(&query_view.query)
    }
}

fn local_view_changes(target_id: TargetId, snapshot: &ViewSnapshot) -> LocalViewChanges {
    let mut changes = LocalViewChanges {
        target_id,
        from_cache: snapshot.from_cache,
        ..LocalViewChanges::default()
    };
    for change in &snapshot.doc_changes {
        match change.change_type {
            ChangeType::Added => {
                changes.added_keys.insert(change.document.key().clone());
            }
            ChangeType::Removed => {
                changes.removed_keys.insert(change.document.key().clone());
            }
            ChangeType::Modified | ChangeType::Metadata => {}
        }
    }
    changes
}

#[cfg(all(test, not(target_arch = "wasm32")))]
mod tests {
    use super::*;
    use crate::error::{failed_precondition, permission_denied, SyncErrorCode};
    use crate::local::{MemoryPersistence, QueryEngine};
    use crate::remote::remote_event::TargetChange;
    use crate::test_support::{doc, key, offline_remote_store, query, set_mutation, version};
    use crate::value::Value;

    fn engine(max_limbo: usize) -> SyncEngine {
        let local_store = LocalStore::new(MemoryPersistence::new(), QueryEngine::default(), User::unauthenticated());
        SyncEngine::new(local_store, max_limbo)
    }

    fn last_snapshot(engine: &mut SyncEngine) -> ViewSnapshot {
        engine
            .take_events()
            .into_iter()
            .filter_map(|event| match event {
                SyncEngineEvent::Snapshots(snapshots) => snapshots.into_iter().last(),
                _ => None,
            })
            .last()
            .expect("a snapshot was raised")
    }

    fn write_room(
        engine: &mut SyncEngine,
        remote: &mut RemoteStore,
        path: &str,
    ) -> (BatchId, async_channel::Receiver<SyncResult<()>>) {
        let (completion, receiver) = async_channel::bounded(1);
        let batch_id = engine
            .write(remote, vec![set_mutation(path, &[("size", Value::from_integer(1))])], completion)
            .unwrap();
        (batch_id, receiver)
    }

    #[tokio::test]
    async fn local_write_raises_a_latency_compensated_snapshot() {
        let mut engine = engine(100);
        let mut remote = offline_remote_store();
        let initial = engine.listen(&mut remote, &query("rooms"), true).unwrap();
        assert!(initial.from_cache);
        assert!(initial.docs.is_empty());

        write_room(&mut engine, &mut remote, "rooms/a");

        let snapshot = last_snapshot(&mut engine);
        assert!(snapshot.docs.contains(&key("rooms/a")));
        assert!(snapshot.has_pending_writes());
        assert_eq!(remote.write_pipeline_len(), 1);
    }

    #[tokio::test]
    async fn rejected_write_completes_with_its_error_and_rolls_back() {
        let mut engine = engine(100);
        let mut remote = offline_remote_store();
        engine.listen(&mut remote, &query("rooms"), true).unwrap();
        let (batch_id, receiver) = write_room(&mut engine, &mut remote, "rooms/a");
        engine.take_events();

        engine
            .reject_failed_write(&mut remote, batch_id, failed_precondition("stale"))
            .unwrap();

        let outcome = receiver.try_recv().unwrap();
        assert_eq!(outcome.unwrap_err().code, SyncErrorCode::FailedPrecondition);
        let snapshot = last_snapshot(&mut engine);
        assert!(snapshot.docs.is_empty());
        assert!(!snapshot.has_pending_writes());
    }

    #[tokio::test]
    async fn abandoned_completion_still_settles_the_write() {
        let mut engine = engine(100);
        let mut remote = offline_remote_store();
        engine.listen(&mut remote, &query("rooms"), true).unwrap();
        let (batch_id, receiver) = write_room(&mut engine, &mut remote, "rooms/a");
        drop(receiver);
        engine.take_events();

        engine
            .reject_failed_write(&mut remote, batch_id, failed_precondition("stale"))
            .unwrap();

        assert!(engine.pending_writes.is_empty());
        assert!(last_snapshot(&mut engine).docs.is_empty());
    }

    #[tokio::test]
    async fn user_change_cancels_completions_and_hides_their_writes() {
        let mut engine = engine(100);
        let mut remote = offline_remote_store();
        engine.listen(&mut remote, &query("rooms"), true).unwrap();
        let (_, receiver) = write_room(&mut engine, &mut remote, "rooms/a");
        engine.take_events();

        engine
            .handle_credential_change(&mut remote, User::new("alice"))
            .unwrap();

        let outcome = receiver.try_recv().unwrap();
        assert_eq!(outcome.unwrap_err().code, SyncErrorCode::Cancelled);
        assert!(last_snapshot(&mut engine).docs.is_empty());
    }

    #[tokio::test]
    async fn limbo_resolutions_respect_the_concurrency_cap() {
        let mut engine = engine(1);
        let mut remote = offline_remote_store();
        let rooms = query("rooms");
        engine.listen(&mut remote, &rooms, true).unwrap();
        let target_id = engine.target_id_for_query(&rooms).unwrap();

        // The server marks the target current without vouching for either document.
        let event = RemoteEvent {
            snapshot_version: version(2),
            target_changes: BTreeMap::from([(
                target_id,
                TargetChange {
                    resume_token: b"token".to_vec(),
                    current: true,
                    ..TargetChange::default()
                },
            )]),
            document_updates: DocumentMap::from([
                (key("rooms/a"), doc("rooms/a", 1, &[])),
                (key("rooms/b"), doc("rooms/b", 1, &[])),
            ]),
            ..RemoteEvent::default()
        };
        engine.apply_remote_event(&mut remote, event).unwrap();

        assert_eq!(engine.active_limbo_documents(), vec![key("rooms/a")]);
        assert_eq!(engine.enqueued_limbo_documents(), vec![key("rooms/b")]);

        let limbo_target = engine.active_limbo_targets_by_key[&key("rooms/a")];
        assert_eq!(limbo_target % 2, 1);
        assert_eq!(
            engine.target_data_for_target(limbo_target).map(|data| data.purpose),
            Some(TargetPurpose::LimboResolution)
        );

        engine
            .reject_listen(&mut remote, limbo_target, permission_denied("hidden"))
            .unwrap();

        assert_eq!(engine.active_limbo_documents(), vec![key("rooms/b")]);
        assert!(engine.enqueued_limbo_documents().is_empty());
        assert!(!last_snapshot(&mut engine).docs.contains(&key("rooms/a")));
    }

    #[tokio::test]
    async fn rejected_query_listen_reports_the_error() {
        let mut engine = engine(100);
        let mut remote = offline_remote_store();
        let rooms = query("rooms");
        engine.listen(&mut remote, &rooms, true).unwrap();
        let target_id = engine.target_id_for_query(&rooms).unwrap();

        engine
            .reject_listen(&mut remote, target_id, permission_denied("no access"))
            .unwrap();

        let errors: Vec<SyncErrorCode> = engine
            .take_events()
            .into_iter()
            .filter_map(|event| match event {
                SyncEngineEvent::ListenError { error, .. } => Some(error.code),
                _ => None,
            })
            .collect();
        assert_eq!(errors, vec![SyncErrorCode::PermissionDenied]);
        assert_eq!(engine.target_id_for_query(&rooms), None);
    }
}
