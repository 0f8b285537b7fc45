use std::collections::{BTreeMap, BTreeSet};

use log::debug;

use crate::core::Query;
use crate::error::{not_found, SyncResult};
use crate::local::lru_garbage_collector::{LruParams, LruResults};
use crate::local::persistence::{MemoryPersistence, Transaction};
use crate::local::query_engine::QueryEngine;
use crate::local::reference_set::ReferenceSet;
use crate::local::target_data::{TargetData, TargetPurpose};
use crate::model::{
    BatchId, Document, DocumentKey, DocumentKeySet, DocumentMap, FieldMask, Mutation, MutationBatch,
    MutationBatchResult, SnapshotVersion, TargetId, Timestamp,
};
use crate::remote::credentials::User;
use crate::remote::remote_event::{RemoteEvent, TargetChange};

/// Resume tokens are written through at least this often even without document changes.
const RESUME_TOKEN_MAX_AGE_MICROS: i64 = 5 * 60 * 1_000_000;

#[derive(Clone, Debug, PartialEq)]
pub struct LocalWriteResult {
    pub batch_id: BatchId,
    /// Local view of every written document after the batch was applied.
    pub changes: DocumentMap,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryResult {
    pub documents: DocumentMap,
    /// Keys the server last reported for the query's target.
    pub remote_keys: DocumentKeySet,
}

/// Documents a view started or stopped showing, reported after each view update.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LocalViewChanges {
    pub target_id: TargetId,
    pub from_cache: bool,
    pub added_keys: DocumentKeySet,
    pub removed_keys: DocumentKeySet,
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct UserChangeResult {
    pub removed_batch_ids: Vec<BatchId>,
    pub added_batch_ids: Vec<BatchId>,
    /// Local view of every document the switch may have changed.
    pub affected_documents: DocumentMap,
}

/// Entry point to the local cache for the sync engine.
///
/// Every method runs in its own persistence transaction, on behalf of the current
/// user. The store also tracks the targets that are actively listened to and the
/// documents held by live views, both of which pin data during garbage collection.
pub struct LocalStore {
    persistence: MemoryPersistence,
    user: User,
    query_engine: QueryEngine,
    target_data_by_target: BTreeMap<TargetId, TargetData>,
    target_ids_by_canonical_id: BTreeMap<String, TargetId>,
    local_view_references: ReferenceSet,
}

impl LocalStore {
    pub fn new(persistence: MemoryPersistence, query_engine: QueryEngine, user: User) -> Self {
        Self {
            persistence,
            user,
            query_engine,
            target_data_by_target: BTreeMap::new(),
            target_ids_by_canonical_id: BTreeMap::new(),
            local_view_references: ReferenceSet::new(),
        }
    }

    pub fn persistence(&self) -> &MemoryPersistence {
        &self.persistence
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    /// Switches the mutation queue to `user`'s.
    ///
    /// The previous user's batches stay queued for when they sign back in.
    pub fn handle_user_change(&mut self, user: User) -> SyncResult<UserChangeResult> {
        let old_batches: Vec<MutationBatch> = self
            .persistence
            .state()
            .user_queues(&self.user.key())
            .mutation_queue()
            .all_mutation_batches()
            .cloned()
            .collect();
        self.user = user;
        let user_key = self.user.key();

        self.persistence
            .run_transaction("Handle user change", &user_key, |txn| {
                let new_batches: Vec<MutationBatch> =
                    txn.mutation_queue().all_mutation_batches().cloned().collect();
                let mut changed_keys = DocumentKeySet::new();
                for batch in old_batches.iter().chain(new_batches.iter()) {
                    changed_keys.extend(batch.keys());
                }
                Ok(UserChangeResult {
                    removed_batch_ids: old_batches.iter().map(|batch| batch.batch_id).collect(),
                    added_batch_ids: new_batches.iter().map(|batch| batch.batch_id).collect(),
                    affected_documents: txn.get_local_documents(&changed_keys),
                })
            })
    }

    /// Queues `mutations` as one batch and returns the resulting local view.
    pub fn write_locally(
        &mut self,
        mutations: Vec<Mutation>,
        local_write_time: Timestamp,
    ) -> SyncResult<LocalWriteResult> {
        let keys: DocumentKeySet = mutations.iter().map(|mutation| mutation.key.clone()).collect();
        let user_key = self.user.key();
        self.persistence
            .run_transaction("Locally write mutations", &user_key, |txn| {
                let remote_documents = txn.remote_documents().get_all(&keys);
                let without_remote_version: DocumentKeySet = remote_documents
                    .iter()
                    .filter(|(_, document)| !document.is_valid_document())
                    .map(|(key, _)| key.clone())
                    .collect();
                let mut overlayed = txn.get_overlayed_documents(remote_documents);

                let base_mutations = mutations
                    .iter()
                    .filter_map(|mutation| {
                        let document = &overlayed.get(&mutation.key)?.document;
                        base_mutation_for(mutation, document)
                    })
                    .collect();

                let batch = txn.add_mutation_batch(local_write_time, base_mutations, mutations)?;
                let overlays = batch.apply_to_local_document_set(&mut overlayed, &without_remote_version);
                txn.save_overlays(batch.batch_id, overlays);
                Ok(LocalWriteResult {
                    batch_id: batch.batch_id,
                    changes: overlayed
                        .into_iter()
                        .map(|(key, overlayed)| (key, overlayed.document))
                        .collect(),
                })
            })
    }

    /// Folds the server's acknowledgement into the cache and drops the batch.
    pub fn acknowledge_batch(&mut self, result: &MutationBatchResult) -> SyncResult<DocumentMap> {
        let user_key = self.user.key();
        self.persistence
            .run_transaction("Acknowledge batch", &user_key, |txn| {
                let batch = &result.batch;
                let affected = batch.keys();
                for key in &affected {
                    let mut document = txn.remote_documents().get(key);
                    let Some(ack_version) = result.doc_versions.get(key).copied() else {
                        continue;
                    };
                    if document.version() < ack_version {
                        batch.apply_to_remote_document(&mut document, result);
                        if document.is_valid_document() {
                            txn.put_document(document, result.commit_version);
                        }
                    }
                }
                txn.remove_mutation_batch(batch)?;
                txn.remove_overlays_for_batch_id(batch.batch_id);
                txn.recalculate_and_save_overlays_for_keys(&result.keys_with_transform_results());
                Ok(txn.get_local_documents(&affected))
            })
    }

    /// Drops a batch the server refused and returns the restored local view.
    pub fn reject_batch(&mut self, batch_id: BatchId) -> SyncResult<DocumentMap> {
        let user_key = self.user.key();
        self.persistence
            .run_transaction("Reject batch", &user_key, |txn| {
                let batch = txn
                    .mutation_queue()
                    .lookup_mutation_batch(batch_id)
                    .cloned()
                    .ok_or_else(|| not_found(format!("Batch {batch_id} is not queued")))?;
                let keys = batch.keys();
                txn.remove_mutation_batch(&batch)?;
                txn.remove_overlays_for_batch_id(batch_id);
                txn.recalculate_and_save_overlays_for_keys(&keys);
                Ok(txn.get_local_documents(&keys))
            })
    }

    pub fn highest_unacknowledged_batch_id(&self) -> BatchId {
        self.persistence
            .state()
            .user_queues(&self.user.key())
            .mutation_queue()
            .highest_unacknowledged_batch_id()
    }

    /// First queued batch after `batch_id`, for the write pipeline.
    pub fn next_mutation_batch_after(&self, batch_id: BatchId) -> Option<MutationBatch> {
        self.persistence
            .state()
            .user_queues(&self.user.key())
            .mutation_queue()
            .next_mutation_batch_after(batch_id)
            .cloned()
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.persistence.state().target_cache().last_remote_snapshot_version()
    }

    /// Applies a consistent watch snapshot and returns the changed local views.
    pub fn apply_remote_event(&mut self, event: &RemoteEvent) -> SyncResult<DocumentMap> {
        let remote_version = event.snapshot_version;
        let user_key = self.user.key();
        let target_data_by_target = &mut self.target_data_by_target;

        self.persistence
            .run_transaction("Apply remote event", &user_key, |txn| {
                for (target_id, change) in &event.target_changes {
                    let Some(old) = target_data_by_target.get(target_id).cloned() else {
                        continue;
                    };
                    txn.remove_matching_keys(&change.removed_documents, *target_id);
                    txn.add_matching_keys(&change.added_documents, *target_id);

                    let mut updated = old.with_sequence_number(txn.sequence_number());
                    if event.target_mismatches.contains_key(target_id) {
                        updated = updated
                            .with_resume_token(Vec::new(), SnapshotVersion::min())
                            .with_last_limbo_free_snapshot_version(SnapshotVersion::min());
                    } else if !change.resume_token.is_empty() && remote_version >= old.snapshot_version {
                        updated = updated.with_resume_token(change.resume_token.clone(), remote_version);
                    }
                    if should_persist_target_data(&old, &updated, change) {
                        txn.update_target_data(updated.clone());
                    }
                    target_data_by_target.insert(*target_id, updated);
                }

                for key in event.document_updates.keys() {
                    if event.resolved_limbo_documents.contains(key) {
                        txn.touch_document(key);
                    }
                }
                let (changed, existence_changed) =
                    populate_document_changes(txn, &event.document_updates);

                if !remote_version.is_min() {
                    let last = txn.target_cache().last_remote_snapshot_version();
                    if remote_version < last {
                        debug!("Ignoring remote snapshot {remote_version} older than {last}");
                    } else {
                        txn.set_last_remote_snapshot_version(remote_version);
                    }
                }
                Ok(txn.get_local_view_of_documents(changed, &existence_changed))
            })
    }

    /// Starts tracking `query` as an active target, reusing its cached target data.
    pub fn allocate_target(&mut self, query: &Query) -> SyncResult<TargetData> {
        let user_key = self.user.key();
        let target_data = self
            .persistence
            .run_transaction("Allocate target", &user_key, |txn| {
                if let Some(cached) = txn.target_cache().get_target_data(query).cloned() {
                    return Ok(cached);
                }
                let target_id = txn.allocate_target_id();
                let target_data =
                    TargetData::new(query.clone(), target_id, TargetPurpose::Listen, txn.sequence_number());
                txn.add_target_data(target_data.clone());
                Ok(target_data)
            })?;

        let target_id = target_data.target_id;
        let newer = self
            .target_data_by_target
            .get(&target_id)
            .map(|existing| target_data.snapshot_version > existing.snapshot_version)
            .unwrap_or(true);
        if newer {
            self.target_data_by_target.insert(target_id, target_data.clone());
            self.target_ids_by_canonical_id
                .insert(query.canonical_id(), target_id);
        }
        Ok(target_data)
    }

    /// Stops tracking a target. Its cached data stays until garbage collection.
    pub fn release_target(&mut self, target_id: TargetId) -> SyncResult<()> {
        let Some(target_data) = self.target_data_by_target.remove(&target_id) else {
            debug!("Ignoring release of inactive target {target_id}");
            return Ok(());
        };
        self.target_ids_by_canonical_id
            .remove(&target_data.target.canonical_id());
        let released = self.local_view_references.remove_references_for_id(target_id);

        let user_key = self.user.key();
        self.persistence
            .run_transaction("Release target", &user_key, |txn| {
                for key in &released {
                    txn.touch_document(key);
                }
                if txn.target_cache().target_data_for_id(target_id).is_some() {
                    txn.update_target_data(target_data.with_sequence_number(txn.sequence_number()));
                }
                Ok(())
            })
    }

    /// Active target data for `query`, falling back to the target cache.
    pub fn get_target_data(&self, query: &Query) -> Option<TargetData> {
        self.target_ids_by_canonical_id
            .get(&query.canonical_id())
            .and_then(|target_id| self.target_data_by_target.get(target_id))
            .cloned()
            .or_else(|| {
                self.persistence
                    .state()
                    .target_cache()
                    .get_target_data(query)
                    .cloned()
            })
    }

    /// Runs `query` against the local view.
    ///
    /// With `use_previous_results`, the target's last limbo-free result set is used
    /// as a starting point.
    pub fn execute_query(&mut self, query: &Query, use_previous_results: bool) -> SyncResult<QueryResult> {
        let target_data = self.get_target_data(query);
        let user_key = self.user.key();
        let query_engine = &self.query_engine;
        self.persistence
            .run_transaction("Execute query", &user_key, |txn| {
                let (limbo_free_version, remote_keys) = match &target_data {
                    Some(target_data) => (
                        target_data.last_limbo_free_snapshot_version,
                        txn.target_cache()
                            .matching_keys_for_target_id(target_data.target_id),
                    ),
                    None => (SnapshotVersion::min(), DocumentKeySet::new()),
                };
                let documents = if use_previous_results {
                    query_engine.get_documents_matching_query(txn, query, limbo_free_version, &remote_keys)
                } else {
                    query_engine.get_documents_matching_query(
                        txn,
                        query,
                        SnapshotVersion::min(),
                        &DocumentKeySet::new(),
                    )
                };
                Ok(QueryResult {
                    documents,
                    remote_keys,
                })
            })
    }

    pub fn read_document(&mut self, key: &DocumentKey) -> SyncResult<Document> {
        let user_key = self.user.key();
        self.persistence
            .run_transaction("Read document", &user_key, |txn| Ok(txn.get_local_document(key)))
    }

    pub fn remote_document_keys(&self, target_id: TargetId) -> DocumentKeySet {
        self.persistence
            .state()
            .target_cache()
            .matching_keys_for_target_id(target_id)
    }

    /// Records which documents each view now shows, and advances the limbo-free
    /// version of targets whose views are synced.
    pub fn notify_local_view_changes(&mut self, view_changes: &[LocalViewChanges]) -> SyncResult<()> {
        let user_key = self.user.key();
        let references = &mut self.local_view_references;
        self.persistence
            .run_transaction("Notify local view changes", &user_key, |txn| {
                for change in view_changes {
                    references.add_references(&change.added_keys, change.target_id);
                    references.remove_references(&change.removed_keys, change.target_id);
                    for key in change.added_keys.iter().chain(change.removed_keys.iter()) {
                        txn.touch_document(key);
                    }
                }
                Ok(())
            })?;

        for change in view_changes.iter().filter(|change| !change.from_cache) {
            if let Some(target_data) = self.target_data_by_target.get_mut(&change.target_id) {
                *target_data =
                    target_data.with_last_limbo_free_snapshot_version(target_data.snapshot_version);
            }
        }
        Ok(())
    }

    /// Runs one LRU pass, pinning active targets and documents shown by views.
    pub fn collect_garbage(&mut self, params: &LruParams) -> SyncResult<LruResults> {
        let active: BTreeSet<TargetId> = self.target_data_by_target.keys().copied().collect();
        let local_view_keys = self.local_view_references.keys();
        let user_key = self.user.key();
        self.persistence
            .run_transaction("Collect garbage", &user_key, |txn| {
                Ok(txn.collect_garbage(params, &active, &local_view_keys))
            })
    }
}

/// Patch capturing the pre-write values of the mutation's non-idempotent transforms.
fn base_mutation_for(mutation: &Mutation, document: &Document) -> Option<Mutation> {
    let base_value = mutation.extract_transform_base_value(document)?;
    let mask = FieldMask::new(
        mutation
            .field_transforms
            .iter()
            .filter(|transform| base_value.get(&transform.field).is_some())
            .map(|transform| transform.field.clone()),
    );
    Some(Mutation::patch(mutation.key.clone(), base_value, mask))
}

/// Writes newer remote documents to the cache.
///
/// Returns the documents that changed and the keys whose existence flipped.
fn populate_document_changes(
    txn: &mut Transaction<'_>,
    updates: &DocumentMap,
) -> (DocumentMap, DocumentKeySet) {
    let mut changed = DocumentMap::new();
    let mut existence_changed = DocumentKeySet::new();
    for (key, document) in updates {
        let existing = txn.remote_documents().get(key);
        if document.is_found_document() != existing.is_found_document() {
            existence_changed.insert(key.clone());
        }

        if document.is_no_document() && document.version().is_min() {
            // Synthesized deletes carry no version; always apply them.
            txn.remove_document(key);
            changed.insert(key.clone(), document.clone());
        } else if !existing.is_valid_document()
            || document.version() > existing.version()
            || (document.version() == existing.version() && existing.has_pending_writes())
        {
            let read_time = document.read_time();
            txn.put_document(document.clone(), read_time);
            changed.insert(key.clone(), document.clone());
        } else {
            debug!(
                "Ignoring outdated watch update for {key}: current version {}, watch version {}",
                existing.version(),
                document.version()
            );
        }
    }
    (changed, existence_changed)
}

fn should_persist_target_data(old: &TargetData, new: &TargetData, change: &TargetChange) -> bool {
    if old.resume_token.is_empty() {
        return true;
    }
    let elapsed = new.snapshot_version.timestamp().to_micros() - old.snapshot_version.timestamp().to_micros();
    if elapsed >= RESUME_TOKEN_MAX_AGE_MICROS {
        return true;
    }
    change.change_count() > 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncErrorCode;
    use crate::model::{FieldPath, MutationResult};
    use crate::test_support::{doc, key, patch_mutation, query, set_mutation, version};
    use crate::value::Value;

    fn store() -> LocalStore {
        LocalStore::new(MemoryPersistence::new(), QueryEngine::default(), User::unauthenticated())
    }

    fn field(document: &Document, name: &str) -> Option<Value> {
        document
            .field(&FieldPath::from_dot_separated(name).unwrap())
            .cloned()
    }

    fn listen(store: &mut LocalStore, path: &str) -> TargetData {
        store.allocate_target(&query(path)).unwrap()
    }

    fn event_with(target_id: TargetId, document: Document, snapshot: i64) -> RemoteEvent {
        let key = document.key().clone();
        let mut change = TargetChange {
            resume_token: vec![snapshot as u8],
            current: true,
            ..TargetChange::default()
        };
        change.added_documents.insert(key.clone());
        let mut document = document;
        document.set_read_time(version(snapshot));
        RemoteEvent {
            snapshot_version: version(snapshot),
            target_changes: BTreeMap::from([(target_id, change)]),
            document_updates: DocumentMap::from([(key, document)]),
            ..RemoteEvent::default()
        }
    }

    #[test]
    fn local_writes_are_visible_before_acknowledgement() {
        let mut store = store();
        let result = store
            .write_locally(
                vec![set_mutation("rooms/a", &[("title", Value::from_string("hi"))])],
                Timestamp::new(10, 0),
            )
            .unwrap();
        assert_eq!(result.batch_id, 1);
        assert!(result.changes[&key("rooms/a")].has_local_mutations());

        let document = store.read_document(&key("rooms/a")).unwrap();
        assert_eq!(field(&document, "title"), Some(Value::from_string("hi")));
        assert_eq!(store.highest_unacknowledged_batch_id(), 1);
    }

    #[test]
    fn acknowledgement_commits_the_write() {
        let mut store = store();
        store
            .write_locally(vec![set_mutation("rooms/a", &[("n", Value::from_integer(1))])], Timestamp::new(1, 0))
            .unwrap();
        let batch = store.next_mutation_batch_after(crate::model::BATCH_ID_UNKNOWN).unwrap();
        let result = MutationBatchResult::from(
            batch,
            version(5),
            vec![MutationResult {
                version: version(5),
                transform_results: Vec::new(),
            }],
            Vec::new(),
        )
        .unwrap();

        let changes = store.acknowledge_batch(&result).unwrap();
        let document = &changes[&key("rooms/a")];
        assert!(document.has_committed_mutations());
        assert!(!document.has_local_mutations());
        assert_eq!(document.version(), version(5));
        assert!(store.next_mutation_batch_after(crate::model::BATCH_ID_UNKNOWN).is_none());
        assert!(store
            .persistence()
            .state()
            .user_queues("anonymous")
            .overlays()
            .is_empty());
    }

    #[test]
    fn rejection_restores_the_remote_view() {
        let mut store = store();
        let target = listen(&mut store, "rooms");
        store
            .apply_remote_event(&event_with(
                target.target_id,
                doc("rooms/a", 2, &[("n", Value::from_integer(1))]),
                2,
            ))
            .unwrap();
        let written = store
            .write_locally(vec![patch_mutation("rooms/a", &[("n", Value::from_integer(2))])], Timestamp::new(3, 0))
            .unwrap();

        let restored = store.reject_batch(written.batch_id).unwrap();
        let document = &restored[&key("rooms/a")];
        assert!(!document.has_local_mutations());
        assert_eq!(field(document, "n"), Some(Value::from_integer(1)));

        let err = store.reject_batch(written.batch_id).unwrap_err();
        assert_eq!(err.code, SyncErrorCode::NotFound);
    }

    #[test]
    fn remote_event_updates_documents_targets_and_version() {
        let mut store = store();
        let target = listen(&mut store, "rooms");
        let changes = store
            .apply_remote_event(&event_with(target.target_id, doc("rooms/a", 4, &[]), 4))
            .unwrap();

        assert!(changes.contains_key(&key("rooms/a")));
        assert_eq!(store.last_remote_snapshot_version(), version(4));
        assert!(store.remote_document_keys(target.target_id).contains(&key("rooms/a")));
        let cached = store
            .persistence()
            .state()
            .target_cache()
            .target_data_for_id(target.target_id)
            .cloned()
            .unwrap();
        assert_eq!(cached.resume_token, vec![4]);
        assert_eq!(cached.snapshot_version, version(4));
    }

    #[test]
    fn outdated_documents_are_ignored() {
        let mut store = store();
        let target = listen(&mut store, "rooms");
        store
            .apply_remote_event(&event_with(target.target_id, doc("rooms/a", 5, &[("v", Value::from_integer(5))]), 5))
            .unwrap();
        let changes = store
            .apply_remote_event(&event_with(target.target_id, doc("rooms/a", 3, &[("v", Value::from_integer(3))]), 6))
            .unwrap();

        assert!(changes.is_empty());
        let document = store.read_document(&key("rooms/a")).unwrap();
        assert_eq!(field(&document, "v"), Some(Value::from_integer(5)));
    }

    #[test]
    fn resume_tokens_only_move_forward() {
        let mut store = store();
        let target = listen(&mut store, "rooms");
        store
            .apply_remote_event(&event_with(target.target_id, doc("rooms/a", 5, &[]), 5))
            .unwrap();
        store
            .apply_remote_event(&event_with(target.target_id, doc("rooms/b", 3, &[]), 3))
            .unwrap();

        let active = store.get_target_data(&query("rooms")).unwrap();
        assert_eq!(active.resume_token, vec![5]);
        assert_eq!(active.snapshot_version, version(5));
        let cached = store
            .persistence()
            .state()
            .target_cache()
            .target_data_for_id(target.target_id)
            .cloned()
            .unwrap();
        assert_eq!(cached.resume_token, vec![5]);
        assert_eq!(cached.snapshot_version, version(5));
        assert_eq!(store.last_remote_snapshot_version(), version(5));

        store
            .apply_remote_event(&event_with(target.target_id, doc("rooms/c", 7, &[]), 7))
            .unwrap();
        let advanced = store.get_target_data(&query("rooms")).unwrap();
        assert_eq!(advanced.resume_token, vec![7]);
        assert_eq!(advanced.snapshot_version, version(7));
    }

    #[test]
    fn mismatched_targets_lose_their_resume_token() {
        let mut store = store();
        let target = listen(&mut store, "rooms");
        store
            .apply_remote_event(&event_with(target.target_id, doc("rooms/a", 2, &[]), 2))
            .unwrap();
        let mut mismatch = event_with(target.target_id, doc("rooms/b", 3, &[]), 3);
        mismatch
            .target_mismatches
            .insert(target.target_id, TargetPurpose::ExistenceFilterMismatch);
        store.apply_remote_event(&mismatch).unwrap();

        let active = store.get_target_data(&query("rooms")).unwrap();
        assert!(active.resume_token.is_empty());
        assert!(active.snapshot_version.is_min());
    }

    #[test]
    fn reallocating_a_query_reuses_its_target() {
        let mut store = store();
        let first = listen(&mut store, "rooms");
        store
            .apply_remote_event(&event_with(first.target_id, doc("rooms/a", 2, &[]), 2))
            .unwrap();
        store.release_target(first.target_id).unwrap();

        let second = listen(&mut store, "rooms");
        assert_eq!(second.target_id, first.target_id);
        assert_eq!(second.resume_token, vec![2]);
    }

    #[test]
    fn execute_query_merges_cache_and_local_writes() {
        let mut store = store();
        let target = listen(&mut store, "rooms");
        store
            .apply_remote_event(&event_with(target.target_id, doc("rooms/a", 2, &[]), 2))
            .unwrap();
        store
            .write_locally(vec![set_mutation("rooms/b", &[])], Timestamp::new(3, 0))
            .unwrap();

        let result = store.execute_query(&query("rooms"), true).unwrap();
        assert_eq!(
            result.documents.keys().cloned().collect::<Vec<_>>(),
            vec![key("rooms/a"), key("rooms/b")]
        );
        assert_eq!(result.remote_keys, [key("rooms/a")].into_iter().collect());
    }

    #[test]
    fn user_change_switches_the_visible_queue() {
        let mut store = store();
        store
            .write_locally(vec![set_mutation("rooms/a", &[])], Timestamp::new(1, 0))
            .unwrap();

        let switched = store.handle_user_change(User::new("alice")).unwrap();
        assert_eq!(switched.removed_batch_ids, vec![1]);
        assert!(switched.added_batch_ids.is_empty());
        assert!(!switched.affected_documents[&key("rooms/a")].is_found_document());
        assert_eq!(store.highest_unacknowledged_batch_id(), crate::model::BATCH_ID_UNKNOWN);

        let back = store.handle_user_change(User::unauthenticated()).unwrap();
        assert_eq!(back.added_batch_ids, vec![1]);
        assert!(back.affected_documents[&key("rooms/a")].has_local_mutations());
    }
}
