use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};

use crate::local::target_data::{TargetData, TargetPurpose};
use crate::model::{Document, DocumentKey, DocumentKeySet, DocumentMap, SnapshotVersion, TargetId};
use crate::remote::bloom_filter::BloomFilter;
use crate::remote::remote_event::{RemoteEvent, TargetChange};
use crate::remote::watch_change::{
    DocumentWatchChange, ExistenceFilterChange, TargetChangeState, WatchTargetChange,
};

/// What the aggregator needs to know about targets the local store is tracking.
pub trait TargetMetadataProvider {
    /// Keys the local store believes currently match the target.
    fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet;

    /// `None` once the target is no longer listened to.
    fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData>;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Debug)]
struct TargetState {
    /// Outstanding add/remove requests; changes are ignored while non-zero.
    pending_responses: i32,
    document_changes: BTreeMap<DocumentKey, ChangeType>,
    resume_token: Vec<u8>,
    current: bool,
    has_pending_changes: bool,
}

impl TargetState {
    fn new() -> Self {
        Self {
            pending_responses: 0,
            document_changes: BTreeMap::new(),
            resume_token: Vec::new(),
            current: false,
            has_pending_changes: true,
        }
    }

    fn is_pending(&self) -> bool {
        self.pending_responses != 0
    }

    fn update_resume_token(&mut self, resume_token: &[u8]) {
        if !resume_token.is_empty() {
            self.has_pending_changes = true;
            self.resume_token = resume_token.to_vec();
        }
    }

    fn to_target_change(&self) -> TargetChange {
        let mut change = TargetChange {
            resume_token: self.resume_token.clone(),
            current: self.current,
            ..TargetChange::default()
        };
        for (key, change_type) in &self.document_changes {
            let bucket = match change_type {
                ChangeType::Added => &mut change.added_documents,
                ChangeType::Modified => &mut change.modified_documents,
                ChangeType::Removed => &mut change.removed_documents,
            };
            bucket.insert(key.clone());
        }
        change
    }

    fn clear_pending_changes(&mut self) {
        self.has_pending_changes = false;
        self.document_changes.clear();
    }

    fn add_document_change(&mut self, key: DocumentKey, change_type: ChangeType) {
        self.has_pending_changes = true;
        self.document_changes.insert(key, change_type);
    }

    fn remove_document_change(&mut self, key: &DocumentKey) {
        self.has_pending_changes = true;
        self.document_changes.remove(key);
    }

    fn record_pending_target_request(&mut self) {
        self.pending_responses += 1;
    }

    fn record_target_response(&mut self) {
        self.pending_responses -= 1;
    }

    fn mark_current(&mut self) {
        self.has_pending_changes = true;
        self.current = true;
    }
}

/// Result of checking an existence filter mismatch against its bloom filter.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum BloomFilterApplication {
    /// No usable filter was sent.
    Skipped,
    /// Pruning with the filter still left the count wrong.
    FalsePositive,
    Success,
}

/// Folds watch messages into [`RemoteEvent`]s.
///
/// Changes accumulate per target until the stream reports a consistent snapshot,
/// at which point [`create_remote_event`](Self::create_remote_event) drains them.
#[derive(Debug, Default)]
pub struct WatchChangeAggregator {
    target_states: BTreeMap<TargetId, TargetState>,
    pending_document_updates: DocumentMap,
    /// Every target each pending update touches.
    pending_document_target_mapping: BTreeMap<DocumentKey, BTreeSet<TargetId>>,
    pending_target_resets: BTreeMap<TargetId, TargetPurpose>,
}

impl WatchChangeAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle_document_change(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        change: DocumentWatchChange,
    ) {
        for target_id in &change.updated_target_ids {
            match &change.document {
                Some(document) if document.is_found_document() => {
                    self.add_document_to_target(metadata, *target_id, document.clone());
                }
                Some(document) if document.is_no_document() => {
                    self.remove_document_from_target(
                        metadata,
                        *target_id,
                        &change.key,
                        Some(document.clone()),
                    );
                }
                _ => {}
            }
        }
        for target_id in &change.removed_target_ids {
            self.remove_document_from_target(metadata, *target_id, &change.key, change.document.clone());
        }
    }

    pub fn handle_target_change(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        change: &WatchTargetChange,
    ) {
        for target_id in self.target_ids_for_change(change) {
            match change.state {
                TargetChangeState::NoChange => {
                    if self.is_active_target(metadata, target_id) {
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Add => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        // A fresh add replaces whatever the previous listen accumulated.
                        state.clear_pending_changes();
                    }
                    state.update_resume_token(&change.resume_token);
                }
                TargetChangeState::Remove => {
                    let state = self.ensure_target_state(target_id);
                    state.record_target_response();
                    if !state.is_pending() {
                        self.target_states.remove(&target_id);
                    }
                }
                TargetChangeState::Current => {
                    if self.is_active_target(metadata, target_id) {
                        let state = self.ensure_target_state(target_id);
                        state.mark_current();
                        state.update_resume_token(&change.resume_token);
                    }
                }
                TargetChangeState::Reset => {
                    if self.is_active_target(metadata, target_id) {
                        self.reset_target(metadata, target_id);
                        self.ensure_target_state(target_id)
                            .update_resume_token(&change.resume_token);
                    }
                }
            }
        }
    }

    fn target_ids_for_change(&self, change: &WatchTargetChange) -> Vec<TargetId> {
        if change.target_ids.is_empty() {
            self.target_states.keys().copied().collect()
        } else {
            change.target_ids.clone()
        }
    }

    pub fn handle_existence_filter(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        filter: &ExistenceFilterChange,
    ) {
        let target_id = filter.target_id;
        let expected_count = filter.count;
        let Some(target_data) = self.target_data_for_active_target(metadata, target_id) else {
            return;
        };

        if target_data.target.is_document_query() {
            if expected_count == 0 {
                // The document was deleted while the client was not listening.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    let document = Document::new_no_document(key.clone(), SnapshotVersion::min());
                    self.remove_document_from_target(metadata, target_id, &key, Some(document));
                }
            } else if expected_count != 1 {
                warn!("Single document existence filter for target {target_id} reported count {expected_count}");
            }
            return;
        }

        let current_count = self.current_document_count_for_target(metadata, target_id);
        if current_count == expected_count as usize {
            return;
        }

        let status = self.apply_bloom_filter(metadata, filter, current_count);
        if status != BloomFilterApplication::Success {
            debug!(
                "Existence filter mismatch for target {target_id}: local {current_count}, server {expected_count}"
            );
            self.reset_target(metadata, target_id);
            let purpose = if status == BloomFilterApplication::FalsePositive {
                TargetPurpose::ExistenceFilterMismatchBloom
            } else {
                TargetPurpose::ExistenceFilterMismatch
            };
            self.pending_target_resets.insert(target_id, purpose);
        }
    }

    fn apply_bloom_filter(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        filter: &ExistenceFilterChange,
        current_count: usize,
    ) -> BloomFilterApplication {
        let Some(params) = &filter.unchanged_names else {
            return BloomFilterApplication::Skipped;
        };
        let bloom_filter =
            match BloomFilter::new(params.bitmap.clone(), params.padding, params.hash_count) {
                Ok(bloom_filter) => bloom_filter,
                Err(err) => {
                    warn!("Applying bloom filter failed: {err}");
                    return BloomFilterApplication::Skipped;
                }
            };
        if bloom_filter.bit_count() == 0 {
            return BloomFilterApplication::Skipped;
        }

        let removed = self.filter_removed_documents(metadata, &bloom_filter, filter.target_id);
        if current_count.saturating_sub(removed) == filter.count as usize {
            BloomFilterApplication::Success
        } else {
            BloomFilterApplication::FalsePositive
        }
    }

    /// Removes every cached key the filter reports absent; returns how many.
    fn filter_removed_documents(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        bloom_filter: &BloomFilter,
        target_id: TargetId,
    ) -> usize {
        let mut removed = 0;
        for key in metadata.remote_keys_for_target(target_id) {
            if !bloom_filter.might_contain(&key.path().canonical_string()) {
                self.remove_document_from_target(metadata, target_id, &key, None);
                removed += 1;
            }
        }
        removed
    }

    /// Drains everything accumulated so far into one event at `snapshot_version`.
    pub fn create_remote_event(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        snapshot_version: SnapshotVersion,
    ) -> RemoteEvent {
        let mut target_changes = BTreeMap::new();

        let target_ids: Vec<TargetId> = self.target_states.keys().copied().collect();
        for target_id in target_ids {
            let Some(target_data) = self.target_data_for_active_target(metadata, target_id) else {
                continue;
            };
            let Some(state) = self.target_states.get(&target_id) else {
                continue;
            };
            if state.current && target_data.target.is_document_query() {
                // A current document target that never mentioned its document means
                // the document does not exist.
                if let Ok(key) = DocumentKey::from_path(target_data.target.path().clone()) {
                    if !self.pending_document_updates.contains_key(&key)
                        && !self.target_contains_document(metadata, target_id, &key)
                    {
                        self.remove_document_from_target(
                            metadata,
                            target_id,
                            &key,
                            Some(Document::new_no_document(key.clone(), snapshot_version)),
                        );
                    }
                }
            }

            if let Some(state) = self.target_states.get_mut(&target_id) {
                if state.has_pending_changes {
                    target_changes.insert(target_id, state.to_target_change());
                    state.clear_pending_changes();
                }
            }
        }

        let mut resolved_limbo_documents = DocumentKeySet::new();
        for (key, target_ids) in &self.pending_document_target_mapping {
            let only_limbo = target_ids.iter().all(|target_id| {
                self.target_data_for_active_target(metadata, *target_id)
                    .map(|target_data| target_data.purpose == TargetPurpose::LimboResolution)
                    .unwrap_or(true)
            });
            if only_limbo {
                resolved_limbo_documents.insert(key.clone());
            }
        }

        let mut document_updates = std::mem::take(&mut self.pending_document_updates);
        for document in document_updates.values_mut() {
            document.set_read_time(snapshot_version);
        }
        self.pending_document_target_mapping.clear();

        RemoteEvent {
            snapshot_version,
            target_changes,
            target_mismatches: std::mem::take(&mut self.pending_target_resets),
            document_updates,
            resolved_limbo_documents,
        }
    }

    fn add_document_to_target(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        target_id: TargetId,
        document: Document,
    ) {
        if !self.is_active_target(metadata, target_id) {
            return;
        }
        let key = document.key().clone();
        let change_type = if self.target_contains_document(metadata, target_id, &key) {
            ChangeType::Modified
        } else {
            ChangeType::Added
        };
        self.ensure_target_state(target_id)
            .add_document_change(key.clone(), change_type);
        self.pending_document_updates.insert(key.clone(), document);
        self.pending_document_target_mapping
            .entry(key)
            .or_default()
            .insert(target_id);
    }

    /// Removes `key` from the target; `document`, when known, is recorded as the
    /// key's new state.
    fn remove_document_from_target(
        &mut self,
        metadata: &dyn TargetMetadataProvider,
        target_id: TargetId,
        key: &DocumentKey,
        document: Option<Document>,
    ) {
        if !self.is_active_target(metadata, target_id) {
            return;
        }
        let contained = self.target_contains_document(metadata, target_id, key);
        let state = self.ensure_target_state(target_id);
        if contained {
            state.add_document_change(key.clone(), ChangeType::Removed);
        } else {
            // The server told us about a document the client never saw.
            state.remove_document_change(key);
        }
        self.pending_document_target_mapping
            .entry(key.clone())
            .or_default()
            .insert(target_id);
        if let Some(document) = document {
            self.pending_document_updates.insert(key.clone(), document);
        }
    }

    /// Drops all accumulated state for a target that is no longer listened to.
    pub fn remove_target(&mut self, target_id: TargetId) {
        self.target_states.remove(&target_id);
    }

    /// Called when an add or remove request for `target_id` is sent.
    pub fn record_pending_target_request(&mut self, target_id: TargetId) {
        self.ensure_target_state(target_id).record_pending_target_request();
    }

    fn current_document_count_for_target(
        &self,
        metadata: &dyn TargetMetadataProvider,
        target_id: TargetId,
    ) -> usize {
        let remote = metadata.remote_keys_for_target(target_id).len();
        let Some(state) = self.target_states.get(&target_id) else {
            return remote;
        };
        let added = state
            .document_changes
            .values()
            .filter(|change| **change == ChangeType::Added)
            .count();
        let removed = state
            .document_changes
            .values()
            .filter(|change| **change == ChangeType::Removed)
            .count();
        (remote + added).saturating_sub(removed)
    }

    fn ensure_target_state(&mut self, target_id: TargetId) -> &mut TargetState {
        self.target_states
            .entry(target_id)
            .or_insert_with(TargetState::new)
    }

    fn is_active_target(&self, metadata: &dyn TargetMetadataProvider, target_id: TargetId) -> bool {
        self.target_data_for_active_target(metadata, target_id).is_some()
    }

    fn target_data_for_active_target(
        &self,
        metadata: &dyn TargetMetadataProvider,
        target_id: TargetId,
    ) -> Option<TargetData> {
        let pending = self
            .target_states
            .get(&target_id)
            .map(TargetState::is_pending)
            .unwrap_or(false);
        if pending {
            None
        } else {
            metadata.target_data_for_target(target_id)
        }
    }

    /// Forgets everything about the target and emits its known keys as removed.
    fn reset_target(&mut self, metadata: &dyn TargetMetadataProvider, target_id: TargetId) {
        self.target_states.insert(target_id, TargetState::new());
        for key in metadata.remote_keys_for_target(target_id) {
            self.remove_document_from_target(metadata, target_id, &key, None);
        }
    }

    fn target_contains_document(
        &self,
        metadata: &dyn TargetMetadataProvider,
        target_id: TargetId,
        key: &DocumentKey,
    ) -> bool {
        metadata.remote_keys_for_target(target_id).contains(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Query;
    use crate::remote::watch_change::BloomFilterParams;
    use crate::test_support::{doc, key, query, version};

    #[derive(Default)]
    struct FakeMetadata {
        targets: BTreeMap<TargetId, TargetData>,
        remote_keys: BTreeMap<TargetId, DocumentKeySet>,
    }

    impl FakeMetadata {
        fn with_target(mut self, target_id: TargetId, query: Query, keys: &[&str]) -> Self {
            self.targets.insert(
                target_id,
                TargetData::new(query, target_id, TargetPurpose::Listen, 1),
            );
            self.remote_keys
                .insert(target_id, keys.iter().map(|path| key(path)).collect());
            self
        }

        fn with_limbo_target(mut self, target_id: TargetId, path: &str) -> Self {
            self.targets.insert(
                target_id,
                TargetData::new(Query::document(&key(path)), target_id, TargetPurpose::LimboResolution, 1),
            );
            self
        }
    }

    impl TargetMetadataProvider for FakeMetadata {
        fn remote_keys_for_target(&self, target_id: TargetId) -> DocumentKeySet {
            self.remote_keys.get(&target_id).cloned().unwrap_or_default()
        }

        fn target_data_for_target(&self, target_id: TargetId) -> Option<TargetData> {
            self.targets.get(&target_id).cloned()
        }
    }

    fn document_change(updated: &[TargetId], removed: &[TargetId], document: Document) -> DocumentWatchChange {
        DocumentWatchChange {
            updated_target_ids: updated.to_vec(),
            removed_target_ids: removed.to_vec(),
            key: document.key().clone(),
            document: Some(document),
        }
    }

    fn target_change(state: TargetChangeState, target_ids: &[TargetId], token: &[u8]) -> WatchTargetChange {
        let mut change = WatchTargetChange::new(state, target_ids.to_vec());
        change.resume_token = token.to_vec();
        change
    }

    #[test]
    fn classifies_added_and_modified_documents() {
        let metadata = FakeMetadata::default().with_target(2, query("rooms"), &["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_document_change(&metadata, document_change(&[2], &[], doc("rooms/a", 2, &[])));
        aggregator.handle_document_change(&metadata, document_change(&[2], &[], doc("rooms/b", 2, &[])));
        aggregator.handle_target_change(&metadata, &target_change(TargetChangeState::Current, &[2], b"t1"));

        let event = aggregator.create_remote_event(&metadata, version(3));
        let change = &event.target_changes[&2];
        assert!(change.current);
        assert_eq!(change.resume_token, b"t1".to_vec());
        assert!(change.modified_documents.contains(&key("rooms/a")));
        assert!(change.added_documents.contains(&key("rooms/b")));
        assert_eq!(event.document_updates.len(), 2);
        assert_eq!(event.document_updates[&key("rooms/b")].read_time(), version(3));
        assert!(event.resolved_limbo_documents.is_empty());
    }

    #[test]
    fn ignores_changes_while_a_target_request_is_pending() {
        let metadata = FakeMetadata::default().with_target(2, query("rooms"), &[]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.record_pending_target_request(2);
        aggregator.handle_document_change(&metadata, document_change(&[2], &[], doc("rooms/a", 2, &[])));
        assert!(aggregator.create_remote_event(&metadata, version(2)).document_updates.is_empty());

        aggregator.handle_target_change(&metadata, &target_change(TargetChangeState::Add, &[2], b""));
        aggregator.handle_document_change(&metadata, document_change(&[2], &[], doc("rooms/a", 2, &[])));
        let event = aggregator.create_remote_event(&metadata, version(3));
        assert!(event.target_changes[&2].added_documents.contains(&key("rooms/a")));
    }

    #[test]
    fn reset_emits_known_keys_as_removed_unless_readded() {
        let metadata = FakeMetadata::default().with_target(2, query("rooms"), &["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_target_change(&metadata, &target_change(TargetChangeState::Reset, &[2], b""));
        aggregator.handle_document_change(&metadata, document_change(&[2], &[], doc("rooms/b", 4, &[])));

        let event = aggregator.create_remote_event(&metadata, version(4));
        let change = &event.target_changes[&2];
        assert_eq!(change.removed_documents, [key("rooms/a")].into_iter().collect());
        assert_eq!(change.modified_documents, [key("rooms/b")].into_iter().collect());
    }

    #[test]
    fn existence_filter_mismatch_without_bloom_filter_resets_target() {
        let metadata = FakeMetadata::default().with_target(2, query("rooms"), &["rooms/a", "rooms/b"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_existence_filter(
            &metadata,
            &ExistenceFilterChange {
                target_id: 2,
                count: 1,
                unchanged_names: None,
            },
        );
        let event = aggregator.create_remote_event(&metadata, version(5));
        assert_eq!(event.target_mismatches[&2], TargetPurpose::ExistenceFilterMismatch);
        assert_eq!(event.target_changes[&2].removed_documents.len(), 2);
    }

    #[test]
    fn bloom_filter_prunes_missing_documents() {
        let metadata = FakeMetadata::default().with_target(2, query("rooms"), &["rooms/a", "rooms/b"]);
        let filter = BloomFilter::build(["rooms/a"], 256, 5).unwrap();
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_existence_filter(
            &metadata,
            &ExistenceFilterChange {
                target_id: 2,
                count: 1,
                unchanged_names: Some(BloomFilterParams {
                    bitmap: filter.bitmap().to_vec(),
                    padding: filter.padding(),
                    hash_count: filter.hash_count() as i32,
                }),
            },
        );
        let event = aggregator.create_remote_event(&metadata, version(5));
        assert!(event.target_mismatches.is_empty());
        assert_eq!(
            event.target_changes[&2].removed_documents,
            [key("rooms/b")].into_iter().collect()
        );
    }

    #[test]
    fn bloom_filter_false_positive_is_flagged() {
        let metadata = FakeMetadata::default().with_target(2, query("rooms"), &["rooms/a", "rooms/b"]);
        // Contains both keys, so nothing is pruned and the count stays wrong.
        let filter = BloomFilter::build(["rooms/a", "rooms/b"], 256, 5).unwrap();
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_existence_filter(
            &metadata,
            &ExistenceFilterChange {
                target_id: 2,
                count: 1,
                unchanged_names: Some(BloomFilterParams {
                    bitmap: filter.bitmap().to_vec(),
                    padding: filter.padding(),
                    hash_count: filter.hash_count() as i32,
                }),
            },
        );
        let event = aggregator.create_remote_event(&metadata, version(5));
        assert_eq!(event.target_mismatches[&2], TargetPurpose::ExistenceFilterMismatchBloom);
    }

    #[test]
    fn current_limbo_target_without_document_synthesizes_delete() {
        let metadata = FakeMetadata::default().with_limbo_target(1, "rooms/gone");
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_target_change(&metadata, &target_change(TargetChangeState::Current, &[1], b"t"));

        let event = aggregator.create_remote_event(&metadata, version(6));
        let document = &event.document_updates[&key("rooms/gone")];
        assert!(document.is_no_document());
        assert_eq!(document.version(), version(6));
        assert!(event.resolved_limbo_documents.contains(&key("rooms/gone")));
    }

    #[test]
    fn zero_count_filter_deletes_single_document_target() {
        let metadata = FakeMetadata::default().with_target(2, Query::document(&key("rooms/a")), &["rooms/a"]);
        let mut aggregator = WatchChangeAggregator::new();
        aggregator.handle_existence_filter(
            &metadata,
            &ExistenceFilterChange {
                target_id: 2,
                count: 0,
                unchanged_names: None,
            },
        );
        let event = aggregator.create_remote_event(&metadata, version(7));
        assert!(event.document_updates[&key("rooms/a")].is_no_document());
        assert!(event.target_mismatches.is_empty());
    }
}
