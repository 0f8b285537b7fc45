use std::collections::BTreeMap;

use crate::core::{Query, TargetIdGenerator};
use crate::local::persistence::{StorageChange, Transaction};
use crate::local::reference_set::ReferenceSet;
use crate::local::target_data::TargetData;
use crate::model::{DocumentKey, DocumentKeySet, ListenSequenceNumber, SnapshotVersion, TargetId};

/// Metadata shared by all targets.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TargetGlobals {
    pub highest_target_id: TargetId,
    pub highest_listen_sequence_number: ListenSequenceNumber,
    pub last_remote_snapshot_version: SnapshotVersion,
}

/// Cached targets plus the documents the server said match each of them.
#[derive(Debug, Default)]
pub struct TargetCache {
    targets: BTreeMap<TargetId, TargetData>,
    ids_by_canonical_id: BTreeMap<String, TargetId>,
    references: ReferenceSet,
    globals: TargetGlobals,
}

impl TargetCache {
    pub fn get_target_data(&self, query: &Query) -> Option<&TargetData> {
        self.ids_by_canonical_id
            .get(&query.canonical_id())
            .and_then(|target_id| self.targets.get(target_id))
    }

    pub fn target_data_for_id(&self, target_id: TargetId) -> Option<&TargetData> {
        self.targets.get(&target_id)
    }

    pub fn targets(&self) -> impl Iterator<Item = &TargetData> {
        self.targets.values()
    }

    pub fn target_count(&self) -> usize {
        self.targets.len()
    }

    pub fn matching_keys_for_target_id(&self, target_id: TargetId) -> DocumentKeySet {
        self.references.references_for_id(target_id)
    }

    /// Whether any cached target still references `key`.
    pub fn contains_key(&self, key: &DocumentKey) -> bool {
        self.references.contains_key(key)
    }

    pub fn globals(&self) -> TargetGlobals {
        self.globals
    }

    pub fn last_remote_snapshot_version(&self) -> SnapshotVersion {
        self.globals.last_remote_snapshot_version
    }

    pub(crate) fn put(&mut self, target_data: TargetData) -> Option<TargetData> {
        self.ids_by_canonical_id
            .insert(target_data.target.canonical_id(), target_data.target_id);
        self.targets.insert(target_data.target_id, target_data)
    }

    pub(crate) fn remove(&mut self, target_id: TargetId) -> Option<TargetData> {
        let removed = self.targets.remove(&target_id)?;
        let canonical_id = removed.target.canonical_id();
        if self.ids_by_canonical_id.get(&canonical_id) == Some(&target_id) {
            self.ids_by_canonical_id.remove(&canonical_id);
        }
        Some(removed)
    }

    pub(crate) fn add_reference(&mut self, key: DocumentKey, target_id: TargetId) -> bool {
        if self.references.contains_reference(&key, target_id) {
            return false;
        }
        self.references.add_reference(key, target_id);
        true
    }

    pub(crate) fn remove_reference(&mut self, key: &DocumentKey, target_id: TargetId) -> bool {
        self.references.remove_reference(key, target_id)
    }

    pub(crate) fn set_globals(&mut self, globals: TargetGlobals) -> TargetGlobals {
        std::mem::replace(&mut self.globals, globals)
    }
}

impl Transaction<'_> {
    /// Reserves the next even target id.
    pub fn allocate_target_id(&mut self) -> TargetId {
        let mut globals = self.target_cache().globals();
        let target_id = TargetIdGenerator::for_target_cache(globals.highest_target_id).next();
        globals.highest_target_id = target_id;
        self.record(StorageChange::PutTargetGlobals(globals));
        target_id
    }

    pub fn add_target_data(&mut self, target_data: TargetData) {
        self.save_target_data(target_data);
    }

    pub fn update_target_data(&mut self, target_data: TargetData) {
        self.save_target_data(target_data);
    }

    /// Removes the target and releases every document it referenced.
    pub fn remove_target_data(&mut self, target_id: TargetId) {
        let keys = self.target_cache().matching_keys_for_target_id(target_id);
        self.remove_matching_keys(&keys, target_id);
        if self.target_cache().target_data_for_id(target_id).is_some() {
            self.record(StorageChange::RemoveTarget(target_id));
        }
    }

    pub fn add_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId) {
        for key in keys {
            self.record(StorageChange::AddTargetDocument {
                target_id,
                key: key.clone(),
            });
            self.touch_document(key);
        }
    }

    pub fn remove_matching_keys(&mut self, keys: &DocumentKeySet, target_id: TargetId) {
        for key in keys {
            self.record(StorageChange::RemoveTargetDocument {
                target_id,
                key: key.clone(),
            });
            self.touch_document(key);
        }
    }

    pub fn set_last_remote_snapshot_version(&mut self, version: SnapshotVersion) {
        let mut globals = self.target_cache().globals();
        globals.last_remote_snapshot_version = version;
        self.record(StorageChange::PutTargetGlobals(globals));
    }

    fn save_target_data(&mut self, target_data: TargetData) {
        let mut globals = self.target_cache().globals();
        let mut changed = false;
        if target_data.target_id > globals.highest_target_id {
            globals.highest_target_id = target_data.target_id;
            changed = true;
        }
        if target_data.sequence_number > globals.highest_listen_sequence_number {
            globals.highest_listen_sequence_number = target_data.sequence_number;
            changed = true;
        }
        self.record(StorageChange::PutTarget(target_data));
        if changed {
            self.record(StorageChange::PutTargetGlobals(globals));
        }
    }
}
