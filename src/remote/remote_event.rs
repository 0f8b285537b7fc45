use std::collections::BTreeMap;

use crate::local::target_data::TargetPurpose;
use crate::model::{DocumentKeySet, DocumentMap, SnapshotVersion, TargetId};

/// Result of folding a run of watch messages up to one consistent snapshot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RemoteEvent {
    pub snapshot_version: SnapshotVersion,
    pub target_changes: BTreeMap<TargetId, TargetChange>,
    /// Targets whose cached results must be discarded, with the purpose to re-listen under.
    pub target_mismatches: BTreeMap<TargetId, TargetPurpose>,
    pub document_updates: DocumentMap,
    /// Documents only referenced by limbo targets.
    pub resolved_limbo_documents: DocumentKeySet,
}

impl RemoteEvent {
    /// Event that only marks `target_id` current, used when a listen ends without a
    /// server snapshot (limbo rejection, synthesized deletes).
    pub fn synthesized_current_change(
        target_id: TargetId,
        current: bool,
        resume_token: Vec<u8>,
    ) -> BTreeMap<TargetId, TargetChange> {
        BTreeMap::from([(
            target_id,
            TargetChange {
                resume_token,
                current,
                ..TargetChange::default()
            },
        )])
    }

    pub fn is_empty(&self) -> bool {
        self.target_changes.is_empty()
            && self.target_mismatches.is_empty()
            && self.document_updates.is_empty()
            && self.resolved_limbo_documents.is_empty()
    }
}

/// Changes to one target's membership since the previous snapshot.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TargetChange {
    /// Empty when the server sent no new token.
    pub resume_token: Vec<u8>,
    pub current: bool,
    pub added_documents: DocumentKeySet,
    pub modified_documents: DocumentKeySet,
    pub removed_documents: DocumentKeySet,
}

impl TargetChange {
    pub fn change_count(&self) -> usize {
        self.added_documents.len() + self.modified_documents.len() + self.removed_documents.len()
    }
}
