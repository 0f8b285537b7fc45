use std::cmp::Ordering;
use std::collections::BTreeMap;

use log::warn;

use crate::core::Query;
use crate::model::{Document, DocumentKey, DocumentKeySet};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
    /// Only the document's pending-write state changed.
    Metadata,
}

impl ChangeType {
    /// Removals sort first, then additions, then modifications.
    fn rank(self) -> u8 {
        match self {
            ChangeType::Removed => 0,
            ChangeType::Added => 1,
            ChangeType::Modified | ChangeType::Metadata => 2,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DocumentViewChange {
    pub change_type: ChangeType,
    pub document: Document,
}

/// Accumulates per-document view changes, folding repeated changes to the same key.
#[derive(Clone, Debug, Default)]
pub struct DocumentChangeSet {
    changes: BTreeMap<DocumentKey, DocumentViewChange>,
}

impl DocumentChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, change: DocumentViewChange) {
        let key = change.document.key().clone();
        let Some(old) = self.changes.get(&key) else {
            self.changes.insert(key, change);
            return;
        };

        use ChangeType::*;
        let merged = match (old.change_type, change.change_type) {
            (Metadata, new) if new != Added => Some(change),
            (old_type, Metadata) if old_type != Removed => Some(DocumentViewChange {
                change_type: old_type,
                document: change.document,
            }),
            (Modified, Modified) => Some(change),
            (Added, Modified) => Some(DocumentViewChange {
                change_type: Added,
                document: change.document,
            }),
            (Added, Removed) => None,
            (Modified, Removed) => Some(DocumentViewChange {
                change_type: Removed,
                document: old.document.clone(),
            }),
            (Removed, Added) => Some(DocumentViewChange {
                change_type: Modified,
                document: change.document,
            }),
            (old_type, new_type) => {
                warn!("Unexpected view change {new_type:?} after {old_type:?} for {key}");
                Some(change)
            }
        };

        match merged {
            Some(merged) => {
                self.changes.insert(key, merged);
            }
            None => {
                self.changes.remove(&key);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn into_changes(self) -> Vec<DocumentViewChange> {
        self.changes.into_values().collect()
    }
}

/// The documents of a view, kept in query order with lookup by key.
#[derive(Clone, Debug)]
pub struct DocumentSet {
    query: Query,
    by_key: BTreeMap<DocumentKey, Document>,
    sorted: Vec<Document>,
}

impl DocumentSet {
    pub fn new(query: &Query) -> Self {
        Self {
            query: query.clone(),
            by_key: BTreeMap::new(),
            sorted: Vec::new(),
        }
    }

    /// Empty set ordered like `other`.
    pub fn empty_like(other: &DocumentSet) -> Self {
        Self::new(&other.query)
    }

    pub fn len(&self) -> usize {
        self.sorted.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sorted.is_empty()
    }

    pub fn contains(&self, key: &DocumentKey) -> bool {
        self.by_key.contains_key(key)
    }

    pub fn get(&self, key: &DocumentKey) -> Option<&Document> {
        self.by_key.get(key)
    }

    pub fn first(&self) -> Option<&Document> {
        self.sorted.first()
    }

    pub fn last(&self) -> Option<&Document> {
        self.sorted.last()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Document> {
        self.sorted.iter()
    }

    pub fn keys(&self) -> DocumentKeySet {
        self.by_key.keys().cloned().collect()
    }

    pub fn compare(&self, left: &Document, right: &Document) -> Ordering {
        self.query.compare(left, right)
    }

    /// Inserts `document`, replacing any previous version of it.
    pub fn insert(&mut self, document: Document) {
        self.remove(document.key());
        let position = self
            .sorted
            .partition_point(|existing| self.query.compare(existing, &document) == Ordering::Less);
        self.sorted.insert(position, document.clone());
        self.by_key.insert(document.key().clone(), document);
    }

    pub fn remove(&mut self, key: &DocumentKey) -> Option<Document> {
        let removed = self.by_key.remove(key)?;
        self.sorted.retain(|document| document.key() != key);
        Some(removed)
    }
}

impl PartialEq for DocumentSet {
    fn eq(&self, other: &Self) -> bool {
        self.sorted == other.sorted
    }
}

/// Whether a snapshot came from the local cache and whether it shows unacknowledged
/// local writes.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SnapshotMetadata {
    has_pending_writes: bool,
    from_cache: bool,
}

impl SnapshotMetadata {
    pub fn new(from_cache: bool, has_pending_writes: bool) -> Self {
        Self {
            has_pending_writes,
            from_cache,
        }
    }

    pub fn from_cache(&self) -> bool {
        self.from_cache
    }

    pub fn has_pending_writes(&self) -> bool {
        self.has_pending_writes
    }
}

/// One emitted state of a query view.
#[derive(Clone, Debug, PartialEq)]
pub struct ViewSnapshot {
    pub query: Query,
    pub docs: DocumentSet,
    pub old_docs: DocumentSet,
    pub doc_changes: Vec<DocumentViewChange>,
    /// Keys of documents in `docs` with unacknowledged local writes.
    pub mutated_keys: DocumentKeySet,
    pub from_cache: bool,
    pub sync_state_changed: bool,
    pub excludes_metadata_changes: bool,
    /// The target had a resume token, so the cache may be trusted as a prior result.
    pub has_cached_results: bool,
}

impl ViewSnapshot {
    /// Snapshot reporting every document in `documents` as added.
    pub fn from_initial_documents(
        query: Query,
        documents: DocumentSet,
        mutated_keys: DocumentKeySet,
        from_cache: bool,
        has_cached_results: bool,
    ) -> Self {
        let doc_changes = documents
            .iter()
            .map(|document| DocumentViewChange {
                change_type: ChangeType::Added,
                document: document.clone(),
            })
            .collect();
        Self {
            query,
            old_docs: DocumentSet::empty_like(&documents),
            docs: documents,
            doc_changes,
            mutated_keys,
            from_cache,
            sync_state_changed: true,
            excludes_metadata_changes: false,
            has_cached_results,
        }
    }

    pub fn has_pending_writes(&self) -> bool {
        !self.mutated_keys.is_empty()
    }

    pub fn metadata(&self) -> SnapshotMetadata {
        SnapshotMetadata::new(self.from_cache, self.has_pending_writes())
    }

    /// Same snapshot without the metadata-only document changes.
    pub fn without_metadata_changes(&self) -> Self {
        let mut snapshot = self.clone();
        snapshot
            .doc_changes
            .retain(|change| change.change_type != ChangeType::Metadata);
        snapshot.excludes_metadata_changes = true;
        snapshot
    }
}

pub(crate) fn compare_changes(set: &DocumentSet, left: &DocumentViewChange, right: &DocumentViewChange) -> Ordering {
    left.change_type
        .rank()
        .cmp(&right.change_type.rank())
        .then_with(|| set.compare(&left.document, &right.document))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Direction;
    use crate::test_support::{doc, query};
    use crate::value::Value;

    fn change(change_type: ChangeType, document: Document) -> DocumentViewChange {
        DocumentViewChange { change_type, document }
    }

    #[test]
    fn document_set_keeps_query_order() {
        let ordered = query("rooms")
            .order_by("rank", Direction::Descending)
            .unwrap();
        let mut set = DocumentSet::new(&ordered);
        set.insert(doc("rooms/a", 1, &[("rank", Value::from_integer(1))]));
        set.insert(doc("rooms/b", 1, &[("rank", Value::from_integer(3))]));
        set.insert(doc("rooms/c", 1, &[("rank", Value::from_integer(2))]));

        let keys: Vec<String> = set.iter().map(|document| document.key().to_string()).collect();
        assert_eq!(keys, vec!["rooms/b", "rooms/c", "rooms/a"]);

        set.insert(doc("rooms/a", 2, &[("rank", Value::from_integer(9))]));
        assert_eq!(set.first().unwrap().key().to_string(), "rooms/a");
        assert_eq!(set.len(), 3);

        assert!(set.remove(&crate::test_support::key("rooms/b")).is_some());
        assert_eq!(set.len(), 2);
        assert!(!set.contains(&crate::test_support::key("rooms/b")));
    }

    #[test]
    fn change_set_folds_repeated_changes() {
        let a1 = doc("rooms/a", 1, &[]);
        let a2 = doc("rooms/a", 2, &[]);

        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Added, a1.clone()));
        set.track(change(ChangeType::Modified, a2.clone()));
        assert_eq!(set.clone().into_changes(), vec![change(ChangeType::Added, a2.clone())]);

        set.track(change(ChangeType::Removed, a2.clone()));
        assert!(set.is_empty());

        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Removed, a1.clone()));
        set.track(change(ChangeType::Added, a2.clone()));
        assert_eq!(set.into_changes(), vec![change(ChangeType::Modified, a2.clone())]);

        let mut set = DocumentChangeSet::new();
        set.track(change(ChangeType::Modified, a1.clone()));
        set.track(change(ChangeType::Metadata, a2.clone()));
        assert_eq!(set.into_changes(), vec![change(ChangeType::Modified, a2)]);
    }

    #[test]
    fn initial_snapshot_reports_every_document_added() {
        let rooms = query("rooms");
        let mut docs = DocumentSet::new(&rooms);
        docs.insert(doc("rooms/a", 1, &[]));
        docs.insert(doc("rooms/b", 1, &[]));

        let snapshot = ViewSnapshot::from_initial_documents(rooms, docs, DocumentKeySet::new(), true, false);
        assert_eq!(snapshot.doc_changes.len(), 2);
        assert!(snapshot
            .doc_changes
            .iter()
            .all(|change| change.change_type == ChangeType::Added));
        assert!(snapshot.old_docs.is_empty());
        assert_eq!(snapshot.metadata(), SnapshotMetadata::new(true, false));
    }
}
