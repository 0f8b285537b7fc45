use std::collections::BTreeMap;

use crate::local::persistence::{StorageChange, Transaction};
use crate::model::{BatchId, DocumentKey, DocumentKeySet, Mutation, Overlay, ResourcePath};

/// One overlay per document key, indexed by the batch that last produced it.
#[derive(Debug, Default)]
pub struct DocumentOverlayCache {
    overlays: BTreeMap<DocumentKey, Overlay>,
    keys_by_batch: BTreeMap<BatchId, DocumentKeySet>,
}

impl DocumentOverlayCache {
    pub fn get_overlay(&self, key: &DocumentKey) -> Option<&Overlay> {
        self.overlays.get(key)
    }

    pub fn get_overlays<'a, I>(&self, keys: I) -> BTreeMap<DocumentKey, Overlay>
    where
        I: IntoIterator<Item = &'a DocumentKey>,
    {
        keys.into_iter()
            .filter_map(|key| self.overlays.get(key).map(|overlay| (key.clone(), overlay.clone())))
            .collect()
    }

    /// Overlays for documents directly inside `collection` produced after `since_batch_id`.
    pub fn overlays_for_collection(
        &self,
        collection: &ResourcePath,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay> {
        let start = DocumentKey::collection_range_start(collection);
        self.overlays
            .range(start..)
            .take_while(|(key, _)| collection.is_prefix_of(key.path()))
            .filter(|(key, overlay)| {
                collection.is_immediate_parent_of(key.path()) && overlay.largest_batch_id > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    pub fn overlays_for_collection_group(
        &self,
        collection_group: &str,
        since_batch_id: BatchId,
    ) -> BTreeMap<DocumentKey, Overlay> {
        self.overlays
            .iter()
            .filter(|(key, overlay)| {
                key.has_collection_id(collection_group) && overlay.largest_batch_id > since_batch_id
            })
            .map(|(key, overlay)| (key.clone(), overlay.clone()))
            .collect()
    }

    pub fn keys_for_batch(&self, batch_id: BatchId) -> DocumentKeySet {
        self.keys_by_batch.get(&batch_id).cloned().unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.overlays.len()
    }

    pub fn is_empty(&self) -> bool {
        self.overlays.is_empty()
    }

    pub(crate) fn put(&mut self, overlay: Overlay) -> Option<Overlay> {
        let key = overlay.key().clone();
        self.keys_by_batch
            .entry(overlay.largest_batch_id)
            .or_default()
            .insert(key.clone());
        let previous = self.overlays.insert(key.clone(), overlay);
        if let Some(previous) = &previous {
            self.unlink(&key, previous.largest_batch_id);
        }
        previous
    }

    pub(crate) fn remove(&mut self, key: &DocumentKey) -> Option<Overlay> {
        let previous = self.overlays.remove(key)?;
        self.unlink(key, previous.largest_batch_id);
        Some(previous)
    }

    fn unlink(&mut self, key: &DocumentKey, batch_id: BatchId) {
        let Some(keys) = self.keys_by_batch.get_mut(&batch_id) else {
            return;
        };
        // A replaced overlay may carry the same batch id as its replacement.
        if self.overlays.get(key).map(|overlay| overlay.largest_batch_id) == Some(batch_id) {
            return;
        }
        keys.remove(key);
        if keys.is_empty() {
            self.keys_by_batch.remove(&batch_id);
        }
    }
}

impl Transaction<'_> {
    /// Stores one overlay per entry of `overlays`, all tagged with `largest_batch_id`.
    pub fn save_overlays(&mut self, largest_batch_id: BatchId, overlays: BTreeMap<DocumentKey, Mutation>) {
        for mutation in overlays.into_values() {
            self.record(StorageChange::PutOverlay {
                user: self.user().to_string(),
                overlay: Overlay::new(largest_batch_id, mutation),
            });
        }
    }

    /// Drops every overlay last produced by `batch_id`.
    pub fn remove_overlays_for_batch_id(&mut self, batch_id: BatchId) {
        for key in self.document_overlays().keys_for_batch(batch_id) {
            self.record(StorageChange::RemoveOverlay {
                user: self.user().to_string(),
                key,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use crate::local::persistence::MemoryPersistence;
    use crate::model::ResourcePath;
    use crate::test_support::{delete_mutation, key, set_mutation};

    #[test]
    fn saving_replaces_the_previous_overlay_for_a_key() {
        let mut persistence = MemoryPersistence::new();
        persistence
            .run_transaction("save", "anonymous", |txn| {
                txn.save_overlays(1, BTreeMap::from([(key("rooms/a"), set_mutation("rooms/a", &[]))]));
                txn.save_overlays(2, BTreeMap::from([(key("rooms/a"), delete_mutation("rooms/a"))]));
                Ok(())
            })
            .unwrap();

        let overlays = persistence.state().user_queues("anonymous").overlays();
        assert_eq!(overlays.len(), 1);
        assert_eq!(overlays.get_overlay(&key("rooms/a")).unwrap().largest_batch_id, 2);
        assert!(overlays.keys_for_batch(1).is_empty());
    }

    #[test]
    fn removes_overlays_by_batch_and_filters_collections() {
        let mut persistence = MemoryPersistence::new();
        persistence
            .run_transaction("save", "anonymous", |txn| {
                txn.save_overlays(
                    1,
                    BTreeMap::from([
                        (key("rooms/a"), set_mutation("rooms/a", &[])),
                        (key("rooms/b"), set_mutation("rooms/b", &[])),
                    ]),
                );
                txn.save_overlays(2, BTreeMap::from([(key("rooms/c"), set_mutation("rooms/c", &[]))]));
                Ok(())
            })
            .unwrap();

        let rooms = ResourcePath::from_string("rooms").unwrap();
        let overlays = persistence.state().user_queues("anonymous").overlays();
        assert_eq!(overlays.overlays_for_collection(&rooms, 1).len(), 1);
        assert_eq!(overlays.overlays_for_collection_group("rooms", 0).len(), 3);

        persistence
            .run_transaction("remove", "anonymous", |txn| {
                txn.remove_overlays_for_batch_id(1);
                Ok(())
            })
            .unwrap();
        let overlays = persistence.state().user_queues("anonymous").overlays();
        assert_eq!(overlays.len(), 1);
        assert!(overlays.get_overlay(&key("rooms/c")).is_some());
    }
}
