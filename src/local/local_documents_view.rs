use std::collections::BTreeMap;

use crate::core::Query;
use crate::local::persistence::Transaction;
use crate::local::query_engine::QueryContext;
use crate::model::{
    calculate_overlay_mutation, BatchId, Document, DocumentKey, DocumentKeySet, DocumentMap,
    FieldMask, MutationBatch, MutationKind, Overlay, OverlayedDocument, ResourcePath,
    SnapshotVersion, Timestamp,
};

// Local view reads: cached remote documents with the current user's overlays applied.
impl Transaction<'_> {
    pub fn get_local_document(&self, key: &DocumentKey) -> Document {
        let overlay = self.document_overlays().get_overlay(key);
        let mut document = match overlay {
            Some(overlay) if !matches!(overlay.mutation.kind, MutationKind::Patch { .. }) => {
                Document::new_invalid(key.clone())
            }
            _ => self.remote_documents().get(key),
        };
        if let Some(overlay) = overlay {
            overlay
                .mutation
                .apply_to_local_view(&mut document, Some(FieldMask::empty()), Timestamp::now());
        }
        document
    }

    pub fn get_local_documents(&mut self, keys: &DocumentKeySet) -> DocumentMap {
        let documents = self.remote_documents().get_all(keys);
        self.get_local_view_of_documents(documents, &DocumentKeySet::new())
    }

    /// Applies overlays to `documents`.
    ///
    /// Keys in `existence_state_changed` had their remote document created or deleted;
    /// unless a full overlay hides that, their overlays are recomputed from the queue.
    pub fn get_local_view_of_documents(
        &mut self,
        documents: DocumentMap,
        existence_state_changed: &DocumentKeySet,
    ) -> DocumentMap {
        self.compute_views(documents, existence_state_changed)
            .into_iter()
            .map(|(key, overlayed)| (key, overlayed.document))
            .collect()
    }

    pub fn get_overlayed_documents(
        &mut self,
        documents: DocumentMap,
    ) -> BTreeMap<DocumentKey, OverlayedDocument> {
        self.compute_views(documents, &DocumentKeySet::new())
    }

    /// Local documents matching `query` whose remote read time is after
    /// `since_read_time`, plus every document with an overlay newer than `since_batch_id`.
    pub fn get_documents_matching_query(
        &self,
        query: &Query,
        since_read_time: SnapshotVersion,
        since_batch_id: BatchId,
        mut context: Option<&mut QueryContext>,
    ) -> DocumentMap {
        if query.is_document_query() {
            let Ok(key) = DocumentKey::from_path(query.path().clone()) else {
                return DocumentMap::new();
            };
            let document = self.get_local_document(&key);
            return if document.is_found_document() {
                DocumentMap::from([(key, document)])
            } else {
                DocumentMap::new()
            };
        }

        if let Some(collection_id) = query.collection_group_id() {
            let mut results = DocumentMap::new();
            for parent in self.index_manager().collection_parents(collection_id) {
                let collection = parent.child([collection_id]);
                if !query.path().is_prefix_of(&collection) {
                    continue;
                }
                results.extend(self.collection_documents_matching(
                    query,
                    &collection,
                    since_read_time,
                    since_batch_id,
                    context.as_deref_mut(),
                ));
            }
            return results;
        }

        self.collection_documents_matching(query, query.path(), since_read_time, since_batch_id, context)
    }

    fn collection_documents_matching(
        &self,
        query: &Query,
        collection: &ResourcePath,
        since_read_time: SnapshotVersion,
        since_batch_id: BatchId,
        context: Option<&mut QueryContext>,
    ) -> DocumentMap {
        let overlays = self
            .document_overlays()
            .overlays_for_collection(collection, since_batch_id);
        let mut documents = self
            .remote_documents()
            .documents_in_collection(collection, since_read_time);
        if let Some(context) = context {
            context.documents_read_count += documents.len();
        }
        for key in overlays.keys() {
            documents
                .entry(key.clone())
                .or_insert_with(|| Document::new_invalid(key.clone()));
        }

        documents
            .into_iter()
            .filter_map(|(key, mut document)| {
                if let Some(overlay) = overlays.get(&key) {
                    overlay.mutation.apply_to_local_view(
                        &mut document,
                        Some(FieldMask::empty()),
                        Timestamp::now(),
                    );
                }
                query.matches(&document).then_some((key, document))
            })
            .collect()
    }

    /// Recomputes and stores the overlays of `documents` from every queued batch,
    /// applying those batches to `documents` in place.
    ///
    /// Returns the fields each key's overlay touches (`None` for the whole document).
    pub fn recalculate_and_save_overlays(
        &mut self,
        documents: &mut DocumentMap,
    ) -> BTreeMap<DocumentKey, Option<FieldMask>> {
        let batches: Vec<MutationBatch> = self
            .mutation_queue()
            .all_mutation_batches_affecting_keys(documents.keys())
            .into_iter()
            .cloned()
            .collect();

        let mut masks: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        let mut keys_by_batch: BTreeMap<BatchId, DocumentKeySet> = BTreeMap::new();
        for batch in &batches {
            for key in batch.keys() {
                let Some(base) = documents.get_mut(&key) else {
                    continue;
                };
                let mask = masks.remove(&key).unwrap_or(Some(FieldMask::empty()));
                masks.insert(key.clone(), batch.apply_to_local_view(base, mask));
                keys_by_batch.entry(batch.batch_id).or_default().insert(key);
            }
        }

        // Newest batch first, so each key's overlay is tagged with its largest batch id.
        let mut processed = DocumentKeySet::new();
        for (batch_id, keys) in keys_by_batch.into_iter().rev() {
            let mut overlays = BTreeMap::new();
            for key in keys {
                if !processed.insert(key.clone()) {
                    continue;
                }
                let mask = masks.get(&key).cloned().flatten();
                let overlay = documents
                    .get(&key)
                    .and_then(|document| calculate_overlay_mutation(document, mask.as_ref()));
                if let Some(overlay) = overlay {
                    overlays.insert(key, overlay);
                }
            }
            self.save_overlays(batch_id, overlays);
        }
        masks
    }

    pub fn recalculate_and_save_overlays_for_keys(&mut self, keys: &DocumentKeySet) {
        let mut documents = self.remote_documents().get_all(keys);
        self.recalculate_and_save_overlays(&mut documents);
    }

    fn compute_views(
        &mut self,
        mut documents: DocumentMap,
        existence_state_changed: &DocumentKeySet,
    ) -> BTreeMap<DocumentKey, OverlayedDocument> {
        let overlays: BTreeMap<DocumentKey, Overlay> =
            self.document_overlays().get_overlays(documents.keys());

        let mut recalculate = DocumentMap::new();
        let mut mutated_fields: BTreeMap<DocumentKey, Option<FieldMask>> = BTreeMap::new();
        for (key, document) in documents.iter_mut() {
            let overlay = overlays.get(key);
            let is_patch = overlay
                .map(|overlay| matches!(overlay.mutation.kind, MutationKind::Patch { .. }))
                .unwrap_or(true);
            if existence_state_changed.contains(key) && is_patch {
                recalculate.insert(key.clone(), document.clone());
            } else if let Some(overlay) = overlay {
                let mask = overlay.mutation.field_mask();
                overlay
                    .mutation
                    .apply_to_local_view(document, mask.clone(), Timestamp::now());
                mutated_fields.insert(key.clone(), mask);
            } else {
                mutated_fields.insert(key.clone(), Some(FieldMask::empty()));
            }
        }

        mutated_fields.extend(self.recalculate_and_save_overlays(&mut recalculate));
        documents.extend(recalculate);

        documents
            .into_iter()
            .map(|(key, document)| {
                let mutated_fields = mutated_fields.remove(&key).flatten();
                (
                    key,
                    OverlayedDocument {
                        document,
                        mutated_fields,
                    },
                )
            })
            .collect()
    }
}
