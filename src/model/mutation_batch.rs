use std::collections::BTreeMap;

use crate::error::{internal_error, SyncResult};
use crate::model::{
    calculate_overlay_mutation, BatchId, Document, DocumentKey, DocumentKeySet, FieldMask,
    Mutation, MutationResult, SnapshotVersion, Timestamp,
};

/// Document together with the fields its local overlay touched.
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub document: Document,
    /// `None` when the whole document was replaced or deleted locally.
    pub mutated_fields: Option<FieldMask>,
}

/// Writes issued together by one `write` call; sent and acknowledged atomically.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatch {
    pub batch_id: BatchId,
    pub local_write_time: Timestamp,
    /// Patches capturing the pre-write values of non-idempotent transforms.
    pub base_mutations: Vec<Mutation>,
    pub mutations: Vec<Mutation>,
}

impl MutationBatch {
    pub fn new(
        batch_id: BatchId,
        local_write_time: Timestamp,
        base_mutations: Vec<Mutation>,
        mutations: Vec<Mutation>,
    ) -> Self {
        Self {
            batch_id,
            local_write_time,
            base_mutations,
            mutations,
        }
    }

    pub fn keys(&self) -> DocumentKeySet {
        self.mutations
            .iter()
            .map(|mutation| mutation.key.clone())
            .collect()
    }

    pub fn affects_key(&self, key: &DocumentKey) -> bool {
        self.mutations.iter().any(|mutation| &mutation.key == key)
    }

    /// Applies the batch's writes for `document.key()` using the server results.
    pub fn apply_to_remote_document(&self, document: &mut Document, result: &MutationBatchResult) {
        for (index, mutation) in self.mutations.iter().enumerate() {
            if &mutation.key != document.key() {
                continue;
            }
            if let Some(mutation_result) = result.mutation_results.get(index) {
                mutation.apply_to_remote_document(document, mutation_result);
            }
        }
    }

    /// Applies base mutations and then the batch's writes to the local view of `document`.
    pub fn apply_to_local_view(
        &self,
        document: &mut Document,
        mut mutated_fields: Option<FieldMask>,
    ) -> Option<FieldMask> {
        for mutation in self.base_mutations.iter().chain(self.mutations.iter()) {
            if &mutation.key == document.key() {
                mutated_fields =
                    mutation.apply_to_local_view(document, mutated_fields, self.local_write_time);
            }
        }
        mutated_fields
    }

    /// Applies the batch on top of `documents` and returns the resulting overlay per key.
    ///
    /// Keys listed in `documents_without_remote_version` have never been synced, so
    /// their overlay always covers the whole document.
    pub fn apply_to_local_document_set(
        &self,
        documents: &mut BTreeMap<DocumentKey, OverlayedDocument>,
        documents_without_remote_version: &DocumentKeySet,
    ) -> BTreeMap<DocumentKey, Mutation> {
        let mut overlays = BTreeMap::new();
        for mutation in &self.mutations {
            let Some(overlayed) = documents.get_mut(&mutation.key) else {
                continue;
            };
            let mutated_fields =
                self.apply_to_local_view(&mut overlayed.document, overlayed.mutated_fields.take());
            let mutated_fields = if documents_without_remote_version.contains(&mutation.key) {
                None
            } else {
                mutated_fields
            };
            if let Some(overlay) = calculate_overlay_mutation(&overlayed.document, mutated_fields.as_ref()) {
                overlays.insert(mutation.key.clone(), overlay);
            }
            overlayed.mutated_fields = mutated_fields;
            if !overlayed.document.is_valid_document() {
                overlayed
                    .document
                    .convert_to_no_document(SnapshotVersion::min());
            }
        }
        overlays
    }
}

/// Server acknowledgement for a [`MutationBatch`].
#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchResult {
    pub batch: MutationBatch,
    pub commit_version: SnapshotVersion,
    pub mutation_results: Vec<MutationResult>,
    pub stream_token: Vec<u8>,
    /// Version each written document reached, keyed by document.
    pub doc_versions: BTreeMap<DocumentKey, SnapshotVersion>,
}

impl MutationBatchResult {
    pub fn from(
        batch: MutationBatch,
        commit_version: SnapshotVersion,
        mutation_results: Vec<MutationResult>,
        stream_token: Vec<u8>,
    ) -> SyncResult<Self> {
        if batch.mutations.len() != mutation_results.len() {
            return Err(internal_error(format!(
                "Mutations sent {} must equal results received {}",
                batch.mutations.len(),
                mutation_results.len()
            )));
        }

        let doc_versions = batch
            .mutations
            .iter()
            .zip(mutation_results.iter())
            .map(|(mutation, result)| (mutation.key.clone(), result.version))
            .collect();

        Ok(Self {
            batch,
            commit_version,
            mutation_results,
            stream_token,
            doc_versions,
        })
    }

    /// Keys whose acknowledgement carried transform results from the server.
    pub fn keys_with_transform_results(&self) -> DocumentKeySet {
        self.batch
            .mutations
            .iter()
            .zip(self.mutation_results.iter())
            .filter(|(_, result)| !result.transform_results.is_empty())
            .map(|(mutation, _)| mutation.key.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::FieldPath;
    use crate::value::{MapValue, Value};

    fn key(path: &str) -> DocumentKey {
        DocumentKey::from_string(path).unwrap()
    }

    fn data(field: &str, value: Value) -> MapValue {
        let mut map = MapValue::empty();
        map.set(&FieldPath::from_dot_separated(field).unwrap(), value);
        map
    }

    #[test]
    fn result_length_must_match() {
        let batch = MutationBatch::new(
            1,
            Timestamp::now(),
            Vec::new(),
            vec![Mutation::delete(key("rooms/a"))],
        );
        let err = MutationBatchResult::from(batch, SnapshotVersion::min(), Vec::new(), Vec::new())
            .unwrap_err();
        assert_eq!(err.code_str(), "sync/internal");
    }

    #[test]
    fn builds_overlays_for_each_written_key() {
        let batch = MutationBatch::new(
            3,
            Timestamp::now(),
            Vec::new(),
            vec![
                Mutation::set(key("rooms/a"), data("name", Value::from_string("x"))),
                Mutation::delete(key("rooms/b")),
            ],
        );
        let mut documents = BTreeMap::new();
        for path in ["rooms/a", "rooms/b"] {
            documents.insert(
                key(path),
                OverlayedDocument {
                    document: Document::new_invalid(key(path)),
                    mutated_fields: Some(FieldMask::empty()),
                },
            );
        }
        let without_version: DocumentKeySet = [key("rooms/a"), key("rooms/b")].into_iter().collect();
        let overlays = batch.apply_to_local_document_set(&mut documents, &without_version);
        assert_eq!(overlays.len(), 2);
        assert!(overlays[&key("rooms/b")].is_delete());
        assert!(documents[&key("rooms/a")].document.has_local_mutations());
    }
}
